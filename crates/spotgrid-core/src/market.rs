//! Market identity types.
//!
//! A spot market is the pair `(Zone, InstanceType)`. Zones belong to a
//! region whose name is the zone name without its trailing letter
//! (`us-east-1a` → `us-east-1`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A cloud region, e.g. `us-west-2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Region(pub String);

/// An availability zone, e.g. `us-west-2b`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Zone(pub String);

/// A provider instance type, e.g. `m4.large`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceType(pub String);

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Zone {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The region this zone belongs to.
    pub fn region(&self) -> Region {
        let mut name = self.0.clone();
        name.pop();
        Region(name)
    }
}

impl InstanceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Region {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for Zone {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for InstanceType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn zone_region_strips_suffix() {
        assert_eq!(Zone::from("us-east-1e").region(), Region::from("us-east-1"));
        assert_eq!(Zone::from("us-west-2b").region(), Region::from("us-west-2"));
    }

    #[test]
    fn newtypes_serialize_as_plain_strings() {
        let mut subnets = BTreeMap::new();
        subnets.insert(Zone::from("us-west-1a"), "subnet-1".to_string());
        let json = serde_json::to_string(&subnets).unwrap();
        assert_eq!(json, r#"{"us-west-1a":"subnet-1"}"#);

        let back: BTreeMap<Zone, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subnets);
    }
}
