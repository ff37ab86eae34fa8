//! Per-user cloud account wiring.
//!
//! Network and key material is looked up explicitly by region or zone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::market::{Region, Zone};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CloudAccount {
    #[serde(default)]
    pub vpc_ids: BTreeMap<Region, String>,
    #[serde(default)]
    pub security_group_ids: BTreeMap<Region, String>,
    #[serde(default)]
    pub subnet_ids: BTreeMap<Zone, String>,
    #[serde(default)]
    pub ssh_keys: BTreeMap<Region, String>,
}

impl CloudAccount {
    pub fn vpc(&self, region: &Region) -> Option<&str> {
        self.vpc_ids.get(region).map(String::as_str)
    }

    pub fn security_group(&self, region: &Region) -> Option<&str> {
        self.security_group_ids.get(region).map(String::as_str)
    }

    pub fn subnet(&self, zone: &Zone) -> Option<&str> {
        self.subnet_ids.get(zone).map(String::as_str)
    }

    pub fn ssh_key(&self, region: &Region) -> Option<&str> {
        self.ssh_keys.get(region).map(String::as_str)
    }

    /// Wire every given zone (and its region) with synthetic identifiers.
    pub fn wired_for<'a>(zones: impl IntoIterator<Item = &'a Zone>) -> Self {
        let mut account = Self::default();
        for zone in zones {
            let region = zone.region();
            account
                .subnet_ids
                .insert(zone.clone(), format!("subnet-{zone}"));
            account
                .vpc_ids
                .entry(region.clone())
                .or_insert_with(|| format!("vpc-{region}"));
            account
                .security_group_ids
                .entry(region.clone())
                .or_insert_with(|| format!("sg-{region}"));
            account
                .ssh_keys
                .entry(region.clone())
                .or_insert_with(|| format!("key-{region}"));
        }
        account
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wired_for_covers_zone_and_region() {
        let zones = [Zone::from("us-west-1a"), Zone::from("us-west-1b")];
        let account = CloudAccount::wired_for(&zones);
        assert_eq!(account.subnet(&zones[1]), Some("subnet-us-west-1b"));
        let region = Region::from("us-west-1");
        assert_eq!(account.ssh_key(&region), Some("key-us-west-1"));
        assert_eq!(account.vpc(&region), Some("vpc-us-west-1"));
        assert_eq!(account.security_group(&region), Some("sg-us-west-1"));
        assert!(account.subnet(&Zone::from("us-east-1a")).is_none());
    }

    #[test]
    fn missing_maps_deserialize_empty() {
        let account: CloudAccount = serde_json::from_str("{}").unwrap();
        assert!(account.ssh_keys.is_empty());
    }
}
