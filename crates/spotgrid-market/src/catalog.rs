//! Static market tables.
//!
//! Loaded once at startup and shared read-only. The built-in catalog covers
//! three regions; a TOML file with the same shape replaces it wholesale.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use spotgrid_core::{InstanceType, Region, Zone};
use spotgrid_state::ResourceShape;

use crate::error::{MarketError, MarketResult};

/// Fixed capacity of one instance type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub cpu: f64,
    pub memory_mb: u64,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default)]
    pub disk_gb: f64,
}

impl InstanceSpec {
    /// True if this instance is at least as large as `shape` in every dimension.
    pub fn dominates(&self, shape: &ResourceShape) -> bool {
        shape.cpu <= self.cpu
            && shape.memory_mb <= self.memory_mb
            && shape.gpu <= self.gpu
            && shape.disk_gb <= self.disk_gb
    }

    pub fn shape(&self) -> ResourceShape {
        ResourceShape {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            gpu: self.gpu,
            disk_gb: self.disk_gb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketCatalog {
    regions: BTreeMap<Region, Vec<Zone>>,
    instances: BTreeMap<InstanceType, InstanceSpec>,
    /// Instance types the provider sells on the spot market, per region.
    supported: BTreeMap<Region, BTreeSet<InstanceType>>,
}

const GB: f64 = 1024.0;

// (type, cpu, memory GB, gpu, disk GB)
const BUILTIN_INSTANCES: &[(&str, f64, f64, u32, f64)] = &[
    ("t2.micro", 1.0, 0.5, 0, 0.0),
    ("t2.small", 1.0, 2.0, 0, 0.0),
    ("t2.medium", 2.0, 4.0, 0, 0.0),
    ("t2.large", 2.0, 8.0, 0, 0.0),
    ("m4.large", 2.0, 8.0, 0, 0.0),
    ("m4.xlarge", 4.0, 16.0, 0, 0.0),
    ("m4.2xlarge", 8.0, 32.0, 0, 0.0),
    ("m4.4xlarge", 16.0, 64.0, 0, 0.0),
    ("m4.10xlarge", 40.0, 160.0, 0, 0.0),
    ("m3.medium", 1.0, 3.75, 0, 4.0),
    ("m3.large", 2.0, 7.5, 0, 32.0),
    ("m3.xlarge", 4.0, 15.0, 0, 80.0),
    ("m3.2xlarge", 8.0, 30.0, 0, 160.0),
    ("c4.large", 2.0, 3.75, 0, 0.0),
    ("c4.xlarge", 4.0, 7.5, 0, 0.0),
    ("c4.2xlarge", 8.0, 15.0, 0, 0.0),
    ("c4.4xlarge", 16.0, 30.0, 0, 0.0),
    ("c4.8xlarge", 36.0, 60.0, 0, 0.0),
    ("c3.large", 2.0, 3.75, 0, 32.0),
    ("c3.xlarge", 4.0, 7.5, 0, 80.0),
    ("c3.2xlarge", 8.0, 15.0, 0, 160.0),
    ("c3.4xlarge", 16.0, 30.0, 0, 320.0),
    ("c3.8xlarge", 32.0, 60.0, 0, 640.0),
    ("g2.2xlarge", 8.0, 15.0, 1, 60.0),
    ("g2.8xlarge", 32.0, 60.0, 4, 240.0),
    ("r3.large", 2.0, 15.25, 0, 32.0),
    ("r3.xlarge", 4.0, 30.5, 0, 80.0),
    ("r3.2xlarge", 8.0, 61.0, 0, 160.0),
    ("r3.4xlarge", 16.0, 122.0, 0, 320.0),
    ("r3.8xlarge", 32.0, 244.0, 0, 640.0),
    ("i2.xlarge", 4.0, 30.5, 0, 800.0),
    ("i2.2xlarge", 8.0, 61.0, 0, 1600.0),
    ("i2.4xlarge", 16.0, 122.0, 0, 3200.0),
    ("i2.8xlarge", 32.0, 244.0, 0, 6400.0),
    ("d2.xlarge", 4.0, 30.5, 0, 6000.0),
    ("d2.2xlarge", 8.0, 61.0, 0, 12000.0),
    ("d2.4xlarge", 16.0, 122.0, 0, 24000.0),
    ("d2.8xlarge", 36.0, 244.0, 0, 48000.0),
    ("cc2.8xlarge", 32.0, 60.5, 0, 1920.0),
    ("cg1.4xlarge", 16.0, 22.5, 0, 1680.0),
    ("cr1.8xlarge", 32.0, 244.0, 0, 240.0),
    ("hi1.4xlarge", 16.0, 60.5, 0, 2048.0),
];

const BUILTIN_REGIONS: &[(&str, &[&str])] = &[
    ("us-east-1", &["us-east-1a", "us-east-1b", "us-east-1c", "us-east-1e"]),
    ("us-west-1", &["us-west-1a", "us-west-1b"]),
    ("us-west-2", &["us-west-2a", "us-west-2b", "us-west-2c"]),
];

/// Families sold on the spot market in every built-in region.
const SPOT_FAMILIES: &[&str] = &[
    "c3", "c4", "cc2", "cg1", "cr1", "d2", "g2", "hi1", "i2", "m3", "m4", "r3",
];

impl MarketCatalog {
    pub fn builtin() -> Self {
        let instances: BTreeMap<InstanceType, InstanceSpec> = BUILTIN_INSTANCES
            .iter()
            .map(|&(name, cpu, mem_gb, gpu, disk_gb)| {
                (
                    InstanceType::from(name),
                    InstanceSpec {
                        cpu,
                        memory_mb: (mem_gb * GB).round() as u64,
                        gpu,
                        disk_gb,
                    },
                )
            })
            .collect();

        let spot: BTreeSet<InstanceType> = instances
            .keys()
            .filter(|t| {
                let family = t.as_str().split('.').next().unwrap_or_default();
                SPOT_FAMILIES.contains(&family)
            })
            .cloned()
            .collect();

        let regions: BTreeMap<Region, Vec<Zone>> = BUILTIN_REGIONS
            .iter()
            .map(|(region, zones)| {
                (
                    Region::from(*region),
                    zones.iter().map(|z| Zone::from(*z)).collect(),
                )
            })
            .collect();

        let supported = regions
            .keys()
            .map(|r| (r.clone(), spot.clone()))
            .collect();

        Self {
            regions,
            instances,
            supported,
        }
    }

    pub fn from_toml(content: &str) -> MarketResult<Self> {
        let catalog: Self =
            toml::from_str(content).map_err(|e| MarketError::Catalog(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_file(path: &Path) -> MarketResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MarketError::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> MarketResult<()> {
        if self.regions.is_empty() {
            return Err(MarketError::Catalog("no regions defined".into()));
        }
        for (region, zones) in &self.regions {
            for zone in zones {
                if &zone.region() != region {
                    return Err(MarketError::Catalog(format!(
                        "zone {zone} does not belong to region {region}"
                    )));
                }
            }
        }
        for (region, types) in &self.supported {
            if !self.regions.contains_key(region) {
                return Err(MarketError::Catalog(format!("unknown region {region}")));
            }
            if let Some(unknown) = types.iter().find(|t| !self.instances.contains_key(*t)) {
                return Err(MarketError::Catalog(format!(
                    "region {region} supports unknown instance type {unknown}"
                )));
            }
        }
        Ok(())
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.keys()
    }

    pub fn zones_in(&self, region: &Region) -> &[Zone] {
        self.regions.get(region).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every zone, grouped by region in region order.
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.regions.values().flatten()
    }

    pub fn instance(&self, instance_type: &InstanceType) -> Option<&InstanceSpec> {
        self.instances.get(instance_type)
    }

    pub fn instance_types(&self) -> impl Iterator<Item = &InstanceType> {
        self.instances.keys()
    }

    /// Instance types large enough for `shape`.
    pub fn fitting(&self, shape: &ResourceShape) -> Vec<InstanceType> {
        self.instances
            .iter()
            .filter(|(_, spec)| spec.dominates(shape))
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn is_supported(&self, zone: &Zone, instance_type: &InstanceType) -> bool {
        self.supported
            .get(&zone.region())
            .is_some_and(|types| types.contains(instance_type))
    }

    /// Known instance types the provider never sells in each zone.
    pub fn unsupported_markets(&self) -> BTreeMap<Zone, BTreeSet<InstanceType>> {
        self.zones()
            .map(|zone| {
                let unsupported = self
                    .instances
                    .keys()
                    .filter(|t| !self.is_supported(zone, t))
                    .cloned()
                    .collect();
                (zone.clone(), unsupported)
            })
            .collect()
    }
}

impl Default for MarketCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(cpu: f64, memory_mb: u64, gpu: u32) -> ResourceShape {
        ResourceShape {
            cpu,
            memory_mb,
            gpu,
            disk_gb: 0.0,
        }
    }

    #[test]
    fn builtin_tables_are_consistent() {
        let catalog = MarketCatalog::builtin();
        catalog.validate().unwrap();
        assert_eq!(catalog.regions().count(), 3);
        assert_eq!(catalog.zones().count(), 9);
        assert_eq!(
            catalog.instance(&InstanceType::from("c4.large")).unwrap().memory_mb,
            3840
        );
        assert_eq!(catalog.zones_in(&Region::from("us-west-1")).len(), 2);
    }

    #[test]
    fn burstable_types_are_statically_unsupported() {
        let catalog = MarketCatalog::builtin();
        let unsupported = catalog.unsupported_markets();
        let zone = Zone::from("us-east-1e");
        assert!(unsupported[&zone].contains(&InstanceType::from("t2.micro")));
        assert!(!unsupported[&zone].contains(&InstanceType::from("m4.large")));
        assert_eq!(unsupported.len(), 9);
    }

    #[test]
    fn fitting_checks_every_dimension() {
        let catalog = MarketCatalog::builtin();
        let gpu = catalog.fitting(&shape(4.0, 8192, 1));
        assert!(gpu.iter().all(|t| t.as_str().starts_with("g2.")));

        let small = catalog.fitting(&shape(1.0, 512, 0));
        assert!(small.contains(&InstanceType::from("t2.micro")));

        let mut disk = shape(1.0, 512, 0);
        disk.disk_gb = 5000.0;
        let big_disk = catalog.fitting(&disk);
        assert!(big_disk.iter().all(|t| {
            let family = t.as_str().split('.').next().unwrap();
            matches!(family, "i2" | "d2")
        }));

        assert!(catalog.fitting(&shape(128.0, 1024, 0)).is_empty());
    }

    #[test]
    fn custom_catalog_from_toml() {
        let catalog = MarketCatalog::from_toml(
            r#"
            [regions]
            "eu-west-1" = ["eu-west-1a"]

            [instances."m4.large"]
            cpu = 2.0
            memory_mb = 8192

            [supported]
            "eu-west-1" = ["m4.large"]
            "#,
        )
        .unwrap();
        assert!(catalog.is_supported(&Zone::from("eu-west-1a"), &InstanceType::from("m4.large")));
        assert!(catalog.unsupported_markets()[&Zone::from("eu-west-1a")].is_empty());
    }

    #[test]
    fn custom_catalog_rejects_misplaced_zone() {
        let err = MarketCatalog::from_toml(
            r#"
            [regions]
            "eu-west-1" = ["us-east-1a"]
            [instances]
            [supported]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MarketError::Catalog(_)));
    }

    #[test]
    fn catalog_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        let rendered = toml::to_string(&MarketCatalog::builtin()).unwrap();
        std::fs::write(&path, rendered).unwrap();
        assert_eq!(MarketCatalog::from_file(&path).unwrap(), MarketCatalog::builtin());
    }
}
