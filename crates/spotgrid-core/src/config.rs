//! spotgrid.toml configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotgridConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub provisioner: ProvisionerConfig,
    pub market: MarketConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub framework_name: String,
    pub event_queue_capacity: usize,
    #[serde(with = "serde_str")]
    pub decline_refusal: Duration,
    #[serde(with = "serde_str")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub instance_tag: String,
    pub queue_capacity: usize,
    #[serde(with = "serde_str")]
    pub provision_interval: Duration,
    #[serde(with = "serde_str")]
    pub health_interval: Duration,
    #[serde(with = "serde_str")]
    pub reconcile_interval: Duration,
    /// Unknown cloud instances younger than this are left alone.
    #[serde(with = "serde_str")]
    pub unknown_instance_grace: Duration,
    #[serde(with = "serde_str")]
    pub spot_poll: Duration,
    #[serde(with = "serde_str")]
    pub spot_timeout: Duration,
    #[serde(with = "serde_str")]
    pub instance_poll: Duration,
    #[serde(with = "serde_str")]
    pub instance_timeout: Duration,
    #[serde(with = "serde_str")]
    pub agent_setup_window: Duration,
    #[serde(with = "serde_str")]
    pub agent_retry: Duration,
    pub master_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    #[serde(with = "serde_str")]
    pub unavailable_ttl: Duration,
    pub bid_buffer: f64,
    pub price_ceiling: f64,
    /// Optional TOML file replacing the built-in market catalog.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/spotgrid"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            framework_name: "spotgrid".to_string(),
            event_queue_capacity: 10 * 1024,
            decline_refusal: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            instance_tag: "spotgrid".to_string(),
            queue_capacity: 1024,
            provision_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(60),
            unknown_instance_grace: Duration::from_secs(10 * 60),
            spot_poll: Duration::from_secs(5),
            spot_timeout: Duration::from_secs(3 * 60),
            instance_poll: Duration::from_secs(5),
            instance_timeout: Duration::from_secs(5 * 60),
            agent_setup_window: Duration::from_secs(7 * 60),
            agent_retry: Duration::from_secs(10),
            master_address: "127.0.0.1:5050".to_string(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            unavailable_ttl: Duration::from_secs(15 * 60),
            bid_buffer: 1.25,
            price_ceiling: 2.0,
            catalog_file: None,
        }
    }
}

impl SpotgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: SpotgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would stall a loop or make every bid fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.provisioner;
        for (name, value) in [
            ("provisioner.provision_interval", p.provision_interval),
            ("provisioner.health_interval", p.health_interval),
            ("provisioner.reconcile_interval", p.reconcile_interval),
            ("provisioner.spot_poll", p.spot_poll),
            ("provisioner.instance_poll", p.instance_poll),
            ("scheduler.sweep_interval", self.scheduler.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.scheduler.event_queue_capacity == 0 || p.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }
        if self.market.bid_buffer < 1.0 {
            return Err(ConfigError::Invalid("market.bid_buffer must be >= 1.0".into()));
        }
        if self.market.price_ceiling <= 0.0 {
            return Err(ConfigError::Invalid("market.price_ceiling must be positive".into()));
        }
        Ok(())
    }
}
