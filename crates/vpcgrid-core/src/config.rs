//! vpcd.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working single-zone configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VpcGridConfig {
    pub store: StoreConfig,
    pub lifecycle: LifecycleConfig,
    pub health: HealthConfig,
    pub reconcile: ReconcileConfig,
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file, relative to the data directory.
    pub file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("vpcgrid.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Bound on boot plus first health check.
    pub provision_timeout: String,
    /// Boot attempts before a router settles `Failed`.
    pub max_provision_attempts: u32,
    /// How long a VPC may stay without a router before the supervisor
    /// provisions a replacement.
    pub recreate_grace: String,
    /// Supervisor sweep interval.
    pub supervise_interval: String,
    /// Consecutive failed creates after which the supervisor stops
    /// recreating a VPC's router and leaves it `Failed`.
    pub max_recreate_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provision_timeout: "60s".to_string(),
            max_provision_attempts: 3,
            recreate_grace: "30s".to_string(),
            supervise_interval: "5s".to_string(),
            max_recreate_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    pub timeout: String,
    /// Consecutive failed checks before a router may be declared lost.
    pub unhealthy_threshold: u32,
    /// Time without a successful check before a router is declared lost.
    pub grace_period: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            unhealthy_threshold: 3,
            grace_period: "20s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Bound on each agent call made during a resync.
    pub push_timeout: String,
    /// Pending rule failures on one network before it is marked degraded.
    pub degraded_threshold: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            push_timeout: "10s".to_string(),
            degraded_threshold: 3,
        }
    }
}

/// A zone and the public address range its pool hands out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZoneConfig {
    pub id: String,
    pub public_range: String,
}

impl VpcGridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: VpcGridConfig = toml::from_str(content)?;
        if config.zones.is_empty() {
            config.zones = default_zones();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// A configuration with all defaults and the default zone.
    pub fn standalone() -> Self {
        Self {
            zones: default_zones(),
            ..Default::default()
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("lifecycle.provision_timeout", &self.lifecycle.provision_timeout),
            ("lifecycle.recreate_grace", &self.lifecycle.recreate_grace),
            ("lifecycle.supervise_interval", &self.lifecycle.supervise_interval),
            ("health.interval", &self.health.interval),
            ("health.timeout", &self.health.timeout),
            ("health.grace_period", &self.health.grace_period),
            ("reconcile.push_timeout", &self.reconcile.push_timeout),
        ] {
            if parse_duration(value).is_none() {
                anyhow::bail!("{name}: invalid duration {value:?}");
            }
        }
        if self.lifecycle.max_provision_attempts == 0 {
            anyhow::bail!("lifecycle.max_provision_attempts must be at least 1");
        }
        for zone in &self.zones {
            crate::cidr::parse_cidr(&zone.public_range)
                .map_err(|e| anyhow::anyhow!("zone {}: {e}", zone.id))?;
        }
        Ok(())
    }
}

impl LifecycleConfig {
    pub fn provision_timeout(&self) -> Duration {
        parse_duration(&self.provision_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn recreate_grace(&self) -> Duration {
        parse_duration(&self.recreate_grace).unwrap_or(Duration::from_secs(30))
    }

    pub fn supervise_interval(&self) -> Duration {
        parse_duration(&self.supervise_interval).unwrap_or(Duration::from_secs(5))
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(2))
    }

    pub fn grace_period(&self) -> Duration {
        parse_duration(&self.grace_period).unwrap_or(Duration::from_secs(20))
    }
}

impl ReconcileConfig {
    pub fn push_timeout(&self) -> Duration {
        parse_duration(&self.push_timeout).unwrap_or(Duration::from_secs(10))
    }
}

fn default_zones() -> Vec<ZoneConfig> {
    vec![ZoneConfig {
        id: "zone-1".to_string(),
        public_range: "192.0.2.0/24".to_string(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = VpcGridConfig::parse("").unwrap();
        assert_eq!(config.lifecycle.max_provision_attempts, 3);
        assert_eq!(config.lifecycle.max_recreate_attempts, 3);
        assert_eq!(config.health.interval(), Duration::from_secs(5));
        assert_eq!(config.zones.len(), 1);
        assert_eq!(config.zones[0].id, "zone-1");
    }

    #[test]
    fn parse_overrides() {
        let toml_str = r#"
[lifecycle]
provision_timeout = "500ms"
max_provision_attempts = 5
max_recreate_attempts = 1

[health]
grace_period = "1m"

[[zones]]
id = "zone-a"
public_range = "203.0.113.0/28"
"#;
        let config = VpcGridConfig::parse(toml_str).unwrap();
        assert_eq!(config.lifecycle.provision_timeout(), Duration::from_millis(500));
        assert_eq!(config.lifecycle.max_provision_attempts, 5);
        assert_eq!(config.lifecycle.max_recreate_attempts, 1);
        assert_eq!(config.health.grace_period(), Duration::from_secs(60));
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.zones[0].id, "zone-a");
    }

    #[test]
    fn rejects_bad_duration() {
        let err = VpcGridConfig::parse("[health]\ninterval = \"often\"\n").unwrap_err();
        assert!(err.to_string().contains("health.interval"));
    }

    #[test]
    fn rejects_bad_zone_range() {
        let toml_str = "[[zones]]\nid = \"z\"\npublic_range = \"nope\"\n";
        assert!(VpcGridConfig::parse(toml_str).is_err());
    }

    #[test]
    fn standalone_serializes() {
        let config = VpcGridConfig::standalone();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("zone-1"));
        assert!(toml_str.contains("recreate_grace"));
    }
}
