//! Pool configuration
//!
//! Pools are described in YAML:
//!
//! ```yaml
//! id_pools:
//!   - name: vlan
//!     range: { start: 100, end: 199 }
//!     excludes:
//!       - { start: 150, end: 159 }
//!     alarms: { enabled: true, low_threshold: 20 }
//! ip_pools:
//!   - name: lan
//!     subnets: ["10.0.0.0/24", "2001:db8::/64"]
//!     excludes: ["10.0.0.0/30"]
//! ```
//!
//! Subnets are kept as strings until a pool is built so that one malformed
//! pool does not stop the rest of the file from loading.

use crate::alarm::DEFAULT_LOW_THRESHOLD;
use crate::models::{Range, Subnet};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Alarm settings for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Percentage of the pool at or below which the low alarm is raised
    #[serde(default = "default_low_threshold")]
    pub low_threshold: u32,
}

fn default_low_threshold() -> u32 {
    DEFAULT_LOW_THRESHOLD as u32
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            low_threshold: default_low_threshold(),
        }
    }
}

impl AlarmConfig {
    /// Threshold as a percentage, rejecting values above 100
    pub fn threshold(&self) -> Result<u8> {
        u8::try_from(self.low_threshold)
            .ok()
            .filter(|t| *t <= 100)
            .ok_or_else(|| {
                Error::InvalidRange(format!(
                    "low threshold must be within [0-100], got {}",
                    self.low_threshold
                ))
            })
    }
}

/// Integer id pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPoolConfig {
    pub name: String,
    pub range: Range<u64>,
    #[serde(default)]
    pub excludes: Vec<Range<u64>>,
    /// Whether requests in this pool may join sync groups
    #[serde(default = "default_sync")]
    pub sync: bool,
    #[serde(default)]
    pub alarms: AlarmConfig,
}

fn default_sync() -> bool {
    true
}

impl IdPoolConfig {
    pub fn new(name: impl Into<String>, range: Range<u64>) -> Self {
        Self {
            name: name.into(),
            range,
            excludes: Vec::new(),
            sync: true,
            alarms: AlarmConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_name(&self.name)?;
        self.alarms.threshold()?;
        Ok(())
    }
}

/// IP address pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPoolConfig {
    pub name: String,
    /// CIDR strings, e.g. `10.0.0.0/24`
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub alarms: AlarmConfig,
}

impl IpPoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnets: Vec::new(),
            excludes: Vec::new(),
            alarms: AlarmConfig::default(),
        }
    }

    pub fn subnet(mut self, cidr: impl Into<String>) -> Self {
        self.subnets.push(cidr.into());
        self
    }

    pub fn exclude(mut self, cidr: impl Into<String>) -> Self {
        self.excludes.push(cidr.into());
        self
    }

    /// Parsed subnets
    pub fn parsed_subnets(&self) -> Result<Vec<Subnet>> {
        self.subnets.iter().map(|s| s.parse()).collect()
    }

    /// Parsed excludes
    pub fn parsed_excludes(&self) -> Result<Vec<Subnet>> {
        self.excludes.iter().map(|s| s.parse()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        check_name(&self.name)?;
        self.alarms.threshold()?;
        let subnets = self.parsed_subnets()?;
        self.parsed_excludes()?;

        for (i, a) in subnets.iter().enumerate() {
            if let Some(b) = subnets[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(Error::InvalidRange(format!(
                    "subnet {} overlaps {} in pool {}",
                    a, b, self.name
                )));
            }
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Config("pool name must not be empty".to_string()));
    }
    Ok(())
}

/// Every pool the engine should run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub id_pools: Vec<IdPoolConfig>,
    #[serde(default)]
    pub ip_pools: Vec<IpPoolConfig>,
}

impl EngineConfig {
    /// Parse YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write as YAML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    /// Names that appear more than once across both pool kinds
    pub fn duplicate_names(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut dups = BTreeSet::new();
        let names = self
            .id_pools
            .iter()
            .map(|p| &p.name)
            .chain(self.ip_pools.iter().map(|p| &p.name));
        for name in names {
            if !seen.insert(name.clone()) {
                dups.insert(name.clone());
            }
        }
        dups
    }

    /// Validate every pool, stopping at the first problem
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self.duplicate_names().into_iter().next() {
            return Err(Error::Config(format!("duplicate pool name {}", name)));
        }
        for pool in &self.id_pools {
            pool.validate()?;
        }
        for pool in &self.ip_pools {
            pool.validate()?;
        }
        Ok(())
    }
}
