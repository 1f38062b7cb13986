use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Configuration for the light-snapshot server.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub lifecycle: Lifecycle,

    #[serde(default)]
    pub fleet: Fleet,

    #[serde(default)]
    pub sim: Sim,

    #[serde(default, rename = "host")]
    pub hosts: Vec<Host>,
}

impl Config {
    /// Constructs a new configuration object.
    ///
    /// Typically, the configuration is parsed from a config
    /// file via [`parse`], but this method allows an alternative
    /// mechanism for initialization.
    pub fn new(lifecycle: Lifecycle, fleet: Fleet, hosts: Vec<Host>) -> Config {
        Config { lifecycle, fleet, sim: Sim::default(), hosts }
    }
}

/// Knobs for single-instance transitions.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct Lifecycle {
    /// Deadline applied to a hypervisor call when the caller supplies none.
    pub hypervisor_timeout_ms: u64,

    /// How many times an idempotent chain-store operation is attempted before
    /// its failure is surfaced.
    pub store_retry_attempts: u32,

    /// Initial backoff between chain-store attempts; doubles each retry.
    pub store_retry_initial_ms: u64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            hypervisor_timeout_ms: 5 * 60 * 1000,
            store_retry_attempts: 5,
            store_retry_initial_ms: 20,
        }
    }
}

impl Lifecycle {
    pub fn hypervisor_timeout(&self) -> Duration {
        Duration::from_millis(self.hypervisor_timeout_ms)
    }

    pub fn store_retry_initial(&self) -> Duration {
        Duration::from_millis(self.store_retry_initial_ms)
    }
}

/// Knobs for fleet-wide snapshot batches.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct Fleet {
    /// Instances on one host snapshotted at the same time.
    pub host_workers: usize,

    /// Hosts worked on at the same time within one batch.
    pub max_concurrent_hosts: usize,

    /// Number of batch reports kept around for queries.
    pub batch_history: usize,
}

impl Default for Fleet {
    fn default() -> Self {
        Self { host_workers: 4, max_concurrent_hosts: 16, batch_history: 32 }
    }
}

/// Behavior of the simulated hypervisor the stock server drives.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct Sim {
    /// Time each simulated hypervisor call takes.
    pub latency_ms: u64,

    /// Hosts on which every simulated hypervisor call fails.
    pub failing_hosts: Vec<String>,
}

impl Default for Sim {
    fn default() -> Self {
        Self { latency_ms: 50, failing_hosts: Vec::new() }
    }
}

/// A compute host and the instances placed on it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Host {
    pub name: String,

    #[serde(default)]
    pub instances: Vec<Uuid>,
}

/// Errors which may be returned when parsing the server configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instance {0} is listed under more than one host")]
    DuplicateInstance(Uuid),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

/// Parses TOML text into a configuration object and checks that it describes
/// a usable fleet.
pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ParseError> {
    if cfg.fleet.host_workers == 0 {
        return Err(ParseError::InvalidValue(
            "fleet.host_workers",
            "must be at least 1".to_string(),
        ));
    }
    if cfg.fleet.max_concurrent_hosts == 0 {
        return Err(ParseError::InvalidValue(
            "fleet.max_concurrent_hosts",
            "must be at least 1".to_string(),
        ));
    }
    if cfg.lifecycle.store_retry_attempts == 0 {
        return Err(ParseError::InvalidValue(
            "lifecycle.store_retry_attempts",
            "must be at least 1".to_string(),
        ));
    }

    let mut seen = std::collections::BTreeSet::new();
    for id in cfg.hosts.iter().flat_map(|h| h.instances.iter()) {
        if !seen.insert(*id) {
            return Err(ParseError::DuplicateInstance(*id));
        }
    }
    Ok(())
}
