/*!
 * Server Configuration
 *
 * Process-wide settings read once at startup. Every field has a default;
 * any of them can be overridden through a `NIETZSCHE_*` environment variable.
 */

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while loading or validating configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
    #[error("unsupported protocol {0:?} (only \"tcp\" is supported)")]
    Protocol(String),
    #[error("unknown eviction policy {0:?}")]
    EvictionPolicy(String),
    #[error("unknown server mode {0:?}")]
    Mode(String),
    #[error("{0}")]
    OutOfRange(&'static str),
}

/// Which keys are candidates when a shard runs out of room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Drop keys in the map's own iteration order
    AllKeysRandom,
    /// Drop the least recently used keys of a random sample
    AllKeysLru,
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allkeys-random" => Ok(Self::AllKeysRandom),
            "allkeys-lru" => Ok(Self::AllKeysLru),
            _ => Err(ConfigError::EvictionPolicy(s.to_string())),
        }
    }
}

/// Threading shape of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Listeners, IOHandlers and shard-owning Workers on separate threads
    Multi,
    /// Accept, read, execute and expire on one thread
    Single,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multi" => Ok(Self::Multi),
            "single" => Ok(Self::Single),
            _ => Err(ConfigError::Mode(s.to_string())),
        }
    }
}

/// Per-shard storage limits, handed to every `Store`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    pub max_keys: usize,
    pub eviction_ratio: f64,
    pub eviction_policy: EvictionPolicy,
    pub lru_sample_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_keys: 1_000_000,
            eviction_ratio: 0.1,
            eviction_policy: EvictionPolicy::AllKeysRandom,
            lru_sample_size: 5,
        }
    }
}

impl StoreConfig {
    /// Number of keys one eviction pass tries to remove
    ///
    /// Never zero, so an insert into a full shard always makes room.
    pub fn eviction_quota(&self) -> usize {
        let quota = (self.eviction_ratio * self.max_keys as f64).ceil() as usize;
        quota.max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub protocol: String,
    pub bind: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub store: StoreConfig,
    pub mode: Mode,
    pub io_handlers: usize,
    pub workers: usize,
    pub listeners: usize,
    pub queue_capacity: usize,
    pub active_expire_frequency: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let half = std::thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(2)
            .max(1);
        Self {
            protocol: "tcp".to_string(),
            bind: IpAddr::from([0, 0, 0, 0]),
            port: crate::DEFAULT_PORT,
            max_connections: 20_000,
            store: StoreConfig::default(),
            mode: Mode::Multi,
            io_handlers: half,
            workers: half,
            listeners: 1,
            queue_capacity: 1024,
            active_expire_frequency: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Build a configuration from defaults overridden by `NIETZSCHE_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] but with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(v) = lookup("NIETZSCHE_PROTOCOL") {
            if !v.eq_ignore_ascii_case("tcp") {
                return Err(ConfigError::Protocol(v));
            }
            cfg.protocol = v.to_ascii_lowercase();
        }
        override_parsed(&lookup, "NIETZSCHE_BIND", &mut cfg.bind)?;
        override_parsed(&lookup, "NIETZSCHE_PORT", &mut cfg.port)?;
        override_parsed(&lookup, "NIETZSCHE_MAX_CONNECTIONS", &mut cfg.max_connections)?;
        override_parsed(&lookup, "NIETZSCHE_MAX_KEYS", &mut cfg.store.max_keys)?;
        override_parsed(&lookup, "NIETZSCHE_EVICTION_RATIO", &mut cfg.store.eviction_ratio)?;
        if let Some(v) = lookup("NIETZSCHE_EVICTION_POLICY") {
            cfg.store.eviction_policy = v.parse()?;
        }
        override_parsed(&lookup, "NIETZSCHE_LRU_SAMPLE_SIZE", &mut cfg.store.lru_sample_size)?;
        if let Some(v) = lookup("NIETZSCHE_MODE") {
            cfg.mode = v.parse()?;
        }
        override_parsed(&lookup, "NIETZSCHE_IO_HANDLERS", &mut cfg.io_handlers)?;
        override_parsed(&lookup, "NIETZSCHE_WORKERS", &mut cfg.workers)?;
        override_parsed(&lookup, "NIETZSCHE_LISTENERS", &mut cfg.listeners)?;
        override_parsed(&lookup, "NIETZSCHE_QUEUE_CAPACITY", &mut cfg.queue_capacity)?;

        let mut expire_ms = cfg.active_expire_frequency.as_millis() as u64;
        override_parsed(&lookup, "NIETZSCHE_ACTIVE_EXPIRE_MS", &mut expire_ms)?;
        cfg.active_expire_frequency = Duration::from_millis(expire_ms);

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_handlers == 0 || self.workers == 0 || self.listeners == 0 {
            return Err(ConfigError::OutOfRange(
                "io handler, worker and listener counts must be at least 1",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::OutOfRange("queue capacity must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange("max connections must be at least 1"));
        }
        if self.store.max_keys == 0 {
            return Err(ConfigError::OutOfRange("max keys per shard must be at least 1"));
        }
        if !(self.store.eviction_ratio > 0.0 && self.store.eviction_ratio <= 1.0) {
            return Err(ConfigError::OutOfRange("eviction ratio must be in (0, 1]"));
        }
        if self.store.lru_sample_size == 0 {
            return Err(ConfigError::OutOfRange("lru sample size must be at least 1"));
        }
        if self.active_expire_frequency.is_zero() {
            return Err(ConfigError::OutOfRange("active expire frequency must be non-zero"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn override_parsed<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(var) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value })?;
    }
    Ok(())
}
