//! # Application Configuration
//!
//! Loading, validation and default generation of the miner configuration.
//! Settings live in a TOML file managed by `confy`.
//!
//! ## Structure
//! - `PoolConfig`: where to mine and as whom.
//! - `MinerConfig`: worker threads, intensity and hashing algorithm.
//! - `TimeoutsConfig`: connect, authorize, submit and drain bounds.
//! - `ReconnectConfig`: backoff after a lost pool connection.
//! - `LoggingConfig`: log level and how often a status line is printed.
//!
//! A missing file is created with default values, and a copy is saved as
//! `Config.toml.example` in the current directory.

use pool_mining_engine::{EngineOptions, ReconnectPolicy, ShutdownSettings, WorkerConfig, ALGORITHMS, DEFAULT_BATCH_SIZE};
use pool_stratum_connector::{ClientSettings, PoolEndpoint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const APP_NAME: &str = "pool_miner";
pub const CONFIG_NAME: &str = "Config";
pub const EXAMPLE_FILE_NAME: &str = "Config.toml.example";

/// Top-level configuration. Every section may be omitted from the file.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load the configuration from `path_override`, or from `confy`'s
    /// platform location for "pool_miner" / "Config.toml".
    ///
    /// A missing file is created with default values (plus an example copy in
    /// the current directory) and the defaults are returned. Keys missing
    /// from an existing file are filled in and written back. A file that does
    /// not parse is left untouched and the error is returned.
    pub fn load(path_override: Option<&str>) -> Result<Self, confy::ConfyError> {
        let path = Self::resolve_path(path_override)?;

        if !path.exists() {
            warn!(path = %path.display(), "Configuration file not found, creating one with default values");
            let defaults = Self::default();
            confy::store_path(&path, defaults.clone())?;
            info!(
                path = %path.display(),
                "Created default configuration. Set [pool] host, port and username, then restart the miner"
            );
            Self::write_example(Path::new(EXAMPLE_FILE_NAME));
            return Ok(defaults);
        }

        info!(path = %path.display(), "Loading configuration");
        let config: Self = match confy::load_path(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Configuration file is invalid");
                return Err(e);
            }
        };
        debug!("Loaded configuration: {:?}", config);

        if let Err(e) = confy::store_path(&path, config.clone()) {
            warn!(path = %path.display(), error = %e, "Could not write back the completed configuration");
        }
        Ok(config)
    }

    /// Write the default configuration to `path_override` (or the default
    /// location), replacing any existing file. Returns where it was written.
    pub fn generate(path_override: Option<&str>) -> Result<PathBuf, confy::ConfyError> {
        let path = Self::resolve_path(path_override)?;
        confy::store_path(&path, Self::default())?;
        info!(path = %path.display(), "Default configuration written");
        Ok(path)
    }

    fn resolve_path(path_override: Option<&str>) -> Result<PathBuf, confy::ConfyError> {
        match path_override {
            Some(p) => Ok(PathBuf::from(p)),
            None => confy::get_configuration_file_path(APP_NAME, Some(CONFIG_NAME)),
        }
    }

    fn write_example(path: &Path) {
        match confy::store_path(path, Self::default()) {
            Ok(()) => info!(path = %path.display(), "Example configuration saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to save example configuration"),
        }
    }

    /// Build engine options from this configuration. `threads` and
    /// `intensity` must already be validated.
    pub fn engine_options(&self, threads: usize, intensity: f64) -> EngineOptions {
        let defaults = ClientSettings::default();
        let client = ClientSettings {
            client_name: self.pool.client_name.clone().unwrap_or(defaults.client_name),
            connect_timeout: Duration::from_secs(self.timeouts.connect_secs.max(1)),
            auth_wait: Duration::from_secs(self.timeouts.auth_wait_secs.max(1)),
            auth_resend_interval: match self.timeouts.auth_resend_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            submit_timeout: Duration::from_secs(self.timeouts.submit_secs.max(1)),
            ..defaults
        };

        EngineOptions {
            client,
            workers: WorkerConfig {
                threads,
                intensity,
                batch_size: self.miner.batch_size.max(1),
            },
            algorithm: self.miner.algorithm.clone(),
            queue_warn_depth: self.miner.queue_warn_depth.max(1),
            shutdown: ShutdownSettings {
                drain_window: Duration::from_millis(self.timeouts.drain_ms),
                ..ShutdownSettings::default()
            },
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
                max_backoff: Duration::from_secs(self.reconnect.max_backoff_secs),
            },
            stats_interval: Duration::from_secs(self.logging.stats_interval_secs.max(1)),
        }
    }
}

/// Pool address and worker credentials.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_pool_host")]
    pub host: String,
    #[serde(default = "default_pool_port")]
    pub port: u16,
    /// Worker name, usually `account.rig`. **Must be set by the user.**
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_pool_password")]
    pub password: String,
    /// Overrides the client name sent with `mining.subscribe`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

fn default_pool_host() -> String { "127.0.0.1".to_string() }
fn default_pool_port() -> u16 { 3333 }
fn default_pool_password() -> String { "x".to_string() }

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            host: default_pool_host(),
            port: default_pool_port(),
            username: String::new(),
            password: default_pool_password(),
            client_name: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MinerConfig {
    /// Worker threads. 0 means all logical cores minus `reserved_cores`.
    #[serde(default)]
    pub threads: usize,
    /// Cores left free when `threads` is 0.
    #[serde(default)]
    pub reserved_cores: usize,
    /// Fraction of time spent hashing, in `(0, 1]`.
    #[serde(default = "default_intensity")]
    pub intensity: f64,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Queue depth at which a backlog warning is logged.
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,
    /// Hashes between cancellation checks.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_intensity() -> f64 { 1.0 }
fn default_algorithm() -> String { "chained".to_string() }
fn default_queue_warn_depth() -> usize { 256 }
fn default_batch_size() -> u32 { DEFAULT_BATCH_SIZE }

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            threads: 0,
            reserved_cores: 0,
            intensity: default_intensity(),
            algorithm: default_algorithm(),
            queue_warn_depth: default_queue_warn_depth(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_auth_wait_secs")]
    pub auth_wait_secs: u64,
    /// How long queued shares may still be submitted during shutdown.
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    #[serde(default = "default_submit_secs")]
    pub submit_secs: u64,
    /// Re-send `mining.authorize` on this interval while unanswered. 0 disables.
    #[serde(default)]
    pub auth_resend_secs: u64,
}

fn default_connect_secs() -> u64 { 10 }
fn default_auth_wait_secs() -> u64 { 15 }
fn default_drain_ms() -> u64 { 2000 }
fn default_submit_secs() -> u64 { 5 }

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            connect_secs: default_connect_secs(),
            auth_wait_secs: default_auth_wait_secs(),
            drain_ms: default_drain_ms(),
            submit_secs: default_submit_secs(),
            auth_resend_secs: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_max_attempts() -> u32 { 10 }
fn default_initial_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_secs() -> u64 { 30 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Seconds between status lines.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_log_level() -> String { "info".to_string() }
fn default_stats_interval_secs() -> u64 { 30 }

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

/// Checks the pool section and turns it into an endpoint.
pub fn validate_pool_endpoint(pool: &PoolConfig) -> Result<PoolEndpoint, String> {
    if pool.host.trim().is_empty() {
        return Err("Pool host cannot be empty.".to_string());
    }
    if pool.port == 0 {
        return Err("Pool port cannot be 0.".to_string());
    }
    if pool.username.trim().is_empty() {
        return Err("Pool username is empty. Set [pool] username or pass --user.".to_string());
    }
    Ok(PoolEndpoint::new(
        pool.host.trim(),
        pool.port,
        pool.username.trim(),
        pool.password.clone(),
    ))
}

pub fn validate_intensity(intensity: f64) -> Result<f64, String> {
    if intensity.is_finite() && intensity > 0.0 && intensity <= 1.0 {
        Ok(intensity)
    } else {
        Err(format!("Intensity must be in (0, 1], got {}.", intensity))
    }
}

pub fn validate_algorithm(name: &str) -> Result<(), String> {
    let normalized = name.trim().to_ascii_lowercase();
    if ALGORITHMS.contains(&normalized.as_str()) {
        Ok(())
    } else {
        Err(format!("Unknown algorithm '{}'. Expected one of: {}.", name, ALGORITHMS.join(", ")))
    }
}

/// Validates and corrects the number of mining threads.
///
/// - `0` means auto: all logical cores minus `reserved_cores`, at least 1.
/// - More threads than logical cores are capped to the core count.
pub fn validate_and_correct_threads(threads_from_config: usize, reserved_cores: usize) -> usize {
    let logical_cores = num_cpus::get().max(1);
    if threads_from_config == 0 {
        let auto = logical_cores.saturating_sub(reserved_cores).max(1);
        info!(logical_cores, reserved_cores, threads = auto, "Thread count set to auto");
        return auto;
    }
    if threads_from_config > logical_cores {
        warn!(
            requested = threads_from_config,
            logical_cores,
            "Thread count exceeds available logical cores, capping"
        );
        return logical_cores;
    }
    threads_from_config
}
