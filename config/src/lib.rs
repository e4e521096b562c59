//! Configuration for the fetcher core.
//!
//! Every subsystem gets its own `Option`-heavy `*Config` struct, deserializable from TOML, with
//! every field defaulted. [`FetcherConfig::resolve`] consumes the whole tree once at start-up
//! and produces a [`resolved::ResolvedFetcherConfig`] of concrete values that the rest of the
//! crate reads without re-checking for `None` on every access.

mod error;
mod resolved;

pub use error::ConfigError;
pub use resolved::{
    BackendPolicy, ResolvedBackendConfig, ResolvedFetcherConfig, ResolvedMemoryConfig,
    ResolvedPoolConfig, ResolvedRobotsConfig, ResolvedShellConfig, ResolvedTransportConfig,
};

use serde::{Deserialize, Serialize};

/// Adaptive connection-pool sizing (component C).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_pool_size: Option<u32>,
    #[serde(default)]
    pub max_pool_size: Option<u32>,
    #[serde(default)]
    pub initial_pool_size: Option<u32>,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
    #[serde(default)]
    pub scale_factor: Option<f64>,
    #[serde(default)]
    pub scale_down_threshold: Option<f64>,
    #[serde(default)]
    pub auto_optimize: Option<bool>,
}

impl PoolConfig {
    pub const DEFAULT_MIN_POOL_SIZE: u32 = 10;
    pub const DEFAULT_MAX_POOL_SIZE: u32 = 200;
    pub const DEFAULT_INITIAL_POOL_SIZE: u32 = 50;
    pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
    pub const DEFAULT_SCALE_FACTOR: f64 = 1.5;
    pub const DEFAULT_SCALE_DOWN_THRESHOLD: f64 = 0.3;
    pub const DEFAULT_AUTO_OPTIMIZE: bool = true;
}

/// Memory governor (component B).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub max_memory_percent: Option<f64>,
    #[serde(default)]
    pub gc_interval_secs: Option<u64>,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
    #[serde(default)]
    pub auto_optimize: Option<bool>,
}

impl MemoryConfig {
    pub const DEFAULT_MAX_MEMORY_PERCENT: f64 = 80.0;
    pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;
    pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
    pub const DEFAULT_AUTO_OPTIMIZE: bool = true;
}

/// Robots.txt cache (component D).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RobotsConfig {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_window_secs: Option<u64>,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub max_cache_entries: Option<usize>,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

impl RobotsConfig {
    pub const DEFAULT_TTL_SECS: u64 = 3600;
    pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
    pub const DEFAULT_REQUEST_WINDOW_SECS: u64 = 30;
    pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024;
    pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 10_000;
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
}

/// Transport engine (component E) process-wide fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub default_user_agent: Option<String>,
    #[serde(default)]
    pub default_proxy: Option<String>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
}

impl TransportConfig {
    pub const DEFAULT_USER_AGENT: &'static str =
        concat!("fetchcore/", env!("CARGO_PKG_VERSION"));
    pub const DEFAULT_VERIFY_TLS: bool = true;
}

/// Remote headless-browser proxy endpoints (component F). A field left unset means that backend
/// is not enabled and routes to the synthetic 501 response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub puppeteer_endpoint: Option<String>,
    #[serde(default)]
    pub playwright_endpoint: Option<String>,
    #[serde(default)]
    pub py_playwright_endpoint: Option<String>,
    #[serde(default)]
    pub splash_endpoint: Option<String>,
    #[serde(default)]
    pub splash_lua_source: Option<String>,
}

/// Service shell (component G): queue loop and RPC bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub queue_tick_ms: Option<u64>,
    #[serde(default)]
    pub robots_sweep_secs: Option<u64>,
    #[serde(default)]
    pub output_queue_capacity: Option<usize>,
    #[serde(default)]
    pub drain_deadline_secs: Option<u64>,
    #[serde(default)]
    pub rpc_listen_addr: Option<String>,
}

impl ShellConfig {
    pub const DEFAULT_QUEUE_TICK_MS: u64 = 100;
    pub const DEFAULT_ROBOTS_SWEEP_SECS: u64 = 10;
    pub const DEFAULT_OUTPUT_QUEUE_CAPACITY: usize = 1000;
    pub const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 30;
    pub const DEFAULT_RPC_LISTEN_ADDR: &'static str = "127.0.0.1:24444";
}

/// Top-level configuration aggregate, the TOML document shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub robots: RobotsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub backends: BackendConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

impl FetcherConfig {
    /// Load from a TOML file. A missing file is not an error — it resolves to all-defaults,
    /// matching how an operator with no customisation needs no config file at all.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(e),
        })
    }

    /// The platform config directory path this binary defaults to: `<config_dir>/fetchcore/fetchcore.toml`.
    pub fn default_path() -> Result<std::path::PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("fetchcore").join("fetchcore.toml"))
    }

    /// Consume the `Option`-heavy tree and produce concrete, resolved values.
    pub fn resolve(&self) -> Result<ResolvedFetcherConfig, ConfigError> {
        resolved::resolve(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_resolves_to_defaults() {
        let cfg = FetcherConfig::load(std::path::Path::new("/nonexistent/fetchcore.toml")).unwrap();
        assert!(cfg.pool.min_pool_size.is_none());
    }

    #[test]
    fn partial_toml_leaves_unset_fields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fetchcore.toml");
        std::fs::write(&path, "[pool]\nmax_pool_size = 500\n").unwrap();
        let cfg = FetcherConfig::load(&path).unwrap();
        assert_eq!(cfg.pool.max_pool_size, Some(500));
        assert_eq!(cfg.pool.min_pool_size, None);
    }
}
