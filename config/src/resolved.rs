use std::time::Duration;

use url::Url;

use crate::{BackendConfig, ConfigError, FetcherConfig, MemoryConfig, PoolConfig, RobotsConfig, ShellConfig, TransportConfig};

#[derive(Debug, Clone)]
pub struct ResolvedPoolConfig {
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub initial_pool_size: u32,
    pub check_interval: Duration,
    pub scale_factor: f64,
    pub scale_down_threshold: f64,
    pub auto_optimize: bool,
}

fn resolve_pool(cfg: &PoolConfig) -> ResolvedPoolConfig {
    ResolvedPoolConfig {
        min_pool_size: cfg.min_pool_size.unwrap_or(PoolConfig::DEFAULT_MIN_POOL_SIZE),
        max_pool_size: cfg.max_pool_size.unwrap_or(PoolConfig::DEFAULT_MAX_POOL_SIZE),
        initial_pool_size: cfg
            .initial_pool_size
            .unwrap_or(PoolConfig::DEFAULT_INITIAL_POOL_SIZE),
        check_interval: Duration::from_secs(
            cfg.check_interval_secs
                .unwrap_or(PoolConfig::DEFAULT_CHECK_INTERVAL_SECS),
        ),
        scale_factor: cfg.scale_factor.unwrap_or(PoolConfig::DEFAULT_SCALE_FACTOR),
        scale_down_threshold: cfg
            .scale_down_threshold
            .unwrap_or(PoolConfig::DEFAULT_SCALE_DOWN_THRESHOLD),
        auto_optimize: cfg.auto_optimize.unwrap_or(PoolConfig::DEFAULT_AUTO_OPTIMIZE),
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedMemoryConfig {
    pub max_memory_percent: f64,
    pub gc_interval: Duration,
    pub check_interval: Duration,
    pub auto_optimize: bool,
}

fn resolve_memory(cfg: &MemoryConfig) -> ResolvedMemoryConfig {
    ResolvedMemoryConfig {
        max_memory_percent: cfg
            .max_memory_percent
            .unwrap_or(MemoryConfig::DEFAULT_MAX_MEMORY_PERCENT),
        gc_interval: Duration::from_secs(
            cfg.gc_interval_secs.unwrap_or(MemoryConfig::DEFAULT_GC_INTERVAL_SECS),
        ),
        check_interval: Duration::from_secs(
            cfg.check_interval_secs
                .unwrap_or(MemoryConfig::DEFAULT_CHECK_INTERVAL_SECS),
        ),
        auto_optimize: cfg.auto_optimize.unwrap_or(MemoryConfig::DEFAULT_AUTO_OPTIMIZE),
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedRobotsConfig {
    pub ttl: Duration,
    pub fetch_timeout: Duration,
    pub request_window: Duration,
    pub max_body_bytes: usize,
    pub max_cache_entries: usize,
    pub sweep_interval: Duration,
}

fn resolve_robots(cfg: &RobotsConfig) -> ResolvedRobotsConfig {
    ResolvedRobotsConfig {
        ttl: Duration::from_secs(cfg.ttl_secs.unwrap_or(RobotsConfig::DEFAULT_TTL_SECS)),
        fetch_timeout: Duration::from_secs(
            cfg.fetch_timeout_secs
                .unwrap_or(RobotsConfig::DEFAULT_FETCH_TIMEOUT_SECS),
        ),
        request_window: Duration::from_secs(
            cfg.request_window_secs
                .unwrap_or(RobotsConfig::DEFAULT_REQUEST_WINDOW_SECS),
        ),
        max_body_bytes: cfg
            .max_body_bytes
            .unwrap_or(RobotsConfig::DEFAULT_MAX_BODY_BYTES),
        max_cache_entries: cfg
            .max_cache_entries
            .unwrap_or(RobotsConfig::DEFAULT_MAX_CACHE_ENTRIES),
        sweep_interval: Duration::from_secs(
            cfg.sweep_interval_secs
                .unwrap_or(RobotsConfig::DEFAULT_SWEEP_INTERVAL_SECS),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTransportConfig {
    pub default_user_agent: String,
    pub default_proxy: Option<Url>,
    pub verify_tls: bool,
}

fn resolve_transport(cfg: &TransportConfig) -> Result<ResolvedTransportConfig, ConfigError> {
    let default_proxy = cfg
        .default_proxy
        .as_deref()
        .map(Url::parse)
        .transpose()
        .map_err(|source| ConfigError::InvalidUrl {
            field: "transport.default_proxy",
            source,
        })?;
    Ok(ResolvedTransportConfig {
        default_user_agent: cfg
            .default_user_agent
            .clone()
            .unwrap_or_else(|| TransportConfig::DEFAULT_USER_AGENT.to_string()),
        default_proxy,
        verify_tls: cfg.verify_tls.unwrap_or(TransportConfig::DEFAULT_VERIFY_TLS),
    })
}

/// Whether a remote browser-proxy backend is enabled, and if so, where to reach it.
#[derive(Debug, Clone)]
pub enum BackendPolicy {
    Disabled,
    Enabled(Url),
}

impl BackendPolicy {
    #[must_use]
    pub fn endpoint(&self) -> Option<&Url> {
        match self {
            BackendPolicy::Disabled => None,
            BackendPolicy::Enabled(url) => Some(url),
        }
    }
}

fn resolve_backend_url(field: &'static str, raw: Option<&str>) -> Result<BackendPolicy, ConfigError> {
    match raw {
        None => Ok(BackendPolicy::Disabled),
        Some(raw) => Url::parse(raw)
            .map(BackendPolicy::Enabled)
            .map_err(|source| ConfigError::InvalidUrl { field, source }),
    }
}

/// The canonical splash driver script used when no override is configured, adapted from the
/// fetcher's own Lua driver precedent.
pub const DEFAULT_SPLASH_LUA_SOURCE: &str = r"
function main(splash, args)
  splash:set_custom_headers(args.headers or {})
  assert(splash:go{args.url, http_method=args.method or 'GET'})
  splash:wait(0.5)
  return {
    url = splash:url(),
    html = splash:html(),
    status_code = splash.http_status_code,
  }
end
";

#[derive(Debug, Clone)]
pub struct ResolvedBackendConfig {
    pub puppeteer: BackendPolicy,
    pub playwright: BackendPolicy,
    pub py_playwright: BackendPolicy,
    pub splash: BackendPolicy,
    pub splash_lua_source: String,
}

fn resolve_backends(cfg: &BackendConfig) -> Result<ResolvedBackendConfig, ConfigError> {
    Ok(ResolvedBackendConfig {
        puppeteer: resolve_backend_url("backends.puppeteer_endpoint", cfg.puppeteer_endpoint.as_deref())?,
        playwright: resolve_backend_url("backends.playwright_endpoint", cfg.playwright_endpoint.as_deref())?,
        py_playwright: resolve_backend_url(
            "backends.py_playwright_endpoint",
            cfg.py_playwright_endpoint.as_deref(),
        )?,
        splash: resolve_backend_url("backends.splash_endpoint", cfg.splash_endpoint.as_deref())?,
        splash_lua_source: cfg
            .splash_lua_source
            .clone()
            .unwrap_or_else(|| DEFAULT_SPLASH_LUA_SOURCE.to_string()),
    })
}

#[derive(Debug, Clone)]
pub struct ResolvedShellConfig {
    pub queue_tick: Duration,
    pub robots_sweep_interval: Duration,
    pub output_queue_capacity: usize,
    pub drain_deadline: Duration,
    pub rpc_listen_addr: String,
}

fn resolve_shell(cfg: &ShellConfig) -> ResolvedShellConfig {
    ResolvedShellConfig {
        queue_tick: Duration::from_millis(
            cfg.queue_tick_ms.unwrap_or(ShellConfig::DEFAULT_QUEUE_TICK_MS),
        ),
        robots_sweep_interval: Duration::from_secs(
            cfg.robots_sweep_secs
                .unwrap_or(ShellConfig::DEFAULT_ROBOTS_SWEEP_SECS),
        ),
        output_queue_capacity: cfg
            .output_queue_capacity
            .unwrap_or(ShellConfig::DEFAULT_OUTPUT_QUEUE_CAPACITY),
        drain_deadline: Duration::from_secs(
            cfg.drain_deadline_secs
                .unwrap_or(ShellConfig::DEFAULT_DRAIN_DEADLINE_SECS),
        ),
        rpc_listen_addr: cfg
            .rpc_listen_addr
            .clone()
            .unwrap_or_else(|| ShellConfig::DEFAULT_RPC_LISTEN_ADDR.to_string()),
    }
}

/// The fully-resolved, `Option`-free configuration tree.
#[derive(Debug, Clone)]
pub struct ResolvedFetcherConfig {
    pub pool: ResolvedPoolConfig,
    pub memory: ResolvedMemoryConfig,
    pub robots: ResolvedRobotsConfig,
    pub transport: ResolvedTransportConfig,
    pub backends: ResolvedBackendConfig,
    pub shell: ResolvedShellConfig,
}

pub(crate) fn resolve(cfg: &FetcherConfig) -> Result<ResolvedFetcherConfig, ConfigError> {
    Ok(ResolvedFetcherConfig {
        pool: resolve_pool(&cfg.pool),
        memory: resolve_memory(&cfg.memory),
        robots: resolve_robots(&cfg.robots),
        transport: resolve_transport(&cfg.transport)?,
        backends: resolve_backends(&cfg.backends)?,
        shell: resolve_shell(&cfg.shell),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_documented_values() {
        let resolved = resolve(&FetcherConfig::default()).unwrap();
        assert_eq!(resolved.pool.min_pool_size, 10);
        assert_eq!(resolved.pool.max_pool_size, 200);
        assert_eq!(resolved.pool.initial_pool_size, 50);
        assert_eq!(resolved.memory.max_memory_percent, 80.0);
        assert_eq!(resolved.robots.ttl, Duration::from_secs(3600));
        assert!(resolved.backends.puppeteer.endpoint().is_none());
    }

    #[test]
    fn configured_backend_endpoint_resolves_to_enabled() {
        let mut cfg = FetcherConfig::default();
        cfg.backends.puppeteer_endpoint = Some("http://localhost:22223".to_string());
        let resolved = resolve(&cfg).unwrap();
        assert!(matches!(resolved.backends.puppeteer, BackendPolicy::Enabled(_)));
    }

    #[test]
    fn invalid_backend_url_is_rejected() {
        let mut cfg = FetcherConfig::default();
        cfg.backends.puppeteer_endpoint = Some("not a url".to_string());
        assert!(resolve(&cfg).is_err());
    }
}
