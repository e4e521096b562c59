//! The fetcher context: an explicit, constructor-injected record bundling every shared resource
//! instead of process-globals — the metrics registry, pool optimiser, memory governor, robots
//! cache, resolved configuration and shared HTTP client.

use std::sync::Arc;

use fetchcore_config::ResolvedFetcherConfig;
use fetchcore_metrics::MetricsRegistry;

use crate::memory::{self, MemoryGovernor};
use crate::pool::PoolOptimiser;
use crate::robots::RobotsCache;

pub struct FetcherContext {
    pub config: ResolvedFetcherConfig,
    pub metrics: Arc<MetricsRegistry>,
    pub pool: Arc<PoolOptimiser>,
    pub memory: Arc<MemoryGovernor>,
    pub robots: Arc<RobotsCache>,
    pub client: reqwest::Client,
}

impl FetcherContext {
    /// Build the context from a resolved configuration. Fallible only because the shared
    /// `reqwest::Client` construction can fail (invalid TLS backend state, bad proxy URL).
    pub fn new(config: ResolvedFetcherConfig) -> Result<Self, reqwest::Error> {
        let metrics = Arc::new(MetricsRegistry::new());

        let mut client_builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!config.transport.verify_tls)
            .user_agent(config.transport.default_user_agent.clone());
        if let Some(proxy_url) = &config.transport.default_proxy {
            if let Ok(proxy) = reqwest::Proxy::all(proxy_url.as_str()) {
                client_builder = client_builder.proxy(proxy);
            }
        }
        let client = client_builder.build()?;

        let pool = Arc::new(PoolOptimiser::new(config.pool.clone(), Arc::clone(&metrics)));
        let robots = Arc::new(RobotsCache::new(
            config.robots.clone(),
            client.clone(),
            Arc::clone(&pool),
            Arc::clone(&metrics),
            config.transport.default_user_agent.clone(),
            config.transport.default_proxy.as_ref().map(ToString::to_string),
            config.transport.verify_tls,
        ));
        let reclaimables: Vec<Arc<dyn memory::Reclaimable>> = vec![Arc::clone(&robots) as Arc<dyn memory::Reclaimable>];
        let memory_governor = Arc::new(MemoryGovernor::new(
            config.memory.clone(),
            memory::default_sampler(),
            reclaimables,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            metrics,
            pool,
            memory: memory_governor,
            robots,
            client,
        })
    }

    /// Spawn the context's own background loops (pool optimiser tick, memory governor sampler).
    /// The robots cache registers with the memory governor as a [`memory::Reclaimable`] so an
    /// over-budget reclaim cycle can sweep it early, but its own periodic sweep tick is owned by
    /// the service shell's tick loop instead, since it shares the shell's own interval rather than
    /// running independently.
    pub fn spawn_background_loops(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![self.pool.spawn(), self.memory.spawn()]
    }
}
