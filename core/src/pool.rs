//! Adaptive connection-pool sizing (component C).
//!
//! Ported from the original `ConnectionPoolOptimizer`: holds a current pool size, observes
//! queue depth and active-connection count, and on each tick grows, shrinks or leaves the pool
//! size unchanged per the grow/shrink/hysteresis rule.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use fetchcore_config::ResolvedPoolConfig;
use fetchcore_metrics::MetricsRegistry;

/// The action taken on a given optimiser tick, recorded to metrics as
/// `connection_pool_increased|decreased|unchanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    Increased,
    Decreased,
    Unchanged,
}

impl PoolAction {
    fn metric_name(self) -> &'static str {
        match self {
            PoolAction::Increased => "connection_pool_increased",
            PoolAction::Decreased => "connection_pool_decreased",
            PoolAction::Unchanged => "connection_pool_unchanged",
        }
    }
}

/// Computes `clamp(queue_size * scale_factor, min, max)`, rounding down like the original's
/// integer truncation.
#[must_use]
pub fn optimal_pool_size(queue_size: u32, scale_factor: f64, min: u32, max: u32) -> u32 {
    let raw = (f64::from(queue_size) * scale_factor) as u32;
    raw.clamp(min, max)
}

pub struct PoolOptimiser {
    config: ResolvedPoolConfig,
    current_pool_size: AtomicU32,
    active_connections: AtomicU32,
    queue_size: AtomicU32,
    metrics: Arc<MetricsRegistry>,
    ticks: AtomicU64,
}

impl PoolOptimiser {
    #[must_use]
    pub fn new(config: ResolvedPoolConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let initial = config.initial_pool_size;
        Self {
            config,
            current_pool_size: AtomicU32::new(initial),
            active_connections: AtomicU32::new(0),
            queue_size: AtomicU32::new(0),
            metrics,
            ticks: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn current_pool_size(&self) -> u32 {
        self.current_pool_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> u32 {
        self.current_pool_size()
            .saturating_sub(self.active_connections())
    }

    pub fn connection_started(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection_finished(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn set_queue_size(&self, size: u32) {
        self.queue_size.store(size, Ordering::Release);
    }

    #[must_use]
    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::Acquire)
    }

    /// Run one optimiser tick: compute the optimal size, apply grow/shrink/unchanged, and
    /// publish the gauges a tick always publishes regardless of whether a transition happened.
    pub fn tick(&self) -> PoolAction {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let queue = self.queue_size.load(Ordering::Acquire);
        let current = self.current_pool_size.load(Ordering::Acquire);
        let optimal = optimal_pool_size(
            queue,
            self.config.scale_factor,
            self.config.min_pool_size,
            self.config.max_pool_size,
        );

        let action = if optimal > current {
            self.current_pool_size.store(optimal, Ordering::Release);
            PoolAction::Increased
        } else if (f64::from(optimal) < f64::from(current) * self.config.scale_down_threshold)
            && current > self.config.min_pool_size
        {
            let shrunk = optimal.max(self.config.min_pool_size);
            self.current_pool_size.store(shrunk, Ordering::Release);
            PoolAction::Decreased
        } else {
            PoolAction::Unchanged
        };

        self.metrics.increment(action.metric_name(), 1, &[]);
        self.update_pool_metrics();
        action
    }

    fn update_pool_metrics(&self) {
        let size = self.current_pool_size();
        let active = self.active_connections();
        let queue = self.queue_size.load(Ordering::Acquire);
        let utilization = if size == 0 {
            0.0
        } else {
            f64::from(active) / f64::from(size)
        };
        self.metrics.gauge("connection_pool_size", f64::from(size), &[]);
        self.metrics
            .gauge("connection_pool_active", f64::from(active), &[]);
        self.metrics
            .gauge("connection_pool_queue", f64::from(queue), &[]);
        self.metrics
            .gauge("connection_pool_utilization", utilization, &[]);
    }

    #[must_use]
    pub fn check_interval(&self) -> std::time::Duration {
        self.config.check_interval
    }

    /// Spawn the dedicated background tick loop. Runs until the returned handle is aborted or
    /// the shell drops it during shutdown.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !this.config.auto_optimize {
                return;
            }
            let mut interval = tokio::time::interval(this.check_interval());
            loop {
                interval.tick().await;
                this.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ResolvedPoolConfig {
        ResolvedPoolConfig {
            min_pool_size: 10,
            max_pool_size: 200,
            initial_pool_size: 50,
            check_interval: std::time::Duration::from_secs(30),
            scale_factor: 1.5,
            scale_down_threshold: 0.3,
            auto_optimize: true,
        }
    }

    #[test]
    fn growth_converges_to_clamped_optimal() {
        let optimiser = PoolOptimiser::new(config(), Arc::new(MetricsRegistry::new()));
        optimiser.set_queue_size(100); // optimal = 150
        optimiser.tick();
        assert_eq!(optimiser.current_pool_size(), 150);
        optimiser.tick(); // steady state: optimal still 150, no further growth
        assert_eq!(optimiser.current_pool_size(), 150);
    }

    #[test]
    fn shrink_hysteresis_matches_worked_example() {
        let optimiser = PoolOptimiser::new(config(), Arc::new(MetricsRegistry::new()));
        optimiser
            .current_pool_size
            .store(100, Ordering::Release);
        optimiser.set_queue_size(10); // optimal = 15; 15 < 100*0.3=30 -> shrink
        let action = optimiser.tick();
        assert_eq!(action, PoolAction::Decreased);
        assert_eq!(optimiser.current_pool_size(), 15);
    }

    #[test]
    fn no_shrink_below_min_pool_size() {
        let optimiser = PoolOptimiser::new(config(), Arc::new(MetricsRegistry::new()));
        optimiser.current_pool_size.store(10, Ordering::Release);
        optimiser.set_queue_size(1);
        let action = optimiser.tick();
        assert_eq!(action, PoolAction::Unchanged);
        assert_eq!(optimiser.current_pool_size(), 10);
    }

    #[test]
    fn utilization_gauge_is_active_over_size() {
        let optimiser = PoolOptimiser::new(config(), Arc::new(MetricsRegistry::new()));
        optimiser.connection_started();
        optimiser.connection_started();
        optimiser.tick();
        let snapshot = optimiser.metrics.get_metrics();
        let size = snapshot.gauges["connection_pool_size"];
        let active = snapshot.gauges["connection_pool_active"];
        let util = snapshot.gauges["connection_pool_utilization"];
        assert!((util - active / size).abs() < f64::EPSILON);
    }
}
