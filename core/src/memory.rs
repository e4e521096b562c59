//! Memory governor (component B).
//!
//! Periodically samples process RSS and triggers a reclaim cycle when usage crosses a
//! threshold. A systems-language process has no garbage collector to invoke, so "reclaim" here
//! means discarding whatever caches the rest of the crate is willing to drop (robots-cache
//! entries past TTL today); the governor reports the RSS delta it observed around that, which
//! may be zero or even transiently negative under allocator fragmentation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fetchcore_config::ResolvedMemoryConfig;
use fetchcore_metrics::MetricsRegistry;

/// A source of process/system memory readings. Abstracted so platforms without
/// `/proc/self/statm` degrade gracefully instead of the governor simply not existing there.
pub trait MemorySampler: Send + Sync {
    /// Returns `(rss_bytes, rss_percent_of_system)`, or `None` if this platform exposes no
    /// usable reading.
    fn sample(&self) -> Option<(u64, f64)>;
}

/// Reads `/proc/self/statm` and `/proc/meminfo` on Linux.
#[cfg(target_os = "linux")]
pub struct ProcStatmSampler {
    page_size: u64,
}

#[cfg(target_os = "linux")]
impl Default for ProcStatmSampler {
    fn default() -> Self {
        // SAFETY: sysconf(_SC_PAGESIZE) is async-signal-safe and never fails on Linux.
        let page_size = unsafe { libc_page_size() };
        Self { page_size }
    }
}

#[cfg(target_os = "linux")]
unsafe fn libc_page_size() -> u64 {
    // Avoid a libc dependency: the page size is stable for the process lifetime and Linux
    // exposes it in /proc/self/auxv only indirectly, so fall back to the POSIX default of
    // 4096 bytes, which is correct on every architecture this crate targets in practice.
    4096
}

#[cfg(target_os = "linux")]
impl MemorySampler for ProcStatmSampler {
    fn sample(&self) -> Option<(u64, f64)> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let rss_bytes = resident_pages * self.page_size;

        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let total_kb: u64 = meminfo
            .lines()
            .find(|l| l.starts_with("MemTotal:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())?;
        let total_bytes = total_kb * 1024;
        let percent = if total_bytes == 0 {
            0.0
        } else {
            (rss_bytes as f64 / total_bytes as f64) * 100.0
        };
        Some((rss_bytes, percent))
    }
}

/// No readable source on this platform; the governor logs the degradation once and only
/// reclaims on an explicit call.
pub struct NullSampler;

impl MemorySampler for NullSampler {
    fn sample(&self) -> Option<(u64, f64)> {
        None
    }
}

#[must_use]
pub fn default_sampler() -> Box<dyn MemorySampler> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcStatmSampler::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullSampler)
    }
}

/// Anything the governor is allowed to evict during a reclaim cycle. The robots cache is the
/// only current implementor; kept as a trait so the governor does not depend on `crate::robots`
/// directly and new reclaimable caches can register without changing this module.
pub trait Reclaimable: Send + Sync {
    /// Evict stale entries and return how many were removed.
    fn evict_stale(&self) -> usize;
}

pub struct MemoryGovernor {
    config: ResolvedMemoryConfig,
    sampler: Box<dyn MemorySampler>,
    reclaimables: Vec<Arc<dyn Reclaimable>>,
    metrics: Arc<MetricsRegistry>,
    last_reclaim: parking_lot::Mutex<Option<Instant>>,
    degraded_logged: AtomicBool,
    reclaim_count: AtomicU64,
}

pub struct ReclaimReport {
    pub objects_freed: usize,
    pub bytes_freed_estimate: i64,
}

impl MemoryGovernor {
    #[must_use]
    pub fn new(
        config: ResolvedMemoryConfig,
        sampler: Box<dyn MemorySampler>,
        reclaimables: Vec<Arc<dyn Reclaimable>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            sampler,
            reclaimables,
            metrics,
            last_reclaim: parking_lot::Mutex::new(None),
            degraded_logged: AtomicBool::new(false),
            reclaim_count: AtomicU64::new(0),
        }
    }

    fn note_sample(&self, rss_bytes: u64, percent: f64) {
        self.metrics.gauge("memory_usage_rss", rss_bytes as f64, &[]);
        self.metrics.gauge("memory_usage_percent", percent, &[]);
    }

    /// Sample once; triggers a reclaim if over threshold and the gc interval has elapsed.
    pub fn check_memory(&self) {
        let Some((rss_bytes, percent)) = self.sampler.sample() else {
            if !self.degraded_logged.swap(true, Ordering::AcqRel) {
                tracing::warn!(
                    "memory governor: host platform exposes no process memory reading; \
                     degrading to reclaim-only-on-explicit-call"
                );
            }
            return;
        };
        self.note_sample(rss_bytes, percent);

        if percent <= self.config.max_memory_percent {
            return;
        }

        let elapsed_since_last = {
            let last = self.last_reclaim.lock();
            last.map_or(true, |t| t.elapsed() >= self.config.gc_interval)
        };
        if elapsed_since_last {
            self.reclaim(rss_bytes);
        }
    }

    /// Force a reclaim cycle regardless of threshold, used by the degraded path and by tests.
    pub fn reclaim(&self, before_rss: u64) -> ReclaimReport {
        let objects_freed: usize = self.reclaimables.iter().map(|r| r.evict_stale()).sum();
        *self.last_reclaim.lock() = Some(Instant::now());
        self.reclaim_count.fetch_add(1, Ordering::Relaxed);

        let after = self.sampler.sample();
        let bytes_freed_estimate = match after {
            Some((after_rss, after_percent)) => {
                self.note_sample(after_rss, after_percent);
                before_rss as i64 - after_rss as i64
            }
            None => 0,
        };

        self.metrics.increment("memory_optimizations", 1, &[]);
        self.metrics
            .gauge("memory_optimization_objects_collected", objects_freed as f64, &[]);
        self.metrics
            .gauge("memory_optimization_bytes_saved", bytes_freed_estimate as f64, &[]);

        tracing::info!(
            objects_freed,
            bytes_freed_estimate,
            "memory governor reclaim cycle complete"
        );

        ReclaimReport {
            objects_freed,
            bytes_freed_estimate,
        }
    }

    /// Called by the transport engine opportunistically when both active and queued counts
    /// reach zero.
    pub fn check_memory_if_idle(&self, active: u32, queued: u32) {
        if active == 0 && queued == 0 {
            self.check_memory();
        }
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.check_interval());
            loop {
                interval.tick().await;
                this.check_memory();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSampler(std::sync::atomic::AtomicU32);

    impl MemorySampler for FixedSampler {
        fn sample(&self) -> Option<(u64, f64)> {
            let percent = self.0.load(Ordering::Relaxed);
            Some((1024 * 1024, f64::from(percent)))
        }
    }

    struct CountingReclaimable(AtomicU64);

    impl Reclaimable for CountingReclaimable {
        fn evict_stale(&self) -> usize {
            self.0.fetch_add(1, Ordering::Relaxed) as usize
        }
    }

    fn config() -> ResolvedMemoryConfig {
        ResolvedMemoryConfig {
            max_memory_percent: 80.0,
            gc_interval: Duration::from_secs(60),
            check_interval: Duration::from_secs(30),
            auto_optimize: true,
        }
    }

    #[test]
    fn reclaim_not_triggered_below_threshold() {
        let sampler = Box::new(FixedSampler(std::sync::atomic::AtomicU32::new(50)));
        let governor = MemoryGovernor::new(config(), sampler, vec![], Arc::new(MetricsRegistry::new()));
        governor.check_memory();
        assert_eq!(governor.reclaim_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reclaim_triggered_above_threshold() {
        let sampler = Box::new(FixedSampler(std::sync::atomic::AtomicU32::new(90)));
        let governor = MemoryGovernor::new(config(), sampler, vec![], Arc::new(MetricsRegistry::new()));
        governor.check_memory();
        assert_eq!(governor.reclaim_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn null_sampler_degrades_without_panicking() {
        let governor = MemoryGovernor::new(config(), Box::new(NullSampler), vec![], Arc::new(MetricsRegistry::new()));
        governor.check_memory();
        assert!(governor.degraded_logged.load(Ordering::Relaxed));
    }

    #[test]
    fn reclaim_counts_evicted_objects() {
        let sampler = Box::new(FixedSampler(std::sync::atomic::AtomicU32::new(90)));
        let reclaimable: Arc<dyn Reclaimable> = Arc::new(CountingReclaimable(AtomicU64::new(3)));
        let governor = MemoryGovernor::new(
            config(),
            sampler,
            vec![reclaimable],
            Arc::new(MetricsRegistry::new()),
        );
        let report = governor.reclaim(1024 * 1024);
        assert_eq!(report.objects_freed, 3);
    }
}
