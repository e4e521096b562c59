//! Tag-keyed counters, gauges and timers shared by every component of the fetcher core.
//!
//! Mirrors the registry the rest of this codebase's request-fetching component keeps for its
//! own call volume, generalized from a fixed set of named counters to an open tag-keyed one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Default interval between structured-log metric snapshots.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on how long a windowed observation is retained, regardless of whether anyone has
/// queried it yet. The longest window the RPC `counter()` call exposes is one hour, so entries
/// older than that are trimmed on write rather than accumulating unbounded between queries.
const MAX_WINDOW_RETENTION: Duration = Duration::from_secs(3600);

/// Tags attached to a metric observation. Order does not matter — keys are sorted before the
/// lookup key is formed, so `&[("host", "a"), ("kind", "b")]` and `&[("kind", "b"), ("host", "a")]`
/// address the same series.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

fn format_key(name: &str, tags: Tags<'_>) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<&(&str, &str)> = tags.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    let tag_str = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}[{tag_str}]")
}

#[derive(Debug, Clone, Copy)]
struct TimerAggregate {
    count: u64,
    sum_secs: f64,
    min_secs: f64,
    max_secs: f64,
}

impl Default for TimerAggregate {
    fn default() -> Self {
        Self {
            count: 0,
            sum_secs: 0.0,
            min_secs: f64::INFINITY,
            max_secs: 0.0,
        }
    }
}

impl TimerAggregate {
    fn record(&mut self, elapsed_secs: f64) {
        self.count += 1;
        self.sum_secs += elapsed_secs;
        self.min_secs = self.min_secs.min(elapsed_secs);
        self.max_secs = self.max_secs.max(elapsed_secs);
    }
}

/// Point-in-time snapshot of one timer series, with the average already derived.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub avg_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
}

/// A full snapshot of the registry, as returned by `get_metrics()` and the RPC `counter()` call.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: std::collections::BTreeMap<String, i64>,
    pub gauges: std::collections::BTreeMap<String, f64>,
    pub timers: std::collections::BTreeMap<String, TimerSnapshot>,
}

/// Thread-safe registry of counters, gauges and timers.
///
/// Held behind an `Arc` by every other component; cheap to clone the `Arc`, never the registry
/// itself.
pub struct MetricsRegistry {
    counters: DashMap<String, AtomicI64>,
    gauges: DashMap<String, f64>,
    timers: DashMap<String, Mutex<TimerAggregate>>,
    windowed: DashMap<String, Mutex<VecDeque<(Instant, f64)>>>,
    report_interval: Mutex<Duration>,
    last_report: Mutex<Instant>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            timers: DashMap::new(),
            windowed: DashMap::new(),
            report_interval: Mutex::new(DEFAULT_REPORT_INTERVAL),
            last_report: Mutex::new(Instant::now()),
        }
    }

    /// Increment a counter, returning its new value. Also logs the delta into this key's
    /// windowed history, so any counter can be queried over a bounded trailing window via
    /// [`Self::windowed_sum`], not only the all-time cumulative value.
    pub fn increment(&self, name: &str, delta: i64, tags: Tags<'_>) -> i64 {
        let key = format_key(name, tags);
        let value = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed)
            + delta;
        self.record_windowed(&key, delta as f64);
        self.check_report();
        value
    }

    /// Append a timestamped observation to a key's windowed history, trimming anything older
    /// than [`MAX_WINDOW_RETENTION`].
    fn record_windowed(&self, key: &str, value: f64) {
        let entry = self.windowed.entry(key.to_string()).or_default();
        let mut log = entry.lock();
        log.push_back((Instant::now(), value));
        while let Some((t, _)) = log.front() {
            if t.elapsed() > MAX_WINDOW_RETENTION {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sum of a counter's or timer's windowed observations within the trailing `window`.
    #[must_use]
    pub fn windowed_sum(&self, name: &str, tags: Tags<'_>, window: Duration) -> f64 {
        let key = format_key(name, tags);
        let Some(entry) = self.windowed.get(&key) else {
            return 0.0;
        };
        entry.lock().iter().filter(|(t, _)| t.elapsed() <= window).map(|(_, v)| v).sum()
    }

    /// Average of a timer's windowed observations within the trailing `window`, or `0.0` if none
    /// fall in that window.
    #[must_use]
    pub fn windowed_avg(&self, name: &str, tags: Tags<'_>, window: Duration) -> f64 {
        let key = format_key(name, tags);
        let Some(entry) = self.windowed.get(&key) else {
            return 0.0;
        };
        let log = entry.lock();
        let values: Vec<f64> = log.iter().filter(|(t, _)| t.elapsed() <= window).map(|(_, v)| *v).collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    pub fn decrement(&self, name: &str, delta: i64, tags: Tags<'_>) -> i64 {
        self.increment(name, -delta, tags)
    }

    /// Overwrite a gauge.
    pub fn gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        let key = format_key(name, tags);
        self.gauges.insert(key, value);
        self.check_report();
    }

    /// Acquire a scoped timer. Recording happens when the returned guard is dropped.
    #[must_use]
    pub fn timer(self: &Arc<Self>, name: &str, tags: Tags<'_>) -> TimerGuard {
        TimerGuard {
            registry: Arc::clone(self),
            key: format_key(name, tags),
            start: Instant::now(),
        }
    }

    fn record_timer_by_key(&self, key: &str, elapsed_secs: f64) {
        self.timers
            .entry(key.to_string())
            .or_default()
            .lock()
            .record(elapsed_secs);
        self.record_windowed(key, elapsed_secs);
        self.check_report();
    }

    /// Record a timer observation directly, for callers that already measured the elapsed time
    /// and have no `.await`-spanning guard to thread through (e.g. a fetch whose duration is
    /// known once the whole redirect chain resolves).
    pub fn record_timer(&self, name: &str, tags: Tags<'_>, elapsed_secs: f64) {
        let key = format_key(name, tags);
        self.record_timer_by_key(&key, elapsed_secs);
    }

    fn check_report(&self) {
        let interval = *self.report_interval.lock();
        let mut last = self.last_report.lock();
        if last.elapsed() >= interval {
            *last = Instant::now();
            drop(last);
            self.report_now();
        }
    }

    /// Emit the current snapshot as a structured log line and return it.
    pub fn report_now(&self) -> MetricsSnapshot {
        let snapshot = self.get_metrics();
        if !snapshot.counters.is_empty() {
            tracing::info!(counters = ?snapshot.counters, "metrics counters");
        }
        if !snapshot.gauges.is_empty() {
            tracing::info!(gauges = ?snapshot.gauges, "metrics gauges");
        }
        if !snapshot.timers.is_empty() {
            tracing::info!(timers = ?snapshot.timers, "metrics timers");
        }
        snapshot
    }

    #[must_use]
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        let timers = self
            .timers
            .iter()
            .filter_map(|e| {
                let agg = *e.value().lock();
                if agg.count == 0 {
                    return None;
                }
                Some((
                    e.key().clone(),
                    TimerSnapshot {
                        count: agg.count,
                        avg_secs: agg.sum_secs / agg.count as f64,
                        min_secs: agg.min_secs,
                        max_secs: agg.max_secs,
                    },
                ))
            })
            .collect();
        MetricsSnapshot {
            counters,
            gauges,
            timers,
        }
    }

    pub fn reset(&self) {
        self.counters.clear();
        self.gauges.clear();
        self.timers.clear();
        self.windowed.clear();
        *self.last_report.lock() = Instant::now();
    }

    pub fn set_report_interval(&self, interval: Duration) {
        *self.report_interval.lock() = interval;
    }
}

/// RAII handle returned by [`MetricsRegistry::timer`]. Recording happens on drop so the timed
/// span can wrap arbitrary code, including `.await` points, without the caller threading a
/// result back explicitly.
pub struct TimerGuard {
    registry: Arc<MetricsRegistry>,
    key: String,
    start: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.registry.record_timer_by_key(&self.key, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formation_sorts_tags() {
        assert_eq!(
            format_key("fetch_time", &[("host", "a"), ("kind", "b")]),
            format_key("fetch_time", &[("kind", "b"), ("host", "a")])
        );
        assert_eq!(format_key("fetch_time", &[]), "fetch_time");
        assert_eq!(
            format_key("fetch_time", &[("host", "a")]),
            "fetch_time[host=a]"
        );
    }

    #[test]
    fn counter_increment_accumulates() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.increment("fetch_success", 1, &[]), 1);
        assert_eq!(registry.increment("fetch_success", 1, &[]), 2);
        assert_eq!(registry.decrement("fetch_success", 1, &[]), 1);
    }

    #[test]
    fn gauge_overwrites() {
        let registry = MetricsRegistry::new();
        registry.gauge("connection_pool_size", 50.0, &[]);
        registry.gauge("connection_pool_size", 75.0, &[]);
        let snapshot = registry.get_metrics();
        assert_eq!(snapshot.gauges["connection_pool_size"], 75.0);
    }

    #[test]
    fn timer_guard_records_on_drop() {
        let registry = Arc::new(MetricsRegistry::new());
        {
            let _g = registry.timer("fetch_time", &[]);
        }
        let snapshot = registry.get_metrics();
        let t = &snapshot.timers["fetch_time"];
        assert_eq!(t.count, 1);
        assert!(t.min_secs <= t.avg_secs && t.avg_secs <= t.max_secs);
    }

    #[test]
    fn timer_aggregate_stays_monotonic_in_count() {
        let registry = Arc::new(MetricsRegistry::new());
        for _ in 0..5 {
            let _g = registry.timer("fetch_time", &[]);
        }
        assert_eq!(registry.get_metrics().timers["fetch_time"].count, 5);
    }

    #[test]
    fn success_plus_errors_equals_total_fetches() {
        let registry = MetricsRegistry::new();
        registry.increment("fetch_success", 1, &[]);
        registry.increment("fetch_success", 1, &[]);
        registry.increment("fetch_error_timeout", 1, &[]);
        registry.increment("fetch_error_dns", 1, &[]);
        let snapshot = registry.get_metrics();
        let total_errors: i64 = snapshot
            .counters
            .iter()
            .filter(|(k, _)| k.starts_with("fetch_error_"))
            .map(|(_, v)| *v)
            .sum();
        let success = snapshot.counters["fetch_success"];
        assert_eq!(success + total_errors, 4);
    }

    #[test]
    fn windowed_sum_only_counts_observations_inside_the_window() {
        let registry = MetricsRegistry::new();
        registry.increment("fetch_success", 1, &[]);
        registry.increment("fetch_success", 1, &[]);
        assert_eq!(registry.windowed_sum("fetch_success", &[], Duration::from_secs(300)), 2.0);
        assert_eq!(registry.windowed_sum("fetch_success", &[], Duration::from_millis(0)), 0.0);
    }

    #[test]
    fn windowed_avg_matches_cumulative_average_for_observations_in_window() {
        let registry = Arc::new(MetricsRegistry::new());
        registry.record_timer("fetch_time", &[], 1.0);
        registry.record_timer("fetch_time", &[], 3.0);
        assert_eq!(registry.windowed_avg("fetch_time", &[], Duration::from_secs(3600)), 2.0);
    }

    #[test]
    fn reset_clears_all_state() {
        let registry = MetricsRegistry::new();
        registry.increment("fetch_success", 1, &[]);
        registry.gauge("connection_pool_size", 50.0, &[]);
        registry.reset();
        let snapshot = registry.get_metrics();
        assert!(snapshot.counters.is_empty());
        assert!(snapshot.gauges.is_empty());
    }
}
