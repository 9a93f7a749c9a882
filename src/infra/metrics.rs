//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a value using binary search
#[inline]
fn bucket_index(value: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a snapshot.
pub struct Metrics {
    /// Reports normalized and persisted (monotonic)
    reports_accepted: AtomicU64,
    /// Payloads rejected as malformed (monotonic)
    reports_malformed: AtomicU64,
    /// Reports excluded from detection for poor accuracy (monotonic)
    reports_low_confidence: AtomicU64,
    /// Payloads for unknown or inactive subjects (monotonic)
    reports_unknown_subject: AtomicU64,
    /// Points run through the detector, real and synthetic (monotonic)
    points_evaluated: AtomicU64,
    /// Points evaluated since last report (reset on report)
    points_since_report: AtomicU64,
    /// Gap-fill points evaluated (monotonic)
    synthetic_points: AtomicU64,
    /// Detection latency sum in microseconds (reset on report)
    detect_latency_sum_us: AtomicU64,
    /// Detection latency max in microseconds (reset on report)
    detect_latency_max_us: AtomicU64,
    /// Detection latency histogram (reset on report)
    detect_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Enter transitions detected (monotonic)
    enter_total: AtomicU64,
    /// Exit transitions detected (monotonic)
    exit_total: AtomicU64,
    /// Transitions coalesced into an already pending event (monotonic)
    events_coalesced: AtomicU64,
    /// Proactive sweeps completed (monotonic)
    sweeps_total: AtomicU64,
    /// Subject evaluations that hit the sweep timeout (monotonic)
    sweep_timeouts: AtomicU64,
    /// Evaluations abandoned because the site index was unavailable (monotonic)
    index_unavailable: AtomicU64,
    /// Notifications confirmed delivered (monotonic)
    deliveries_sent: AtomicU64,
    /// Notifications permanently failed (monotonic)
    deliveries_failed: AtomicU64,
    /// Delivery retries scheduled (monotonic)
    delivery_retries: AtomicU64,
    /// Events that could not be queued for dispatch (monotonic)
    dispatch_dropped: AtomicU64,
    /// Channel call latency histogram in milliseconds (reset on report)
    delivery_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Current dispatch queue depth (updated by sampler)
    dispatch_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            reports_accepted: AtomicU64::new(0),
            reports_malformed: AtomicU64::new(0),
            reports_low_confidence: AtomicU64::new(0),
            reports_unknown_subject: AtomicU64::new(0),
            points_evaluated: AtomicU64::new(0),
            points_since_report: AtomicU64::new(0),
            synthetic_points: AtomicU64::new(0),
            detect_latency_sum_us: AtomicU64::new(0),
            detect_latency_max_us: AtomicU64::new(0),
            detect_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            enter_total: AtomicU64::new(0),
            exit_total: AtomicU64::new(0),
            events_coalesced: AtomicU64::new(0),
            sweeps_total: AtomicU64::new(0),
            sweep_timeouts: AtomicU64::new(0),
            index_unavailable: AtomicU64::new(0),
            deliveries_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            delivery_retries: AtomicU64::new(0),
            dispatch_dropped: AtomicU64::new(0),
            delivery_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            dispatch_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_report_accepted(&self) {
        self.reports_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_malformed(&self) {
        self.reports_malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_low_confidence(&self) {
        self.reports_low_confidence.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_unknown_subject(&self) {
        self.reports_unknown_subject.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a detector pass over one point with given latency (lock-free)
    #[inline]
    pub fn record_point_evaluated(&self, synthetic: bool, latency_us: u64) {
        self.points_evaluated.fetch_add(1, Ordering::Relaxed);
        self.points_since_report.fetch_add(1, Ordering::Relaxed);
        if synthetic {
            self.synthetic_points.fetch_add(1, Ordering::Relaxed);
        }
        self.detect_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.detect_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.detect_latency_max_us, latency_us);
    }

    /// Record a detected transition (lock-free)
    #[inline]
    pub fn record_transition(&self, enter: bool) {
        if enter {
            self.enter_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.exit_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_event_coalesced(&self) {
        self.events_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sweep(&self) {
        self.sweeps_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sweep_timeout(&self) {
        self.sweep_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_index_unavailable(&self) {
        self.index_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the terminal outcome of one event's delivery
    #[inline]
    pub fn record_delivery(&self, sent: bool) {
        if sent {
            self.deliveries_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_delivery_retry(&self) {
        self.delivery_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the duration of one channel call in milliseconds
    #[inline]
    pub fn record_delivery_latency(&self, latency_ms: u64) {
        self.delivery_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch_dropped(&self) {
        self.dispatch_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Set current dispatch queue depth (called by sampler)
    #[inline]
    pub fn set_dispatch_queue_depth(&self, depth: u64) {
        self.dispatch_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn reports_accepted(&self) -> u64 {
        self.reports_accepted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn transitions_total(&self) -> u64 {
        self.enter_total.load(Ordering::Relaxed) + self.exit_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sweeps_total(&self) -> u64 {
        self.sweeps_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deliveries_sent(&self) -> u64 {
        self.deliveries_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deliveries_failed(&self) -> u64 {
        self.deliveries_failed.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, active_subjects: usize, inside_pairs: usize) -> MetricsSummary {
        let points_count = self.points_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.detect_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.detect_latency_max_us.swap(0, Ordering::Relaxed);
        let detect_lat_buckets = swap_buckets(&self.detect_latency_buckets);
        let delivery_lat_buckets = swap_buckets(&self.delivery_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let points_per_sec = if elapsed.as_secs_f64() > 0.0 {
            points_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if points_count > 0 { latency_sum / points_count } else { 0 };

        MetricsSummary {
            reports_accepted: self.reports_accepted.load(Ordering::Relaxed),
            reports_malformed: self.reports_malformed.load(Ordering::Relaxed),
            reports_low_confidence: self.reports_low_confidence.load(Ordering::Relaxed),
            reports_unknown_subject: self.reports_unknown_subject.load(Ordering::Relaxed),
            points_evaluated: self.points_evaluated.load(Ordering::Relaxed),
            points_per_sec,
            synthetic_points: self.synthetic_points.load(Ordering::Relaxed),
            detect_lat_buckets,
            detect_lat_avg_us: avg_latency,
            detect_lat_max_us: max_latency,
            detect_lat_p50_us: percentile_from_buckets(&detect_lat_buckets, 0.50),
            detect_lat_p99_us: percentile_from_buckets(&detect_lat_buckets, 0.99),
            enter_total: self.enter_total.load(Ordering::Relaxed),
            exit_total: self.exit_total.load(Ordering::Relaxed),
            events_coalesced: self.events_coalesced.load(Ordering::Relaxed),
            sweeps_total: self.sweeps_total.load(Ordering::Relaxed),
            sweep_timeouts: self.sweep_timeouts.load(Ordering::Relaxed),
            index_unavailable: self.index_unavailable.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            delivery_retries: self.delivery_retries.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            delivery_lat_buckets,
            delivery_lat_p99_ms: percentile_from_buckets(&delivery_lat_buckets, 0.99),
            dispatch_queue_depth: self.dispatch_queue_depth.load(Ordering::Relaxed),
            active_subjects,
            inside_pairs,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub reports_accepted: u64,
    pub reports_malformed: u64,
    pub reports_low_confidence: u64,
    pub reports_unknown_subject: u64,
    pub points_evaluated: u64,
    pub points_per_sec: f64,
    pub synthetic_points: u64,
    /// Detection latency histogram buckets (µs)
    pub detect_lat_buckets: [u64; NUM_BUCKETS],
    pub detect_lat_avg_us: u64,
    pub detect_lat_max_us: u64,
    pub detect_lat_p50_us: u64,
    pub detect_lat_p99_us: u64,
    pub enter_total: u64,
    pub exit_total: u64,
    pub events_coalesced: u64,
    pub sweeps_total: u64,
    pub sweep_timeouts: u64,
    pub index_unavailable: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
    pub delivery_retries: u64,
    pub dispatch_dropped: u64,
    /// Channel call latency histogram buckets (ms)
    pub delivery_lat_buckets: [u64; NUM_BUCKETS],
    pub delivery_lat_p99_ms: u64,
    pub dispatch_queue_depth: u64,
    /// Active subjects with at least one stored report
    pub active_subjects: usize,
    /// (subject, site) pairs currently inside
    pub inside_pairs: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            reports = %self.reports_accepted,
            malformed = %self.reports_malformed,
            low_confidence = %self.reports_low_confidence,
            points_per_sec = format!("{:.2}", self.points_per_sec),
            synthetic = %self.synthetic_points,
            detect_p99_us = %self.detect_lat_p99_us,
            enter = %self.enter_total,
            exit = %self.exit_total,
            sweeps = %self.sweeps_total,
            sweep_timeouts = %self.sweep_timeouts,
            sent = %self.deliveries_sent,
            failed = %self.deliveries_failed,
            retries = %self.delivery_retries,
            active_subjects = %self.active_subjects,
            inside_pairs = %self.inside_pairs,
            "metrics_summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.reports_accepted(), 0);
        assert_eq!(metrics.transitions_total(), 0);
    }

    #[test]
    fn test_record_points() {
        let metrics = Metrics::new();

        metrics.record_point_evaluated(false, 100);
        metrics.record_point_evaluated(true, 300);

        let summary = metrics.report(2, 1);
        assert_eq!(summary.points_evaluated, 2);
        assert_eq!(summary.synthetic_points, 1);
        assert_eq!(summary.detect_lat_avg_us, 200);
        assert_eq!(summary.detect_lat_max_us, 300);
        assert_eq!(summary.active_subjects, 2);
        assert_eq!(summary.inside_pairs, 1);

        // Periodic counters should be reset
        assert_eq!(metrics.points_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.detect_latency_max_us.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_transitions_and_deliveries() {
        let metrics = Metrics::new();
        metrics.record_transition(true);
        metrics.record_transition(false);
        metrics.record_transition(true);
        metrics.record_delivery(true);
        metrics.record_delivery(false);

        let summary = metrics.report(0, 0);
        assert_eq!(summary.enter_total, 2);
        assert_eq!(summary.exit_total, 1);
        assert_eq!(summary.deliveries_sent, 1);
        assert_eq!(summary.deliveries_failed, 1);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report(0, 0);
        assert_eq!(summary.points_evaluated, 0);
        assert_eq!(summary.detect_lat_avg_us, 0);
        assert_eq!(summary.detect_lat_p99_us, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_report_accepted();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.reports_accepted(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_point_evaluated(false, 150);
        }
        let summary = metrics.report(0, 0);
        assert_eq!(summary.detect_lat_p50_us, 200);
        assert_eq!(summary.detect_lat_p99_us, 200);
    }
}
