//! Leadership metrics
//!
//! Counters and a promotion-latency histogram rendered in Prometheus text
//! format by the node API's `/metrics` endpoint.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bucket boundaries for promotion latency (milliseconds)
const PROMOTION_BUCKETS: [f64; 9] = [
    10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Cumulative-bucket histogram
#[derive(Debug)]
pub struct Histogram {
    boundaries: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(boundaries: &'static [f64]) -> Self {
        Self {
            boundaries,
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// `(upper bound, cumulative count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut total = 0;
        let mut out: Vec<(f64, u64)> = self
            .boundaries
            .iter()
            .zip(&self.buckets)
            .map(|(&b, c)| {
                total += c.load(Ordering::Relaxed);
                (b, total)
            })
            .collect();
        total += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        out.push((f64::INFINITY, total));
        out
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide leadership counters
#[derive(Debug)]
pub struct LeadershipMetrics {
    pub acquisitions: Counter,
    pub acquisition_conflicts: Counter,
    pub renewals: Counter,
    pub renewal_failures: Counter,
    pub demotions: Counter,
    pub handoffs_served: Counter,
    pub handoffs_rejected: Counter,
    pub promotions_succeeded: Counter,
    pub promotions_failed: Counter,
    pub promotion_latency: Histogram,
    start_time: Instant,
}

impl LeadershipMetrics {
    pub fn new() -> Self {
        Self {
            acquisitions: Counter::default(),
            acquisition_conflicts: Counter::default(),
            renewals: Counter::default(),
            renewal_failures: Counter::default(),
            demotions: Counter::default(),
            handoffs_served: Counter::default(),
            handoffs_rejected: Counter::default(),
            promotions_succeeded: Counter::default(),
            promotions_failed: Counter::default(),
            promotion_latency: Histogram::with_buckets(&PROMOTION_BUCKETS),
            start_time: Instant::now(),
        }
    }

    pub fn record_promotion(&self, elapsed: Duration, ok: bool) {
        if ok {
            self.promotions_succeeded.inc();
            self.promotion_latency
                .observe(elapsed.as_secs_f64() * 1000.0);
        } else {
            self.promotions_failed.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render in Prometheus text format. `is_primary` is reported as a gauge.
    pub fn to_prometheus(&self, is_primary: bool) -> String {
        let mut out = String::new();

        let counters = [
            ("acquisitions_total", "Successful lease acquisitions", &self.acquisitions),
            (
                "acquisition_conflicts_total",
                "Acquisition attempts lost to another holder",
                &self.acquisition_conflicts,
            ),
            ("renewals_total", "Successful lease renewals", &self.renewals),
            ("renewal_failures_total", "Failed lease renewals", &self.renewal_failures),
            ("demotions_total", "Primary to replica transitions", &self.demotions),
            ("handoffs_served_total", "Handoff requests honoured", &self.handoffs_served),
            ("handoffs_rejected_total", "Handoff requests refused", &self.handoffs_rejected),
            (
                "promotions_succeeded_total",
                "Promotions that observed this node primary",
                &self.promotions_succeeded,
            ),
            ("promotions_failed_total", "Promotions that failed", &self.promotions_failed),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP minilease_{} {}", name, help);
            let _ = writeln!(out, "# TYPE minilease_{} counter", name);
            let _ = writeln!(out, "minilease_{} {}", name, counter.get());
        }

        out.push_str("# HELP minilease_is_primary Whether this node holds the lease\n");
        out.push_str("# TYPE minilease_is_primary gauge\n");
        let _ = writeln!(out, "minilease_is_primary {}", is_primary as u8);

        out.push_str("# HELP minilease_uptime_seconds Node uptime in seconds\n");
        out.push_str("# TYPE minilease_uptime_seconds gauge\n");
        let _ = writeln!(out, "minilease_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP minilease_promotion_duration_ms Time to observe promotion\n");
        out.push_str("# TYPE minilease_promotion_duration_ms histogram\n");
        for (le, count) in self.promotion_latency.cumulative() {
            if le.is_infinite() {
                let _ = writeln!(out, "minilease_promotion_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "minilease_promotion_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "minilease_promotion_duration_ms_sum {}", self.promotion_latency.sum());
        let _ = writeln!(out, "minilease_promotion_duration_ms_count {}", self.promotion_latency.count());

        out
    }
}

impl Default for LeadershipMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<LeadershipMetrics> =
    once_cell::sync::Lazy::new(LeadershipMetrics::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_cumulative() {
        let hist = Histogram::with_buckets(&PROMOTION_BUCKETS);
        hist.observe(5.0);
        hist.observe(120.0);
        hist.observe(60_000.0);

        let buckets = hist.cumulative();
        assert_eq!(buckets.first(), Some(&(10.0, 1)));
        assert_eq!(buckets.last().map(|b| b.1), Some(3));
        assert_eq!(hist.count(), 3);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = LeadershipMetrics::new();
        metrics.acquisitions.inc();
        metrics.record_promotion(Duration::from_millis(300), true);
        metrics.record_promotion(Duration::from_millis(300), false);

        let text = metrics.to_prometheus(true);
        assert!(text.contains("minilease_acquisitions_total 1"));
        assert!(text.contains("minilease_promotions_failed_total 1"));
        assert!(text.contains("minilease_is_primary 1"));
        assert!(text.contains("minilease_promotion_duration_ms_count 1"));
    }
}
