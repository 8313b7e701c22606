//! Routing and write-path metrics
//!
//! Lock-free counters rendered in the Prometheus text format at `/metrics`:
//! - where reads were routed, and why the primary was chosen when it was
//! - committed writes, serialization conflicts, retries exhausted
//! - session position advances and their failures (consistency-risk events)
//! - per-endpoint request counts and latency histograms

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: &'static [f64],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=LATENCY_BUCKETS.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: &LATENCY_BUCKETS,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, millis: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| millis <= b)
            .unwrap_or(self.boundaries.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(upper_bound, count)` pairs, ending with `+Inf`
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                let bound = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
                (bound, running)
            })
            .collect()
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Endpoint metrics
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Why a read went to the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The session has never written
    NoWrites,
    /// No replica has caught up to the session's position
    NoCandidates,
    /// The status store returned an error
    StatusUnavailable,
    /// The status store did not answer in time
    StatusTimeout,
    /// The session's position could not be read
    TrackerUnavailable,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::NoWrites => "no_writes",
            FallbackReason::NoCandidates => "no_candidates",
            FallbackReason::StatusUnavailable => "status_unavailable",
            FallbackReason::StatusTimeout => "status_timeout",
            FallbackReason::TrackerUnavailable => "tracker_unavailable",
        }
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<BTreeMap<String, Arc<EndpointMetrics>>>,

    pub reads_primary: Counter,
    pub reads_replica: Counter,
    pub fallback_no_writes: Counter,
    pub fallback_no_candidates: Counter,
    pub fallback_status_unavailable: Counter,
    pub fallback_status_timeout: Counter,
    pub fallback_tracker_unavailable: Counter,

    pub writes_committed: Counter,
    pub write_conflicts: Counter,
    pub write_conflicts_exhausted: Counter,
    pub positions_advanced: Counter,
    pub position_advance_failures: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(BTreeMap::new()),
            reads_primary: Counter::new(),
            reads_replica: Counter::new(),
            fallback_no_writes: Counter::new(),
            fallback_no_candidates: Counter::new(),
            fallback_status_unavailable: Counter::new(),
            fallback_status_timeout: Counter::new(),
            fallback_tracker_unavailable: Counter::new(),
            writes_committed: Counter::new(),
            write_conflicts: Counter::new(),
            write_conflicts_exhausted: Counter::new(),
            positions_advanced: Counter::new(),
            position_advance_failures: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    /// Record a finished request
    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    /// Record a read routed to the primary
    pub fn record_primary_read(&self, reason: FallbackReason) {
        self.reads_primary.inc();
        match reason {
            FallbackReason::NoWrites => self.fallback_no_writes.inc(),
            FallbackReason::NoCandidates => self.fallback_no_candidates.inc(),
            FallbackReason::StatusUnavailable => self.fallback_status_unavailable.inc(),
            FallbackReason::StatusTimeout => self.fallback_status_timeout.inc(),
            FallbackReason::TrackerUnavailable => self.fallback_tracker_unavailable.inc(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        header(&mut out, "ryw_reads_total", "Reads by routing target", "counter");
        line(&mut out, "ryw_reads_total{target=\"primary\"}", self.reads_primary.get());
        line(&mut out, "ryw_reads_total{target=\"replica\"}", self.reads_replica.get());

        header(
            &mut out,
            "ryw_route_fallback_total",
            "Reads sent to the primary, by reason",
            "counter",
        );
        for (reason, counter) in [
            (FallbackReason::NoWrites, &self.fallback_no_writes),
            (FallbackReason::NoCandidates, &self.fallback_no_candidates),
            (FallbackReason::StatusUnavailable, &self.fallback_status_unavailable),
            (FallbackReason::StatusTimeout, &self.fallback_status_timeout),
            (FallbackReason::TrackerUnavailable, &self.fallback_tracker_unavailable),
        ] {
            line(
                &mut out,
                &format!("ryw_route_fallback_total{{reason=\"{}\"}}", reason.as_str()),
                counter.get(),
            );
        }

        for (name, help, counter) in [
            ("ryw_writes_committed_total", "Committed writes", &self.writes_committed),
            ("ryw_write_conflicts_total", "Serialization conflicts retried", &self.write_conflicts),
            (
                "ryw_write_conflicts_exhausted_total",
                "Writes failed after exhausting conflict retries",
                &self.write_conflicts_exhausted,
            ),
            ("ryw_position_advanced_total", "Session positions advanced", &self.positions_advanced),
            (
                "ryw_position_advance_failures_total",
                "Committed writes whose session position could not be advanced",
                &self.position_advance_failures,
            ),
        ] {
            header(&mut out, name, help, "counter");
            line(&mut out, name, counter.get());
        }

        header(&mut out, "ryw_uptime_seconds", "Server uptime in seconds", "gauge");
        line(&mut out, "ryw_uptime_seconds", self.uptime_seconds());

        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());

        header(&mut out, "ryw_endpoint_requests_total", "Requests per endpoint", "counter");
        for (path, m) in endpoints.iter() {
            line(
                &mut out,
                &format!("ryw_endpoint_requests_total{{path=\"{}\"}}", path),
                m.requests_total.get(),
            );
        }

        header(&mut out, "ryw_endpoint_errors_total", "Errors per endpoint", "counter");
        for (path, m) in endpoints.iter() {
            line(
                &mut out,
                &format!("ryw_endpoint_errors_total{{path=\"{}\"}}", path),
                m.requests_error.get(),
            );
        }

        header(
            &mut out,
            "ryw_request_duration_ms",
            "Request duration in milliseconds",
            "histogram",
        );
        for (path, m) in endpoints.iter() {
            for (le, count) in m.latency.cumulative() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                line(
                    &mut out,
                    &format!("ryw_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}}", path, le),
                    count,
                );
            }
            let _ = writeln!(
                out,
                "ryw_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                m.latency.sum()
            );
            line(
                &mut out,
                &format!("ryw_request_duration_ms_count{{path=\"{}\"}}", path),
                m.latency.count(),
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn line(out: &mut String, series: &str, value: u64) {
    let _ = writeln!(out, "{} {}", series, value);
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
