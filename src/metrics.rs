//! Per-request telemetry with bounded memory.
//!
//! Samples land in a fixed-capacity ring buffer behind one mutex. The
//! critical section only copies the sample in and bumps counters; all
//! aggregation (percentiles, per-endpoint breakdown) runs on a snapshot copy
//! so the request path never waits on a reader.
//!
//! The collector is constructed explicitly and injected as an `Arc`, never a
//! module-level singleton, so tests get a fresh one each time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-capacity FIFO buffer. Push is O(1) and evicts the oldest entry once
/// full; the length never exceeds capacity.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Contents in insertion order, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// One finalized request observation. Created at request start, finalized
/// exactly once at completion or error.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub duration_ms: f64,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub streaming: bool,
}

impl MetricSample {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            method: method.into(),
            status: 0,
            duration_ms: 0.0,
            request_bytes: 0,
            response_bytes: 0,
            streaming: false,
        }
    }
}

/// Optional filters applied before aggregation.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Keep samples whose endpoint contains this substring.
    pub endpoint_contains: Option<String>,
    /// Keep samples recorded at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub errors: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub p50_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    /// Keyed `"METHOD endpoint"`; BTreeMap keeps exposition order stable.
    pub endpoints: BTreeMap<String, EndpointStats>,
    /// Lifetime counter, not bounded by the buffer.
    pub recorded_total: u64,
}

struct Inner {
    buffer: RingBuffer<MetricSample>,
    recorded_total: u64,
}

pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: RingBuffer::new(capacity),
                recorded_total: 0,
            }),
        }
    }

    /// O(1); the lock covers only the buffer push and a counter bump.
    pub fn record(&self, sample: MetricSample) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.buffer.push(sample);
            inner.recorded_total += 1;
        }
    }

    #[must_use]
    pub fn snapshot(&self, filter: &SnapshotFilter) -> MetricsSnapshot {
        // Copy out under the lock, aggregate outside it.
        let (samples, recorded_total) = match self.inner.lock() {
            Ok(inner) => (inner.buffer.to_vec(), inner.recorded_total),
            Err(_) => (Vec::new(), 0),
        };

        let samples: Vec<MetricSample> = samples
            .into_iter()
            .filter(|s| {
                filter
                    .endpoint_contains
                    .as_deref()
                    .map_or(true, |sub| s.endpoint.contains(sub))
                    && filter.since.map_or(true, |since| s.timestamp >= since)
            })
            .collect();

        let total = samples.len() as u64;
        let successful = samples
            .iter()
            .filter(|s| (200..300).contains(&s.status))
            .count() as u64;

        let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut endpoints: BTreeMap<String, EndpointStats> = BTreeMap::new();
        for sample in &samples {
            let key = format!("{} {}", sample.method, sample.endpoint);
            let entry = endpoints.entry(key).or_insert(EndpointStats {
                count: 0,
                errors: 0,
                avg_duration_ms: 0.0,
            });
            entry.count += 1;
            if sample.status >= 400 || sample.status == 0 {
                entry.errors += 1;
            }
            entry.avg_duration_ms += sample.duration_ms;
        }
        for stats in endpoints.values_mut() {
            if stats.count > 0 {
                stats.avg_duration_ms /= stats.count as f64;
            }
        }

        MetricsSnapshot {
            total_requests: total,
            successful_requests: successful,
            failed_requests: total - successful,
            p50_duration_ms: percentile(&durations, 50.0),
            p95_duration_ms: percentile(&durations, 95.0),
            p99_duration_ms: percentile(&durations, 99.0),
            endpoints,
            recorded_total,
        }
    }

    /// Text exposition of the snapshot aggregates. Line order is
    /// deterministic: fixed header lines, then endpoints in key order.
    #[must_use]
    pub fn export_text(&self) -> String {
        let snapshot = self.snapshot(&SnapshotFilter::default());

        let mut lines = vec![
            "# HELP proxy_requests_total Requests observed in the metrics window".to_string(),
            "# TYPE proxy_requests_total counter".to_string(),
            format!("proxy_requests_total {}", snapshot.total_requests),
            "# HELP proxy_requests_failed Requests that ended in error".to_string(),
            "# TYPE proxy_requests_failed counter".to_string(),
            format!("proxy_requests_failed {}", snapshot.failed_requests),
            "# HELP proxy_request_duration_ms Request duration percentiles".to_string(),
            "# TYPE proxy_request_duration_ms summary".to_string(),
            format!(
                "proxy_request_duration_ms{{quantile=\"0.5\"}} {:.3}",
                snapshot.p50_duration_ms
            ),
            format!(
                "proxy_request_duration_ms{{quantile=\"0.95\"}} {:.3}",
                snapshot.p95_duration_ms
            ),
            format!(
                "proxy_request_duration_ms{{quantile=\"0.99\"}} {:.3}",
                snapshot.p99_duration_ms
            ),
        ];

        for (key, stats) in &snapshot.endpoints {
            let (method, endpoint) = key.split_once(' ').unwrap_or(("", key));
            lines.push(format!(
                "proxy_endpoint_requests_total{{method=\"{method}\",endpoint=\"{endpoint}\"}} {}",
                stats.count
            ));
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Drop all recorded samples. For tests.
    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            let capacity = inner.buffer.capacity;
            inner.buffer = RingBuffer::new(capacity);
            inner.recorded_total = 0;
        }
    }
}

/// Linear-interpolated percentile over a sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    if lower == upper {
        return sorted[lower];
    }
    let weight = index - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}
