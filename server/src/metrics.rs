// Metrics collection and tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stream_core::{Outcome, SessionReport};

/// Latency samples kept for percentiles.
const LATENCY_WINDOW: usize = 1000;

/// Per-endpoint metrics
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub request_count: Arc<AtomicU64>,
    pub error_count: Arc<AtomicU64>,
    pub total_latency_ms: Arc<AtomicU64>,
    pub min_latency_ms: Arc<AtomicU64>,
    pub max_latency_ms: Arc<AtomicU64>,
    pub latency_samples: Arc<Mutex<VecDeque<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            min_latency_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_latency_ms: Arc::new(AtomicU64::new(0)),
            latency_samples: Arc::new(Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW))),
        }
    }

    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);

        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        let mut current_max = self.max_latency_ms.load(Ordering::Relaxed);
        while latency_ms > current_max {
            match self.max_latency_ms.compare_exchange_weak(
                current_max,
                latency_ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }

        if let Ok(mut samples) = self.latency_samples.lock() {
            if samples.len() == LATENCY_WINDOW {
                samples.pop_front();
            }
            samples.push_back(latency_ms);
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    fn percentile(sorted: &[u64], p: u8) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn stats(&self) -> EndpointStats {
        let mut sorted: Vec<u64> = self
            .latency_samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();

        let min = self.min_latency_ms.load(Ordering::Relaxed);
        EndpointStats {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: Self::percentile(&sorted, 50),
            p95_latency_ms: Self::percentile(&sorted, 95),
            p99_latency_ms: Self::percentile(&sorted, 99),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome counters across all generation sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    pub completed: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub empty: Arc<AtomicU64>,
    pub rejected_busy: Arc<AtomicU64>,
    pub forced_stops: Arc<AtomicU64>,
    pub chunks_streamed: Arc<AtomicU64>,
    pub samples_generated: Arc<AtomicU64>,
    pub total_generation_ms: Arc<AtomicU64>,
}

impl SessionMetrics {
    pub fn record(&self, report: &SessionReport) {
        let counter = match report.outcome {
            Outcome::Completed => &self.completed,
            Outcome::Cancelled => &self.cancelled,
            Outcome::Failed { .. } => &self.failed,
            Outcome::Empty => &self.empty,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if report.forced_stop {
            self.forced_stops.fetch_add(1, Ordering::Relaxed);
        }
        self.chunks_streamed
            .fetch_add(report.stats.chunks_emitted, Ordering::Relaxed);
        self.samples_generated
            .fetch_add(report.stats.samples_ingested as u64, Ordering::Relaxed);
        self.total_generation_ms
            .fetch_add(report.generation_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.rejected_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> u64 {
        [&self.completed, &self.cancelled, &self.failed, &self.empty]
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> SessionMetricsResponse {
        let sessions = self.sessions();
        let total_ms = self.total_generation_ms.load(Ordering::Relaxed);
        SessionMetricsResponse {
            sessions,
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
            forced_stops: self.forced_stops.load(Ordering::Relaxed),
            chunks_streamed: self.chunks_streamed.load(Ordering::Relaxed),
            samples_generated: self.samples_generated.load(Ordering::Relaxed),
            avg_generation_time_ms: if sessions == 0 {
                0.0
            } else {
                total_ms as f64 / sessions as f64
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    pub generate: EndpointMetrics,
    pub stream: EndpointMetrics,
    pub sessions: SessionMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub sessions: SessionMetricsResponse,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub generate: EndpointStats,
    pub stream: EndpointStats,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetricsResponse {
    pub sessions: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub empty: u64,
    pub rejected_busy: u64,
    pub forced_stops: u64,
    pub chunks_streamed: u64,
    pub samples_generated: u64,
    pub avg_generation_time_ms: f64,
}
