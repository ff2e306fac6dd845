//! Lightweight operational counters (SPEC_FULL.md §9.5). Plain `AtomicU64`s
//! rather than a metrics crate: the teacher stack carries no
//! Prometheus/OpenTelemetry dependency, so this follows the same
//! "structured tracing is the observability layer" texture and only adds
//! the few counters `/status`'s aggregate form and shutdown logging need.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    requests_admitted: AtomicU64,
    requests_rejected: AtomicU64,
    cancellations_fired: AtomicU64,
}

impl Metrics {
    pub fn record_admitted(&self) {
        self.requests_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellations(&self, count: usize) {
        self.cancellations_fired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, tts_fallback_count: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            cancellations_fired: self.cancellations_fired.load(Ordering::Relaxed),
            tts_fallback_count,
        }
    }
}

#[derive(serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_admitted: u64,
    pub requests_rejected: u64,
    pub cancellations_fired: u64,
    pub tts_fallback_count: u64,
}
