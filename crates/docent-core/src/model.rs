//! Data model from spec.md §3.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{ClientId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Ask,
    AskPrefetch,
    WakeWord,
}

/// One admitted unit of work. Created on admission, terminated exactly once.
/// Never mutated after creation except via the lifecycle transitions that
/// own it (the cancellation fabric fires its token; the orchestrator
/// records its outcome); `Request` itself stays a plain value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub kind: RequestKind,
    /// Monotonic milliseconds since process start, not wall-clock time.
    pub created_at_ms: u64,
    pub parent_request_id: Option<RequestId>,
}

/// A lazily-produced, TTS-ready slice of text. Ordered strictly by `seq`
/// within a request (spec.md §3 invariant 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedChunk {
    pub seq: u32,
    pub text: String,
    pub finalized: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    pub request_id: RequestId,
    pub seq: u32,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub duration_hint_ms: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Nav,
    Rag,
    Tts,
    Asr,
    App,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only timeline entry (spec.md §3 "Event"). `fields` is a small,
/// string-keyed map rather than an arbitrary `serde_json::Value` tree: the
/// event store's derived-timing matcher only ever needs scalar values
/// keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub ts_ms: u64,
    pub kind: EventKind,
    pub name: String,
    pub level: EventLevel,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        request_id: RequestId,
        client_id: ClientId,
        ts_ms: u64,
        kind: EventKind,
        name: impl Into<String>,
        level: EventLevel,
    ) -> Self {
        Self {
            request_id,
            client_id,
            ts_ms,
            kind,
            name: name.into(),
            level,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TourMode {
    Idle,
    Running,
    Paused,
    Interrupted,
}

/// One instance per client. `stop_index` is only meaningful while
/// `mode != Idle` (spec.md §3 invariant on `TourState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TourState {
    pub mode: TourMode,
    pub zone: String,
    pub profile: String,
    pub stops: Vec<String>,
    pub stop_index: usize,
    pub template_id: String,
    pub style: String,
    pub duration_s: u32,
    pub active_request_id: Option<RequestId>,
    pub epoch: u64,
    /// Whether an `interrupt` that resolves (the user's question completes)
    /// auto-fires `resume` instead of staying `interrupted` (spec.md §4.7).
    /// Set at `start`; not itself an Open Question — `ContinuousTourResume`
    /// in `docent_core::config` answers the *separate* question of whether
    /// that auto-resume restarts the stop or resumes it in place.
    pub continuous_tour: bool,
    /// Count of `AudioSegment`s already delivered for the interrupted stop
    /// at the moment `interrupt` fired, or `None` outside `Interrupted`.
    /// Consulted by `resume` only under `ContinuousTourResume::ResumeInPlace`
    /// (spec.md §9 Open Questions); ignored under the default `Restart`.
    pub interrupted_at_seq: Option<u32>,
}

impl TourState {
    pub fn idle() -> Self {
        Self {
            mode: TourMode::Idle,
            zone: String::new(),
            profile: String::new(),
            stops: Vec::new(),
            stop_index: 0,
            template_id: String::new(),
            style: String::new(),
            duration_s: 0,
            active_request_id: None,
            epoch: 0,
            continuous_tour: false,
            interrupted_at_seq: None,
        }
    }

    pub fn current_stop(&self) -> Option<&str> {
        if self.mode == TourMode::Idle {
            return None;
        }
        self.stops.get(self.stop_index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchStatus {
    Pending,
    Ready,
    Consumed,
    Evicted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchSlot {
    pub stop_index: usize,
    pub epoch: u64,
    pub status: PrefetchStatus,
    pub text_chunks: Vec<CleanedChunk>,
    pub audio_segments: Vec<AudioSegment>,
}

impl PrefetchSlot {
    pub fn pending(stop_index: usize, epoch: u64) -> Self {
        Self {
            stop_index,
            epoch,
            status: PrefetchStatus::Pending,
            text_chunks: Vec::new(),
            audio_segments: Vec::new(),
        }
    }

    /// spec.md §3 invariant 5: a slot whose epoch no longer matches the
    /// tour's current epoch is unreachable.
    pub fn is_reachable(&self, current_epoch: u64) -> bool {
        self.epoch == current_epoch && self.status != PrefetchStatus::Evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_tour_has_no_current_stop() {
        let t = TourState::idle();
        assert_eq!(t.current_stop(), None);
    }

    #[test]
    fn prefetch_slot_unreachable_after_epoch_change() {
        let slot = PrefetchSlot::pending(1, 3);
        assert!(slot.is_reachable(3));
        assert!(!slot.is_reachable(4));
    }
}
