//! Derived latency metrics (spec.md §4.3 `derive`). Matches event `name`s
//! against the fixed anchor table; missing anchors yield `null` (`None`).

use crate::anchors;
use docent_core::model::Event;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DerivedTimings {
    pub submit_to_rag_first_chunk_ms: Option<u64>,
    pub submit_to_rag_first_text_ms: Option<u64>,
    pub submit_to_first_segment_ms: Option<u64>,
    pub submit_to_tts_first_audio_ms: Option<u64>,
    pub submit_to_play_end_ms: Option<u64>,
    pub rag_duration_ms: Option<u64>,
    pub tts_count: u32,
}

fn first_ts(events: &[Event], name: &str) -> Option<u64> {
    events.iter().find(|e| e.name == name).map(|e| e.ts_ms)
}

pub fn derive_timings(events: &[Event]) -> DerivedTimings {
    let submit = first_ts(events, anchors::SUBMIT);
    let rag_first_chunk = first_ts(events, anchors::RAG_FIRST_CHUNK);
    let rag_done = first_ts(events, anchors::RAG_DONE).or_else(|| first_ts(events, anchors::RAG_PARTIAL));
    let first_segment = first_ts(events, anchors::FIRST_SEGMENT);
    let tts_first_audio = first_ts(events, anchors::TTS_FIRST_AUDIO);
    let play_end = first_ts(events, anchors::PLAY_END);
    let tts_count = events
        .iter()
        .filter(|e| e.name == anchors::TTS_AUDIO_EMITTED)
        .count() as u32;

    let delta = |from: Option<u64>, to: Option<u64>| match (from, to) {
        (Some(a), Some(b)) if b >= a => Some(b - a),
        _ => None,
    };

    DerivedTimings {
        submit_to_rag_first_chunk_ms: delta(submit, rag_first_chunk),
        // "first_chunk" and "first_text" are the same anchor in this
        // system: RAG's streaming unit is text, so there is no separate
        // byte-level event to key off.
        submit_to_rag_first_text_ms: delta(submit, rag_first_chunk),
        submit_to_first_segment_ms: delta(submit, first_segment),
        submit_to_tts_first_audio_ms: delta(submit, tts_first_audio),
        submit_to_play_end_ms: delta(submit, play_end),
        rag_duration_ms: delta(submit, rag_done),
        tts_count,
    }
}
