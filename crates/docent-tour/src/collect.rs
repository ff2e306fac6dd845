//! A `TextSink` that stages chunks into a `PrefetchSlot` instead of
//! streaming them to an HTTP response (spec.md §4.8: "text and audio are
//! staged in the slot rather than streamed to any HTTP response"). Audio
//! needs no equivalent: every orchestrator run already lands its
//! `AudioSegment`s in the shared `AudioBufferStore` keyed by `request_id`
//! regardless of which `TextSink` is in play (see `docent_orchestrator`'s
//! `sinks` module doc comment), so the prefetch pipeline reads those back
//! by `request_id` once narration completes rather than collecting them
//! itself.

use async_trait::async_trait;
use docent_core::model::CleanedChunk;
use docent_orchestrator::TextSink;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CollectingTextSink(pub Arc<Mutex<Vec<CleanedChunk>>>);

impl CollectingTextSink {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn take(&self) -> Vec<CleanedChunk> {
        std::mem::take(&mut self.0.lock())
    }
}

#[async_trait]
impl TextSink for CollectingTextSink {
    async fn emit(&self, chunk: CleanedChunk) {
        self.0.lock().push(chunk);
    }
}
