//! Destinations for a running request's text and audio output (spec.md
//! §4.6 step 8: "Both the text stream ... and the audio stream ... are
//! emitted concurrently"). Breaking the orchestrator's output target into
//! a trait lets the same pipeline feed an HTTP SSE/chunked response *or*
//! a tour `PrefetchSlot` without the orchestrator knowing which — the
//! one-way intents/outcomes message passing spec.md §9 REDESIGN FLAGS asks
//! for, expressed here as output sinks rather than a channel of named
//! messages.

//! Audio always lands in the shared `AudioBufferStore` (addressable by
//! `request_id` for `/tts_stream` and for tour prefetch replay), so only
//! the *text* destination varies by caller: an `/ask` SSE response reads
//! it live, a prefetch request collects it into a `PrefetchSlot`.

use async_trait::async_trait;
use docent_core::model::CleanedChunk;
use tokio::sync::mpsc;

#[async_trait]
pub trait TextSink: Send + Sync {
    async fn emit(&self, chunk: CleanedChunk);
}

/// Forwards to an mpsc channel; the HTTP layer holds the receiver and
/// renders SSE `text` frames from it.
pub struct ChannelTextSink(pub mpsc::Sender<CleanedChunk>);

#[async_trait]
impl TextSink for ChannelTextSink {
    async fn emit(&self, chunk: CleanedChunk) {
        let _ = self.0.send(chunk).await;
    }
}

/// Discards output. Used when nobody reads a request's text (e.g. a test
/// driving the pipeline for its audio/event side effects only).
pub struct NullSink;

#[async_trait]
impl TextSink for NullSink {
    async fn emit(&self, _chunk: CleanedChunk) {}
}
