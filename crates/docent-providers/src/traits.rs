//! ASR / RAG / TTS contracts. Streaming methods return
//! `Pin<Box<dyn Stream<Item = Result<_, ApiError>> + Send>>`, the same
//! shape as the teacher's `querymt::chat::ChatProvider::chat_stream`
//! (`crates/querymt/src/chat/mod.rs`).

use async_trait::async_trait;
use docent_cancel::CancelToken;
use docent_core::error::ApiError;
use futures::Stream;
use std::pin::Pin;

use crate::voice::VoiceConfig;

/// Blocking (request/response) ASR: audio in, transcript out. Spec.md's
/// `/speech_to_text` endpoint and the orchestrator's "if input is audio,
/// call ASR" step (§4.6) both use a single call rather than a stream.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<String, ApiError>;
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Question in, streaming textual answer out. Fragment boundaries are
/// provider-determined and arbitrary (spec.md §4.4) — the cleaner, not
/// this trait, is responsible for turning them into sentence-shaped
/// chunks.
#[async_trait]
pub trait RagProvider: Send + Sync {
    async fn ask(
        &self,
        question: &str,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<TextStream, ApiError>;
}

#[derive(Debug, Clone)]
pub struct TtsChunk {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub duration_hint_ms: Option<u32>,
}

pub type TtsAudioStream = Pin<Box<dyn Stream<Item = Result<TtsChunk, ApiError>> + Send>>;

/// Text in, streaming audio out (spec.md §4.5 capability set
/// `{stream_tts(text, voice_config, cancel_token) -> lazy AudioSegment
/// sequence (finite)}`).
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn stream_tts(
        &self,
        text: &str,
        voice: &VoiceConfig,
        cancel: &CancelToken,
    ) -> Result<TtsAudioStream, ApiError>;
}
