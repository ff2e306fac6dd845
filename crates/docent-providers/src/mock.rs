//! Deterministic ASR/RAG/TTS stand-ins for tests and for running
//! `docent-service` without live providers. Analogous in spirit to the
//! teacher's `InMemoryEventBus`/`NullEventBus` test doubles
//! (`gibberish-events::bus`): no network calls, fully inspectable,
//! configurable to inject the failure shapes the orchestrator must
//! handle.

use async_trait::async_trait;
use docent_cancel::CancelToken;
use docent_core::error::ApiError;
use futures::stream::{self, StreamExt};
use std::time::Duration;

use crate::traits::{AsrProvider, RagProvider, TextStream, TtsAudioStream, TtsChunk, TtsProvider};
use crate::voice::VoiceConfig;

#[derive(Debug, Clone)]
pub struct MockAsrProvider {
    pub transcript: String,
    pub delay: Duration,
}

impl MockAsrProvider {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self { transcript: transcript.into(), delay: Duration::ZERO }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AsrProvider for MockAsrProvider {
    async fn transcribe(&self, _audio: Vec<u8>, cancel: &CancelToken) -> Result<String, ApiError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(self.transcript.clone()),
        }
    }
}

/// Yields `fragments` one at a time (each delayed by `inter_fragment_delay`)
/// then, if `fail_after` is `Some(n)`, errors after the n-th fragment
/// instead of completing — used to exercise spec.md §4.6's "RAG error
/// mid-stream" path.
#[derive(Debug, Clone)]
pub struct MockRagProvider {
    pub fragments: Vec<String>,
    pub inter_fragment_delay: Duration,
    pub fail_after: Option<usize>,
}

impl MockRagProvider {
    pub fn new(fragments: Vec<String>) -> Self {
        Self { fragments, inter_fragment_delay: Duration::ZERO, fail_after: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.inter_fragment_delay = delay;
        self
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

#[async_trait]
impl RagProvider for MockRagProvider {
    async fn ask(
        &self,
        _question: &str,
        _session_id: &str,
        cancel: &CancelToken,
    ) -> Result<TextStream, ApiError> {
        let fragments = self.fragments.clone();
        let delay = self.inter_fragment_delay;
        let fail_after = self.fail_after;
        let cancel = cancel.clone();

        let items: Vec<Result<String, ApiError>> = fragments
            .into_iter()
            .enumerate()
            .map(|(i, frag)| {
                if fail_after.map(|n| i >= n).unwrap_or(false) {
                    Err(ApiError::RagError {
                        provider: "mock".to_string(),
                        message: "simulated mid-stream failure".to_string(),
                    })
                } else {
                    Ok(frag)
                }
            })
            .collect();

        // Truncate after the first injected error: a real provider stops
        // producing once it errors.
        let mut truncated = Vec::new();
        for item in items {
            let is_err = item.is_err();
            truncated.push(item);
            if is_err {
                break;
            }
        }

        let stream = stream::iter(truncated).then(move |item| {
            let delay = delay;
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(delay) => item,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Clone)]
pub struct MockTtsProvider {
    pub content_type: String,
    pub bytes_per_chunk: usize,
    pub per_chunk_delay: Duration,
    pub fail: bool,
}

impl MockTtsProvider {
    pub fn new() -> Self {
        Self {
            content_type: "audio/mpeg".to_string(),
            bytes_per_chunk: 16,
            per_chunk_delay: Duration::ZERO,
            fail: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.per_chunk_delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl Default for MockTtsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsProvider for MockTtsProvider {
    async fn stream_tts(
        &self,
        text: &str,
        _voice: &VoiceConfig,
        cancel: &CancelToken,
    ) -> Result<TtsAudioStream, ApiError> {
        if self.fail {
            return Err(ApiError::TtsError {
                provider: "mock".to_string(),
                message: "simulated provider failure".to_string(),
            });
        }
        let content_type = self.content_type.clone();
        let delay = self.per_chunk_delay;
        let cancel = cancel.clone();
        // One synthetic chunk per `bytes_per_chunk` characters of input text.
        let chunk_count = text.len().div_ceil(self.bytes_per_chunk.max(1)).max(1);
        let stream = stream::iter(0..chunk_count).then(move |_| {
            let content_type = content_type.clone();
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(TtsChunk {
                        bytes: vec![0u8; 4],
                        content_type,
                        duration_hint_ms: Some(50),
                    }),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    fn token() -> CancelToken {
        let fabric = docent_cancel::CancellationFabric::new();
        fabric
            .register(
                docent_core::ids::ClientId("c".into()),
                docent_core::ids::RequestId("r".into()),
                docent_core::model::RequestKind::Ask,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn rag_mock_yields_fragments_in_order() {
        let rag = MockRagProvider::new(vec!["a".into(), "b".into(), "c".into()]);
        let tok = token();
        let mut stream = rag.ask("q", "s", &tok).await.unwrap();
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.unwrap());
        }
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn rag_mock_fails_after_n_fragments() {
        let rag = MockRagProvider::new(vec!["a".into(), "b".into(), "c".into()]).failing_after(2);
        let tok = token();
        let mut stream = rag.ask("q", "s", &tok).await.unwrap();
        let mut ok_count = 0;
        let mut saw_err = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => ok_count += 1,
                Err(_) => {
                    saw_err = true;
                    break;
                }
            }
        }
        assert_eq!(ok_count, 2);
        assert!(saw_err);
    }

    #[tokio::test]
    async fn tts_mock_chunk_count_scales_with_text() {
        let tts = MockTtsProvider::new();
        let tok = token();
        let stream = tts.stream_tts("0123456789012345", &VoiceConfig::new(), &tok).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
    }
}
