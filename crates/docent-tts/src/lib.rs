//! TTS Dispatcher (spec.md §4.5, C5).
//!
//! A provider-agnostic façade over `docent_providers::TtsProvider`
//! implementations, selected by the closed `TtsProviderKind` sum type
//! (spec.md §9 REDESIGN FLAGS — table-driven selection replacing dynamic
//! plugin dispatch). Grounded on the mock providers' `futures::stream`
//! idiom for the lazy wrapper, and on `docent-cancel`'s `CancelAware`
//! helper for forwarding cancellation into every provider call.

use dashmap::DashMap;
use docent_cancel::CancelToken;
use docent_core::error::ApiError;
use docent_providers::{TtsAudioStream, TtsChunk, TtsProvider, TtsProviderKind, VoiceConfig};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Registered providers plus the single configured fallback kind (spec.md
/// §4.5: "if fallback is configured, retry once with the fallback
/// provider"). One fallback, not a chain: the spec's retry-once rule only
/// ever needs one alternate.
pub struct TtsDispatcher {
    providers: Arc<DashMap<TtsProviderKind, Arc<dyn TtsProvider>>>,
    fallback: Option<TtsProviderKind>,
    fallback_count: Arc<AtomicU64>,
}

impl TtsDispatcher {
    pub fn new(fallback: Option<TtsProviderKind>) -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            fallback,
            fallback_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of times dispatch has fallen back to the secondary provider,
    /// across both pre-stream and mid-stream fallback paths. Exposed for
    /// the service's aggregate metrics endpoint.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    pub fn register(&self, kind: TtsProviderKind, provider: Arc<dyn TtsProvider>) {
        self.providers.insert(kind, provider);
    }

    fn provider(&self, kind: TtsProviderKind) -> Result<Arc<dyn TtsProvider>, ApiError> {
        self.providers
            .get(&kind)
            .map(|p| p.clone())
            .ok_or_else(|| ApiError::TtsError {
                provider: kind.to_string(),
                message: "provider not registered".to_string(),
            })
    }

    /// Selects `primary`, translates `voice` into the provider's
    /// parameters (the provider itself owns that translation; this layer
    /// only picks *which* provider), forwards `cancel`, and returns a lazy
    /// audio stream. On immediate selection/connect failure, falls back
    /// once if configured (spec.md §4.5).
    pub async fn dispatch(
        &self,
        primary: TtsProviderKind,
        text: String,
        voice: VoiceConfig,
        cancel: CancelToken,
    ) -> Result<TtsAudioStream, ApiError> {
        match self.try_stream(primary, &text, &voice, &cancel).await {
            Ok(stream) => Ok(self.with_fallback(stream, primary, text, voice, cancel)),
            Err(e) => {
                if let Some(fallback) = self.fallback_for(primary) {
                    warn!(primary = %primary, fallback = %fallback, error = %e, "tts provider failed before streaming, falling back");
                    self.fallback_count.fetch_add(1, Ordering::Relaxed);
                    self.try_stream(fallback, &text, &voice, &cancel).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn try_stream(
        &self,
        kind: TtsProviderKind,
        text: &str,
        voice: &VoiceConfig,
        cancel: &CancelToken,
    ) -> Result<TtsAudioStream, ApiError> {
        let provider = self.provider(kind)?;
        provider.stream_tts(text, voice, cancel).await
    }

    fn fallback_for(&self, primary: TtsProviderKind) -> Option<TtsProviderKind> {
        self.fallback.filter(|&fb| fb != primary)
    }

    /// Wraps `stream` so that a mid-stream error triggers exactly one
    /// fallback attempt, but only if no audio byte has yet been delivered
    /// downstream (spec.md §4.5 "never retry after any audio bytes have
    /// been delivered downstream").
    fn with_fallback(
        &self,
        stream: TtsAudioStream,
        primary: TtsProviderKind,
        text: String,
        voice: VoiceConfig,
        cancel: CancelToken,
    ) -> TtsAudioStream {
        let fallback = self.fallback_for(primary);
        let providers = self.providers.clone();
        let fallback_count = self.fallback_count.clone();
        enum St {
            Active { stream: TtsAudioStream, delivered: bool },
            Done,
        }
        let state = St::Active { stream, delivered: false };
        Box::pin(futures::stream::unfold(
            (state, fallback, text, voice, cancel, providers, fallback_count),
            move |(mut st, fallback, text, voice, cancel, providers, fallback_count)| async move {
                loop {
                    match st {
                        St::Done => return None,
                        St::Active { mut stream, delivered } => match stream.next().await {
                            Some(Ok(chunk)) => {
                                return Some((
                                    Ok(chunk),
                                    (St::Active { stream, delivered: true }, fallback, text, voice, cancel, providers, fallback_count),
                                ));
                            }
                            Some(Err(e)) if !delivered => {
                                if let Some(fb) = fallback {
                                    if let Some(provider) = providers.get(&fb).map(|p| p.clone()) {
                                        warn!(fallback = %fb, error = %e, "tts provider failed mid-stream, falling back");
                                        fallback_count.fetch_add(1, Ordering::Relaxed);
                                        match provider.stream_tts(&text, &voice, &cancel).await {
                                            Ok(fb_stream) => {
                                                st = St::Active { stream: fb_stream, delivered: false };
                                                continue;
                                            }
                                            Err(e2) => {
                                                return Some((Err(e2), (St::Done, None, text, voice, cancel, providers, fallback_count)));
                                            }
                                        }
                                    }
                                }
                                return Some((Err(e), (St::Done, None, text, voice, cancel, providers, fallback_count)));
                            }
                            Some(Err(e)) => {
                                // Audio already flowed: never retry, just surface the error and end.
                                return Some((Err(e), (St::Done, None, text, voice, cancel, providers, fallback_count)));
                            }
                            None => return None,
                        },
                    }
                }
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docent_providers::mock::MockTtsProvider;
    use std::time::Duration;

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
    async fn dispatch_streams_from_registered_provider() {
        let dispatcher = TtsDispatcher::new(None);
        dispatcher.register(TtsProviderKind::Edge, Arc::new(MockTtsProvider::new()));
        let stream = dispatcher
            .dispatch(TtsProviderKind::Edge, "hello world".into(), VoiceConfig::new(), token())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[tokio::test]
    async fn unregistered_provider_without_fallback_errors() {
        let dispatcher = TtsDispatcher::new(None);
        let err = dispatcher
            .dispatch(TtsProviderKind::Edge, "hi".into(), VoiceConfig::new(), token())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TtsError { .. }));
    }

    #[tokio::test]
    async fn falls_back_once_when_primary_fails_before_streaming() {
        let dispatcher = TtsDispatcher::new(Some(TtsProviderKind::Sapi));
        dispatcher.register(TtsProviderKind::Edge, Arc::new(MockTtsProvider::new().failing()));
        dispatcher.register(TtsProviderKind::Sapi, Arc::new(MockTtsProvider::new()));
        let stream = dispatcher
            .dispatch(TtsProviderKind::Edge, "hello".into(), VoiceConfig::new(), token())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.is_ok()));
    }

    #[tokio::test]
    async fn no_fallback_without_configuration() {
        let dispatcher = TtsDispatcher::new(None);
        dispatcher.register(TtsProviderKind::Edge, Arc::new(MockTtsProvider::new().failing()));
        let err = dispatcher
            .dispatch(TtsProviderKind::Edge, "hello".into(), VoiceConfig::new(), token())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::TtsError { .. }));
    }

    #[tokio::test]
    async fn cancellation_is_forwarded_into_provider() {
        let dispatcher = TtsDispatcher::new(None);
        dispatcher.register(
            TtsProviderKind::Edge,
            Arc::new(MockTtsProvider::new().with_delay(Duration::from_secs(5))),
        );
        let cancel = token();
        let fire = cancel.clone();
        let stream = dispatcher
            .dispatch(TtsProviderKind::Edge, "hello".into(), VoiceConfig::new(), cancel)
            .await
            .unwrap();
        fire.fire();
        let mut stream = stream;
        let first = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("cancellation observed promptly")
            .unwrap();
        assert!(matches!(first, Err(ApiError::Cancelled)));
    }
}
