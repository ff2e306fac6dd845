//! Conversation Orchestrator (spec.md §4.6, C6).
//!
//! Wires the cancellation fabric (`docent_cancel`), the request registry
//! (`docent_registry`), the event store (`docent_events`), the cleaner
//! (`docent_cleaner`) and the TTS dispatcher (`docent_tts`) into the single
//! per-request pipeline spec.md §4.6 describes, plus the two stores the
//! HTTP surface (C9) and the tour prefetch pipeline (C8) both read from:
//! text via a caller-supplied `TextSink`, audio via the shared
//! `AudioBufferStore`.

mod audio_buffer;
mod intent;
mod pipeline;
mod sinks;

pub use audio_buffer::{AudioBufferStore, SharedAudioBufferStore};
pub use intent::{classify, templated_reply, Intent};
pub use pipeline::{AskInput, AskRequest, Orchestrator, OrchestratorDeps};
pub use sinks::{ChannelTextSink, NullSink, TextSink};

#[cfg(test)]
mod tests {
    use super::*;
    use docent_cancel::CancellationFabric;
    use docent_core::config::Config;
    use docent_core::error::ApiError;
    use docent_core::ids::{ClientId, RequestId};
    use docent_core::model::RequestKind;
    use docent_events::EventStore;
    use docent_providers::mock::{MockAsrProvider, MockRagProvider, MockTtsProvider};
    use docent_providers::{TtsProviderKind, VoiceConfig};
    use docent_registry::RequestRegistry;
    use docent_tts::TtsDispatcher;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn deps() -> OrchestratorDeps {
        let config = Config::default();
        let tts = TtsDispatcher::new(None);
        tts.register(TtsProviderKind::Edge, Arc::new(MockTtsProvider::new()));
        OrchestratorDeps {
            fabric: Arc::new(CancellationFabric::new()),
            registry: Arc::new(RequestRegistry::new(&config.rate_limits)),
            events: Arc::new(EventStore::new(config.event_retention)),
            audio_buffer: Arc::new(AudioBufferStore::new()),
            tts: Arc::new(tts),
            rag: Arc::new(MockRagProvider::new(vec!["The statue is made of bronze.".to_string()])),
            asr: Some(Arc::new(MockAsrProvider::new("unused"))),
            config,
        }
    }

    fn ask_request(request_id: &str, question: &str) -> AskRequest {
        AskRequest {
            request_id: RequestId(request_id.into()),
            client_id: ClientId("c1".into()),
            kind: RequestKind::Ask,
            parent_request_id: None,
            input: AskInput::Text(question.into()),
            session_id: "s1".into(),
            tts_provider: TtsProviderKind::Edge,
            voice: VoiceConfig::new(),
            resume_from_seq: 0,
        }
    }

    #[tokio::test]
    async fn ask_runs_to_completion_and_emits_done() {
        let deps = deps();
        let events = deps.events.clone();
        let orchestrator = Orchestrator::new(deps);
        let (tx, mut rx) = mpsc::channel(16);
        let request_id = orchestrator
            .ask(ask_request("r1", "what is this statue made of?"), Arc::new(ChannelTextSink(tx)))
            .await
            .unwrap();

        let mut saw_chunk = false;
        while rx.recv().await.is_some() {
            saw_chunk = true;
        }
        assert!(saw_chunk);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let log = events.query(&request_id, None, None);
        let names: Vec<_> = log.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"done"), "expected a done event, got {names:?}");
    }

    #[tokio::test]
    async fn second_ask_implicitly_cancels_first_of_same_kind() {
        let deps = deps();
        let fabric = deps.fabric.clone();
        let orchestrator = Orchestrator::new(deps);
        let (tx1, _rx1) = mpsc::channel(16);
        let first = orchestrator
            .ask(ask_request("r1", "tell me a long story"), Arc::new(ChannelTextSink(tx1)))
            .await
            .unwrap();
        assert!(fabric.is_registered(&first));

        let (tx2, _rx2) = mpsc::channel(16);
        let _second = orchestrator
            .ask(ask_request("r2", "another question"), Arc::new(ChannelTextSink(tx2)))
            .await
            .unwrap();

        // give the background task a moment to observe the implicit cancel
        // and release itself; by then it must no longer be registered.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!fabric.is_registered(&first));
    }

    #[tokio::test]
    async fn rate_limited_ask_is_rejected_before_admission() {
        let mut config = Config::default();
        config
            .rate_limits
            .insert("ask".to_string(), docent_core::config::RateLimitRule { limit: 1, window_ms: 60_000 });
        let tts = TtsDispatcher::new(None);
        tts.register(TtsProviderKind::Edge, Arc::new(MockTtsProvider::new()));
        let deps = OrchestratorDeps {
            fabric: Arc::new(CancellationFabric::new()),
            registry: Arc::new(RequestRegistry::new(&config.rate_limits)),
            events: Arc::new(EventStore::new(config.event_retention)),
            audio_buffer: Arc::new(AudioBufferStore::new()),
            tts: Arc::new(tts),
            rag: Arc::new(MockRagProvider::new(vec!["fine".to_string()])),
            asr: None,
            config,
        };
        let orchestrator = Orchestrator::new(deps);
        let (tx1, _rx1) = mpsc::channel(16);
        orchestrator
            .ask(ask_request("r1", "first"), Arc::new(ChannelTextSink(tx1)))
            .await
            .unwrap();
        let (tx2, _rx2) = mpsc::channel(16);
        let err = orchestrator
            .ask(ask_request("r2", "second"), Arc::new(ChannelTextSink(tx2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
    }

    /// spec.md §8 scenario 5: "RAG provider returns 3 text fragments then
    /// errors ... response ends with error:rag_partial. tts_state.count =
    /// K+1."
    #[tokio::test]
    async fn rag_mid_stream_error_emits_rag_partial_and_error_not_done() {
        let mut deps = deps();
        deps.rag = Arc::new(
            MockRagProvider::new(vec![
                "第一段介绍内容。".to_string(),
                "第二段介绍内容。".to_string(),
                "第三段介绍内容。".to_string(),
            ])
            .failing_after(3),
        );
        let events = deps.events.clone();
        let orchestrator = Orchestrator::new(deps);
        let (tx, mut rx) = mpsc::channel(16);
        let request_id = orchestrator
            .ask(ask_request("r1", "介绍第一个展厅"), Arc::new(ChannelTextSink(tx)))
            .await
            .unwrap();

        let mut chunk_count = 0usize;
        while rx.recv().await.is_some() {
            chunk_count += 1;
        }
        assert!(chunk_count > 0, "expected at least the cleaned-before-error chunks to be emitted");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let log = events.query(&request_id, None, None);
        let names: Vec<_> = log.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"rag_partial"), "expected rag_partial, got {names:?}");
        assert!(names.contains(&"error"), "expected error, got {names:?}");
        assert!(!names.contains(&"done"), "rag_partial must not also end in done, got {names:?}");

        let error_event = log.iter().find(|e| e.name == "error").unwrap();
        assert_eq!(error_event.fields.get("code").and_then(|v| v.as_str()), Some("rag_partial"));
    }
}
