//! Dependency-injection container threaded into every handler (spec.md §9
//! "replace \[global mutable state\] with an explicit dependency-injection
//! container constructed at process start"). Mirrors the teacher's
//! `querymt-service::AppState` shape: one `Arc`-wrapped struct handed to
//! `Router::with_state`, cheap to clone per request.

use std::sync::Arc;

use docent_cancel::SharedFabric;
use docent_core::config::Config;
use docent_events::SharedEventStore;
use docent_orchestrator::{Orchestrator, SharedAudioBufferStore};
use docent_providers::{AsrProvider, TtsProviderKind, VoiceConfig};
use docent_registry::RequestRegistry;
use docent_tour::TourMachine;
use docent_tts::TtsDispatcher;

use crate::metrics::Metrics;

struct Inner {
    fabric: SharedFabric,
    registry: Arc<RequestRegistry>,
    events: SharedEventStore,
    audio_buffer: SharedAudioBufferStore,
    tts: Arc<TtsDispatcher>,
    orchestrator: Arc<Orchestrator>,
    tour: Arc<TourMachine>,
    asr: Option<Arc<dyn AsrProvider>>,
    config: Config,
    metrics: Arc<Metrics>,
    default_tts_provider: TtsProviderKind,
    default_voice: VoiceConfig,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

#[allow(clippy::too_many_arguments)]
impl AppState {
    pub fn new(
        fabric: SharedFabric,
        registry: Arc<RequestRegistry>,
        events: SharedEventStore,
        audio_buffer: SharedAudioBufferStore,
        tts: Arc<TtsDispatcher>,
        orchestrator: Arc<Orchestrator>,
        tour: Arc<TourMachine>,
        asr: Option<Arc<dyn AsrProvider>>,
        config: Config,
        metrics: Arc<Metrics>,
        default_tts_provider: TtsProviderKind,
        default_voice: VoiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fabric,
                registry,
                events,
                audio_buffer,
                tts,
                orchestrator,
                tour,
                asr,
                config,
                metrics,
                default_tts_provider,
                default_voice,
            }),
        }
    }

    pub fn fabric(&self) -> &SharedFabric {
        &self.inner.fabric
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &SharedEventStore {
        &self.inner.events
    }

    pub fn audio_buffer(&self) -> &SharedAudioBufferStore {
        &self.inner.audio_buffer
    }

    pub fn tts(&self) -> &Arc<TtsDispatcher> {
        &self.inner.tts
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn tour(&self) -> &Arc<TourMachine> {
        &self.inner.tour
    }

    pub fn asr(&self) -> Option<&Arc<dyn AsrProvider>> {
        self.inner.asr.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn default_tts_provider(&self) -> TtsProviderKind {
        self.inner.default_tts_provider
    }

    pub fn default_voice(&self) -> &VoiceConfig {
        &self.inner.default_voice
    }
}
