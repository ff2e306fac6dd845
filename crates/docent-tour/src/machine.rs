//! Tour State Machine (spec.md §4.7, C7). One `TourState` per client,
//! transitions serialized per client via a synchronous lock: a transition
//! mutates state while holding the lock, releases it, then performs async
//! side effects (cancelling the prior narration, starting the next one).
//! spec.md §4.7's tie-break — "concurrent transition requests are
//! serialized per client; the later wins, the earlier's side effects ...
//! are void" — falls out of that ordering plus an epoch check after every
//! await: a side effect started under epoch E is discarded if, by the time
//! it would take effect, the client's state has moved past E.

use std::sync::Arc;

use dashmap::DashMap;
use docent_cancel::SharedFabric;
use docent_core::config::ContinuousTourResume;
use docent_core::error::ApiError;
use docent_core::ids::{ClientId, RequestId};
use docent_core::model::{EventKind, EventLevel, RequestKind, TourMode, TourState};
use docent_events::{anchors, SharedEventStore};
use docent_orchestrator::{AskInput, AskRequest, NullSink, Orchestrator, SharedAudioBufferStore};
use docent_providers::{TtsProviderKind, VoiceConfig};
use parking_lot::Mutex;

use crate::narration;
use crate::prefetch::PrefetchPipeline;

pub struct StartTourRequest {
    pub stops: Vec<String>,
    pub zone: String,
    pub profile: String,
    pub template_id: String,
    pub style: String,
    pub duration_s: u32,
    pub continuous_tour: bool,
}

type StateHandle = Arc<Mutex<TourState>>;

pub struct TourMachine {
    states: DashMap<ClientId, StateHandle>,
    fabric: SharedFabric,
    events: SharedEventStore,
    orchestrator: Arc<Orchestrator>,
    prefetch: PrefetchPipeline,
    audio_buffer: SharedAudioBufferStore,
    default_tts_provider: TtsProviderKind,
    default_voice: VoiceConfig,
    /// Resolves spec.md §9's Open Question on what a `continuous_tour`
    /// (or manual) resume-after-interrupt does to the interrupted stop.
    resume_policy: ContinuousTourResume,
}

impl TourMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric: SharedFabric,
        events: SharedEventStore,
        orchestrator: Arc<Orchestrator>,
        prefetch: PrefetchPipeline,
        audio_buffer: SharedAudioBufferStore,
        default_tts_provider: TtsProviderKind,
        default_voice: VoiceConfig,
        resume_policy: ContinuousTourResume,
    ) -> Self {
        Self {
            states: DashMap::new(),
            fabric,
            events,
            orchestrator,
            prefetch,
            audio_buffer,
            default_tts_provider,
            default_voice,
            resume_policy,
        }
    }

    /// `GET /tour/state`. Clients with no tour history read as idle rather
    /// than 404 — spec.md's DATA MODEL treats "idle" as the rest state, not
    /// the absence of one.
    pub fn state(&self, client_id: &ClientId) -> TourState {
        self.existing_handle(client_id).map(|h| h.lock().clone()).unwrap_or_else(TourState::idle)
    }

    fn existing_handle(&self, client_id: &ClientId) -> Option<StateHandle> {
        self.states.get(client_id).map(|e| e.clone())
    }

    fn state_handle(&self, client_id: &ClientId) -> StateHandle {
        self.states.entry(client_id.clone()).or_insert_with(|| Arc::new(Mutex::new(TourState::idle()))).clone()
    }

    fn require_handle(&self, client_id: &ClientId) -> Result<StateHandle, ApiError> {
        self.existing_handle(client_id).ok_or_else(|| ApiError::NotFound("no tour for this client".to_string()))
    }

    fn tour_channel(client_id: &ClientId) -> RequestId {
        RequestId(format!("tour:{client_id}"))
    }

    fn record_tour_event(&self, client_id: &ClientId, name: &str, level: EventLevel, kind: EventKind) {
        self.events.append(docent_core::model::Event::new(
            Self::tour_channel(client_id),
            client_id.clone(),
            now_ms(),
            kind,
            name,
            level,
        ));
    }

    pub async fn start(&self, client_id: ClientId, req: StartTourRequest) -> Result<TourState, ApiError> {
        if req.stops.is_empty() {
            return Err(ApiError::BadRequest("tour must have at least one stop".to_string()));
        }
        let handle = self.state_handle(&client_id);
        let epoch = {
            let mut guard = handle.lock();
            if guard.mode != TourMode::Idle {
                return Err(ApiError::BadRequest("tour already active for this client".to_string()));
            }
            let next_epoch = guard.epoch + 1;
            *guard = TourState {
                mode: TourMode::Running,
                zone: req.zone,
                profile: req.profile,
                stops: req.stops,
                stop_index: 0,
                template_id: req.template_id,
                style: req.style,
                duration_s: req.duration_s,
                active_request_id: None,
                epoch: next_epoch,
                continuous_tour: req.continuous_tour,
                interrupted_at_seq: None,
            };
            next_epoch
        };
        self.enter_stop(&client_id, &handle, epoch, 0).await;
        let snapshot = handle.lock().clone();
        self.schedule_window(&client_id, &snapshot);
        Ok(snapshot)
    }

    pub async fn pause(&self, client_id: &ClientId) -> Result<TourState, ApiError> {
        let handle = self.require_handle(client_id)?;
        let prior_active = {
            let mut guard = handle.lock();
            if guard.mode != TourMode::Running {
                return Err(ApiError::BadRequest("pause is only valid from running".to_string()));
            }
            guard.mode = TourMode::Paused;
            guard.epoch += 1;
            guard.active_request_id.take()
        };
        self.cancel(prior_active);
        self.prefetch.evict_all(client_id);
        Ok(handle.lock().clone())
    }

    pub async fn resume(&self, client_id: &ClientId) -> Result<TourState, ApiError> {
        let handle = self.require_handle(client_id)?;
        let (epoch, stop_index, resume_from_seq) = {
            let mut guard = handle.lock();
            if !matches!(guard.mode, TourMode::Paused | TourMode::Interrupted) {
                return Err(ApiError::BadRequest("resume is only valid from paused or interrupted".to_string()));
            }
            // spec.md §9 Open Question 1: what does resume-after-interrupt do
            // to the interrupted stop? `restart` (the default) ignores
            // `interrupted_at_seq` and re-narrates from seq 0;
            // `ResumeInPlace` picks up the pipeline where it was cut off.
            let resume_from_seq = if self.resume_policy == ContinuousTourResume::ResumeInPlace {
                guard.interrupted_at_seq.take().unwrap_or(0)
            } else {
                guard.interrupted_at_seq = None;
                0
            };
            guard.mode = TourMode::Running;
            guard.epoch += 1;
            (guard.epoch, guard.stop_index, resume_from_seq)
        };
        self.enter_stop_from(client_id, &handle, epoch, stop_index, resume_from_seq).await;
        let snapshot = handle.lock().clone();
        self.schedule_window(client_id, &snapshot);
        Ok(snapshot)
    }

    pub async fn next(&self, client_id: &ClientId) -> Result<TourState, ApiError> {
        let handle = self.require_handle(client_id)?;
        let prior_active;
        let prior_index;
        let finished;
        let epoch;
        let stop_index;
        {
            let mut guard = handle.lock();
            if !matches!(guard.mode, TourMode::Running | TourMode::Paused | TourMode::Interrupted) {
                return Err(ApiError::BadRequest("next is only valid while a tour is active".to_string()));
            }
            prior_active = guard.active_request_id.take();
            prior_index = guard.stop_index;
            if guard.stop_index + 1 >= guard.stops.len() {
                *guard = TourState::idle();
                finished = true;
                epoch = 0;
                stop_index = 0;
            } else {
                guard.stop_index += 1;
                guard.epoch += 1;
                guard.mode = TourMode::Running;
                finished = false;
                epoch = guard.epoch;
                stop_index = guard.stop_index;
            }
        }
        self.cancel(prior_active);
        if finished {
            self.prefetch.evict_all(client_id);
            self.record_tour_event(client_id, anchors::TOUR_FINISHED, EventLevel::Info, EventKind::Nav);
            return Ok(handle.lock().clone());
        }
        // `next`'s stop_index advance is a pure forward shift of the prior
        // window, so only the consumed stop is evicted and the window
        // slides — unlike prev/jump/pause/resume/interrupt, which evict
        // the whole window per spec.md §4.8's general "epoch change: evict
        // all slots" rule (see DESIGN.md).
        self.prefetch.evict_index(client_id, prior_index);
        self.enter_stop(client_id, &handle, epoch, stop_index).await;
        let snapshot = handle.lock().clone();
        self.schedule_window(client_id, &snapshot);
        Ok(snapshot)
    }

    pub async fn prev(&self, client_id: &ClientId) -> Result<TourState, ApiError> {
        let handle = self.require_handle(client_id)?;
        let prior_active;
        let epoch;
        let stop_index;
        {
            let mut guard = handle.lock();
            if !matches!(guard.mode, TourMode::Running | TourMode::Paused | TourMode::Interrupted) {
                return Err(ApiError::BadRequest("prev is only valid while a tour is active".to_string()));
            }
            prior_active = guard.active_request_id.take();
            guard.stop_index = guard.stop_index.saturating_sub(1);
            guard.epoch += 1;
            guard.mode = TourMode::Running;
            epoch = guard.epoch;
            stop_index = guard.stop_index;
        }
        self.cancel(prior_active);
        self.prefetch.evict_all(client_id);
        self.enter_stop(client_id, &handle, epoch, stop_index).await;
        let snapshot = handle.lock().clone();
        self.schedule_window(client_id, &snapshot);
        Ok(snapshot)
    }

    pub async fn jump(&self, client_id: &ClientId, index: usize) -> Result<TourState, ApiError> {
        let handle = self.require_handle(client_id)?;
        let prior_active;
        let epoch;
        let stop_index;
        {
            let mut guard = handle.lock();
            if !matches!(guard.mode, TourMode::Running | TourMode::Paused | TourMode::Interrupted) {
                return Err(ApiError::BadRequest("jump is only valid while a tour is active".to_string()));
            }
            prior_active = guard.active_request_id.take();
            guard.stop_index = index.min(guard.stops.len().saturating_sub(1));
            guard.epoch += 1;
            guard.mode = TourMode::Running;
            epoch = guard.epoch;
            stop_index = guard.stop_index;
        }
        self.cancel(prior_active);
        self.prefetch.evict_all(client_id);
        self.enter_stop(client_id, &handle, epoch, stop_index).await;
        let snapshot = handle.lock().clone();
        self.schedule_window(client_id, &snapshot);
        Ok(snapshot)
    }

    /// `/tour/reset` and `stop`. Infallible and idempotent (spec.md §8:
    /// "from any state yields {mode:idle} and further reset is a no-op").
    pub async fn reset(&self, client_id: &ClientId) -> TourState {
        let Some(handle) = self.existing_handle(client_id) else { return TourState::idle() };
        let prior_active = {
            let mut guard = handle.lock();
            if guard.mode == TourMode::Idle {
                return guard.clone();
            }
            let prior = guard.active_request_id.take();
            *guard = TourState::idle();
            prior
        };
        self.cancel(prior_active);
        self.prefetch.evict_all(client_id);
        handle.lock().clone()
    }

    /// Called by the `/ask` HTTP handler before admitting a user's
    /// question (spec.md §4.7 `interrupt(user_question)`). Returns `None`
    /// when there is no running tour to interrupt — the question is then
    /// just an ordinary ask.
    pub async fn interrupt(&self, client_id: &ClientId) -> Option<TourState> {
        let handle = self.existing_handle(client_id)?;
        let prior_active = {
            let mut guard = handle.lock();
            if guard.mode != TourMode::Running {
                return None;
            }
            guard.mode = TourMode::Interrupted;
            guard.epoch += 1;
            guard.active_request_id.take()
        };
        // Captured before cancelling: how many AudioSegments the interrupted
        // narration had already delivered, for `ResumeInPlace` (see resume()).
        let interrupted_at_seq =
            prior_active.as_ref().map(|rid| self.audio_buffer.segments_from(rid, 0).len() as u32);
        {
            let mut guard = handle.lock();
            guard.interrupted_at_seq = interrupted_at_seq;
        }
        self.cancel(prior_active);
        self.prefetch.evict_all(client_id);
        Some(handle.lock().clone())
    }

    /// Called by the `/ask` HTTP handler once the (possibly
    /// interrupt-triggering) question's pipeline has finished. Auto-fires
    /// `resume` when `continuous_tour` is set (spec.md §4.7); otherwise
    /// the tour stays `interrupted` until the user explicitly resumes.
    pub async fn notify_ask_finished(&self, client_id: &ClientId) {
        let Some(handle) = self.existing_handle(client_id) else { return };
        let should_resume = {
            let guard = handle.lock();
            guard.mode == TourMode::Interrupted && guard.continuous_tour
        };
        if should_resume {
            let _ = self.resume(client_id).await;
        }
    }

    fn cancel(&self, request_id: Option<RequestId>) {
        if let Some(rid) = request_id {
            self.fabric.cancel_request(&rid);
        }
    }

    fn schedule_window(&self, client_id: &ClientId, state: &TourState) {
        self.prefetch.schedule_window(client_id, state, &self.orchestrator, self.default_tts_provider, &self.default_voice);
    }

    /// Replays a ready prefetch slot for `stop_index`, or starts a fresh
    /// synchronous narration when none is ready (spec.md §4.8 "if slot(j)
    /// is ready, replay ... otherwise start a fresh narration request
    /// synchronously"). Either way, `active_request_id` is only written if
    /// the tour is still on `epoch` once the (possibly awaited) work
    /// lands — a later transition's "the later wins" tie-break voids this
    /// one by cancelling whatever it just started.
    async fn enter_stop(&self, client_id: &ClientId, handle: &StateHandle, epoch: u64, stop_index: usize) {
        self.enter_stop_from(client_id, handle, epoch, stop_index, 0).await;
    }

    /// Like `enter_stop`, but when no prefetch slot is ready and a fresh
    /// live narration is started, the pipeline begins at `resume_from_seq`
    /// instead of 0 — used by `resume()` under the `ResumeInPlace` policy.
    /// A replayed prefetch slot is always played from its own start: only a
    /// live re-narration of the *same* interrupted stop can resume in place.
    async fn enter_stop_from(
        &self,
        client_id: &ClientId,
        handle: &StateHandle,
        epoch: u64,
        stop_index: usize,
        resume_from_seq: u32,
    ) {
        if let Some(request_id) = self.prefetch.try_consume(client_id, stop_index) {
            if !self.set_active_if_current_epoch(handle, epoch, Some(request_id.clone())) {
                self.fabric.cancel_request(&request_id);
            }
            return;
        }
        self.start_live_narration(client_id, handle, epoch, stop_index, resume_from_seq).await;
    }

    async fn start_live_narration(
        &self,
        client_id: &ClientId,
        handle: &StateHandle,
        epoch: u64,
        stop_index: usize,
        resume_from_seq: u32,
    ) {
        let state_snapshot = handle.lock().clone();
        if state_snapshot.epoch != epoch {
            return;
        }
        let Some(stop) = state_snapshot.stops.get(stop_index).cloned() else { return };
        let request_id = RequestId::generate();
        let question = narration::question_for_stop(&state_snapshot, &stop);
        let session_id = narration::tour_session_id(client_id.as_ref(), &state_snapshot.zone);
        let ask = AskRequest {
            request_id: request_id.clone(),
            client_id: client_id.clone(),
            kind: RequestKind::AskPrefetch,
            parent_request_id: None,
            input: AskInput::Text(question),
            session_id,
            tts_provider: self.default_tts_provider,
            voice: self.default_voice.clone(),
            resume_from_seq,
        };
        // Text has nowhere to go for a live-narrated stop: playback is
        // audio-only via `/tts_stream?request_id=`, matching `NullSink`'s
        // own doc comment ("driving the pipeline for its audio/event side
        // effects only").
        if self.orchestrator.ask(ask, Arc::new(NullSink)).await.is_ok()
            && !self.set_active_if_current_epoch(handle, epoch, Some(request_id.clone()))
        {
            self.fabric.cancel_request(&request_id);
        }
    }

    fn set_active_if_current_epoch(&self, handle: &StateHandle, epoch: u64, request_id: Option<RequestId>) -> bool {
        let mut guard = handle.lock();
        if guard.epoch != epoch {
            return false;
        }
        guard.active_request_id = request_id;
        true
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use docent_cancel::CancellationFabric;
    use docent_core::config::Config;
    use docent_events::EventStore;
    use docent_orchestrator::{AudioBufferStore, OrchestratorDeps};
    use docent_providers::mock::{MockAsrProvider, MockRagProvider, MockTtsProvider};
    use docent_registry::RequestRegistry;
    use docent_tts::TtsDispatcher;

    fn machine(window: usize) -> TourMachine {
        let config = Config::default();
        let tts = Arc::new(TtsDispatcher::new(None));
        tts.register(TtsProviderKind::Edge, Arc::new(MockTtsProvider::new()));
        let fabric = Arc::new(CancellationFabric::new());
        let events = Arc::new(EventStore::new(config.event_retention));
        let audio_buffer = Arc::new(AudioBufferStore::new());
        let deps = OrchestratorDeps {
            fabric: fabric.clone(),
            registry: Arc::new(RequestRegistry::new(&config.rate_limits)),
            events: events.clone(),
            audio_buffer: audio_buffer.clone(),
            tts,
            rag: Arc::new(MockRagProvider::new(vec!["这件展品非常精美。".to_string()])),
            asr: Some(Arc::new(MockAsrProvider::new("unused"))),
            config,
        };
        let orchestrator = Arc::new(Orchestrator::new(deps));
        let prefetch = PrefetchPipeline::new(fabric.clone(), events, audio_buffer.clone(), window);
        TourMachine::new(
            fabric,
            Arc::new(EventStore::new(256)),
            orchestrator,
            prefetch,
            audio_buffer,
            TtsProviderKind::Edge,
            VoiceConfig::new(),
            ContinuousTourResume::default(),
        )
    }

    fn start_req(stops: &[&str]) -> StartTourRequest {
        StartTourRequest {
            stops: stops.iter().map(|s| s.to_string()).collect(),
            zone: "z1".into(),
            profile: "adult".into(),
            template_id: "t1".into(),
            style: "formal".into(),
            duration_s: 60,
            continuous_tour: false,
        }
    }

    #[tokio::test]
    async fn start_transitions_to_running_at_stop_zero() {
        let m = machine(0);
        let client = ClientId("c1".into());
        let state = m.start(client, start_req(&["A", "B", "C"])).await.unwrap();
        assert_eq!(state.mode, TourMode::Running);
        assert_eq!(state.stop_index, 0);
        assert_eq!(state.epoch, 1);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let m = machine(0);
        let client = ClientId("c1".into());
        m.start(client.clone(), start_req(&["A", "B"])).await.unwrap();
        let err = m.start(client, start_req(&["A", "B"])).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn next_advances_stop_index_and_epoch() {
        let m = machine(0);
        let client = ClientId("c1".into());
        m.start(client.clone(), start_req(&["A", "B", "C"])).await.unwrap();
        let state = m.next(&client).await.unwrap();
        assert_eq!(state.stop_index, 1);
        assert_eq!(state.epoch, 2);
    }

    #[tokio::test]
    async fn next_from_last_stop_finishes_tour() {
        let m = machine(0);
        let client = ClientId("c1".into());
        m.start(client.clone(), start_req(&["A", "B"])).await.unwrap();
        m.next(&client).await.unwrap();
        let state = m.next(&client).await.unwrap();
        assert_eq!(state.mode, TourMode::Idle);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let m = machine(0);
        let client = ClientId("c1".into());
        m.start(client.clone(), start_req(&["A", "B"])).await.unwrap();
        let paused = m.pause(&client).await.unwrap();
        assert_eq!(paused.mode, TourMode::Paused);
        let resumed = m.resume(&client).await.unwrap();
        assert_eq!(resumed.mode, TourMode::Running);
        assert_eq!(resumed.stop_index, 0);
    }

    #[tokio::test]
    async fn reset_from_idle_is_a_noop() {
        let m = machine(0);
        let client = ClientId("ghost".into());
        let state = m.reset(&client).await;
        assert_eq!(state.mode, TourMode::Idle);
    }

    #[tokio::test]
    async fn interrupt_requires_running_tour() {
        let m = machine(0);
        let client = ClientId("c1".into());
        assert!(m.interrupt(&client).await.is_none());
        m.start(client.clone(), start_req(&["A", "B"])).await.unwrap();
        let interrupted = m.interrupt(&client).await.unwrap();
        assert_eq!(interrupted.mode, TourMode::Interrupted);
    }

    #[tokio::test]
    async fn prefetch_window_schedules_upcoming_stops() {
        let m = machine(2);
        let client = ClientId("c1".into());
        m.start(client.clone(), start_req(&["A", "B", "C", "D"])).await.unwrap();
        // Give the background prefetch tasks a moment to run to completion.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // stop_index 0, window 2 -> slots for stop 1 and stop 2 at epoch 1.
        assert!(m.prefetch.try_consume(&client, 1).is_some());
        assert!(m.prefetch.try_consume(&client, 2).is_some());
    }
}
