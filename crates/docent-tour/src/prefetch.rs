//! Tour Prefetch Pipeline (spec.md §4.8, C8). Maintains a sliding window of
//! up to `W` upcoming `PrefetchSlot`s per client, each backed by a normal
//! `kind=ask_prefetch` orchestrator request whose text is collected (via
//! `CollectingTextSink`) and whose audio is read back from the shared
//! `AudioBufferStore` once the request completes. One-way: the tour
//! machine schedules/evicts by index, a background watcher task per slot
//! flips it to `ready`/`evicted` on its own — no callback back into the
//! tour machine (spec.md §9 REDESIGN FLAGS "cyclic references ... break via
//! one-way message passing").

use dashmap::DashMap;
use docent_cancel::SharedFabric;
use docent_core::ids::{ClientId, RequestId};
use docent_core::model::{PrefetchSlot, PrefetchStatus, RequestKind, TourState};
use docent_events::{anchors, SharedEventStore};
use docent_orchestrator::{AskInput, AskRequest, Orchestrator, SharedAudioBufferStore};
use docent_providers::{TtsProviderKind, VoiceConfig};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use crate::collect::CollectingTextSink;
use crate::narration;

struct SlotEntry {
    slot: PrefetchSlot,
    request_id: Option<RequestId>,
}

type SlotMap = Arc<Mutex<BTreeMap<usize, SlotEntry>>>;

pub struct PrefetchPipeline {
    slots: DashMap<ClientId, SlotMap>,
    fabric: SharedFabric,
    events: SharedEventStore,
    audio_buffer: SharedAudioBufferStore,
    window: usize,
}

impl PrefetchPipeline {
    pub fn new(
        fabric: SharedFabric,
        events: SharedEventStore,
        audio_buffer: SharedAudioBufferStore,
        window: usize,
    ) -> Self {
        Self { slots: DashMap::new(), fabric, events, audio_buffer, window }
    }

    fn slot_map(&self, client_id: &ClientId) -> SlotMap {
        self.slots
            .entry(client_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BTreeMap::new())))
            .clone()
    }

    /// Schedules prefetch for every index in `(state.stop_index, state.stop_index + W]`
    /// (clamped to the last stop) not already covered by a same-epoch slot.
    /// `W=0` schedules nothing — the degrade-to-synchronous case spec.md §8
    /// requires.
    pub fn schedule_window(
        &self,
        client_id: &ClientId,
        state: &TourState,
        orchestrator: &Arc<Orchestrator>,
        tts_provider: TtsProviderKind,
        voice: &VoiceConfig,
    ) {
        let len = state.stops.len();
        if self.window == 0 || len == 0 {
            return;
        }
        let hi = (state.stop_index + self.window).min(len - 1);
        for idx in (state.stop_index + 1)..=hi {
            let covered = {
                let map = self.slot_map(client_id);
                let guard = map.lock();
                guard.get(&idx).map(|e| e.slot.epoch) == Some(state.epoch)
            };
            if !covered {
                self.spawn_prefetch(client_id.clone(), state.clone(), idx, orchestrator.clone(), tts_provider, voice.clone());
            }
        }
    }

    fn spawn_prefetch(
        &self,
        client_id: ClientId,
        state: TourState,
        idx: usize,
        orchestrator: Arc<Orchestrator>,
        tts_provider: TtsProviderKind,
        voice: VoiceConfig,
    ) {
        let epoch = state.epoch;
        let Some(stop) = state.stops.get(idx).cloned() else { return };
        let request_id = RequestId(format!("pf-{client_id}-{epoch}-{idx}"));

        let map = self.slot_map(&client_id);
        map.lock().insert(
            idx,
            SlotEntry { slot: PrefetchSlot::pending(idx, epoch), request_id: Some(request_id.clone()) },
        );

        let collector = CollectingTextSink::new();
        let events = self.events.clone();
        let audio_buffer = self.audio_buffer.clone();
        let slots = self.slots.clone();
        let req_id = request_id.clone();
        let client_for_task = client_id.clone();
        let question = narration::question_for_stop(&state, &stop);
        let session_id = narration::tour_session_id(client_id.as_ref(), &state.zone);

        tokio::spawn(async move {
            let ask = AskRequest {
                request_id: request_id.clone(),
                client_id: client_id.clone(),
                kind: RequestKind::AskPrefetch,
                parent_request_id: None,
                input: AskInput::Text(question),
                session_id,
                tts_provider,
                voice,
                resume_from_seq: 0,
            };
            if orchestrator.ask(ask, Arc::new(collector.clone())).await.is_err() {
                mark_evicted(&slots, &client_for_task, idx, epoch);
                return;
            }

            let mut stream = Box::pin(events.stream(&req_id));
            let mut done = false;
            while let Some(ev) = stream.next().await {
                if ev.name == anchors::DONE {
                    done = true;
                    break;
                }
                if ev.name == anchors::ERROR || ev.name == anchors::CANCELLED {
                    break;
                }
            }

            let Some(map) = slots.get(&client_for_task) else { return };
            let mut guard = map.lock();
            let Some(entry) = guard.get_mut(&idx) else { return };
            if entry.slot.epoch != epoch {
                // superseded by a later tour transition while we were waiting
                return;
            }
            if done {
                entry.slot.text_chunks = collector.take();
                entry.slot.audio_segments = audio_buffer.segments_from(&req_id, 0);
                entry.slot.status = PrefetchStatus::Ready;
                trace!(%client_for_task, idx, "prefetch slot ready");
            } else {
                entry.slot.status = PrefetchStatus::Evicted;
            }
        });
    }

    /// Consumes a ready slot for immediate replay (spec.md §4.8 "if slot(j)
    /// is ready, replay its AudioSegments immediately"). Returns the
    /// request_id the audio already lives under in `AudioBufferStore`, so
    /// the caller can point `TourState.active_request_id` at it with zero
    /// additional TTS latency.
    pub fn try_consume(&self, client_id: &ClientId, idx: usize) -> Option<RequestId> {
        let map = self.slot_map(client_id);
        let mut guard = map.lock();
        let entry = guard.get_mut(&idx)?;
        if entry.slot.status != PrefetchStatus::Ready {
            return None;
        }
        entry.slot.status = PrefetchStatus::Consumed;
        entry.request_id.clone()
    }

    /// Evicts every slot for a client (spec.md §4.8 "on epoch change: evict
    /// all slots"). Cancels still-in-flight (pending) prefetch requests;
    /// ready/consumed slots have already released their cancel token on
    /// completion, so cancelling them is simply a no-op.
    pub fn evict_all(&self, client_id: &ClientId) {
        let map = self.slot_map(client_id);
        let mut guard = map.lock();
        for entry in guard.values() {
            if entry.slot.status == PrefetchStatus::Pending {
                if let Some(rid) = &entry.request_id {
                    self.fabric.cancel_request(rid);
                }
            }
        }
        guard.clear();
    }

    /// Evicts one stop's slot (spec.md §4.8 "on stop_index advance: evict
    /// slot(previous index)").
    pub fn evict_index(&self, client_id: &ClientId, idx: usize) {
        let map = self.slot_map(client_id);
        let mut guard = map.lock();
        if let Some(entry) = guard.remove(&idx) {
            if entry.slot.status == PrefetchStatus::Pending {
                if let Some(rid) = &entry.request_id {
                    self.fabric.cancel_request(rid);
                }
            }
        }
    }
}

fn mark_evicted(slots: &DashMap<ClientId, SlotMap>, client_id: &ClientId, idx: usize, epoch: u64) {
    let Some(map) = slots.get(client_id) else { return };
    let mut guard = map.lock();
    if let Some(entry) = guard.get_mut(&idx) {
        if entry.slot.epoch == epoch {
            entry.slot.status = PrefetchStatus::Evicted;
        }
    }
}
