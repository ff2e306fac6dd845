//! Conversation Orchestrator (spec.md §4.6, C6) — the heart of the
//! system. `Orchestrator::ask` admits and registers the request, then
//! spawns the concurrency pipeline spec.md describes: a reader/segmenter
//! task hosting `docent_cleaner`'s state, a bounded-concurrency TTS
//! dispatch task, and an ordered emitter task that releases `AudioSegment`s
//! strictly in `seq` order. Grounded on the teacher's
//! `call_llm_with_retry`/`create_stream_with_retry` cancellation-aware
//! retry loop (`agent/execution/llm_retry.rs`) for the per-stage
//! `tokio::select!` timeout/cancel races, generalized from a single retry
//! loop into the multi-stage pipeline spec.md asks for.

use docent_cancel::{CancelToken, SharedFabric};
use docent_core::config::Config;
use docent_core::error::ApiError;
use docent_core::ids::{ClientId, RequestId};
use docent_core::model::{AudioSegment, CleanedChunk, Event, EventKind, EventLevel, RequestKind};
use docent_events::{anchors, SharedEventStore};
use docent_providers::{AsrProvider, CancelAware as _, RagProvider, TtsProviderKind, VoiceConfig};
use docent_registry::{EndpointKind, RequestRegistry};
use docent_tts::TtsDispatcher;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Semaphore};
use tracing::{instrument, warn};

use crate::audio_buffer::SharedAudioBufferStore;
use crate::intent::{self, Intent};
use crate::sinks::TextSink;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the caller wants answered: either already-transcribed text, or raw
/// audio that must go through ASR first (spec.md §4.6 step 3).
pub enum AskInput {
    Text(String),
    Audio(Vec<u8>),
}

pub struct AskRequest {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub kind: RequestKind,
    pub parent_request_id: Option<RequestId>,
    pub input: AskInput,
    pub session_id: String,
    pub tts_provider: TtsProviderKind,
    pub voice: VoiceConfig,
    /// First `CleanedChunk`/`AudioSegment` seq to actually emit downstream;
    /// chunks below it are still read off the regenerated RAG/cleaner
    /// stream (so later seqs line up) but never reach `text_sink` or TTS.
    /// Used only by the tour machine's `ResumeInPlace` policy (spec.md §9
    /// Open Questions) to avoid replaying audio the visitor already heard
    /// before an interrupt. Zero for every ordinary `ask`.
    pub resume_from_seq: u32,
}

#[derive(Clone)]
pub struct OrchestratorDeps {
    pub fabric: SharedFabric,
    pub registry: Arc<RequestRegistry>,
    pub events: SharedEventStore,
    pub audio_buffer: SharedAudioBufferStore,
    pub tts: Arc<TtsDispatcher>,
    pub rag: Arc<dyn RagProvider>,
    pub asr: Option<Arc<dyn AsrProvider>>,
    pub config: Config,
}

/// Drives a single `ask`/`ask_prefetch` request end to end. Stateless
/// itself — all mutable state lives in the per-request tasks spawned by
/// `ask`, or in the shared stores in `OrchestratorDeps`.
#[derive(Clone)]
pub struct Orchestrator {
    deps: OrchestratorDeps,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self { deps }
    }

    /// Admits via C2, registers a cancel token via C1 (spec.md §4.6 step
    /// 1), implicitly cancels any prior active request of the same kind
    /// for this client (spec.md §3 invariant 3), then spawns the pipeline
    /// in the background and returns immediately. The caller already has
    /// `text_sink` wired to wherever the text should go (SSE response or a
    /// prefetch slot); audio always lands in the shared audio buffer,
    /// addressable by `request_id` (spec.md §6 `/tts_stream`).
    #[instrument(skip(self, req, text_sink), fields(request_id = %req.request_id, client_id = %req.client_id, kind = ?req.kind))]
    pub async fn ask(
        &self,
        req: AskRequest,
        text_sink: Arc<dyn TextSink>,
    ) -> Result<RequestId, ApiError> {
        let endpoint: EndpointKind = req.kind.into();
        self.deps
            .registry
            .check_rate_limit(&req.client_id, endpoint, now_ms())?;

        // spec.md §3 invariant 3: at most one active request per client per
        // endpoint kind; a new one implicitly cancels the prior. This does
        // not apply to `ask_prefetch`: spec.md §4.8 lets up to W background
        // prefetch requests for different upcoming stops coexist per
        // client, and the tour prefetch pipeline (C8) manages that window's
        // concurrency and eviction itself via direct `fabric.cancel_request`
        // calls rather than this per-kind invariant.
        if req.kind != RequestKind::AskPrefetch {
            for prior in self.deps.registry.active_of_kind(&req.client_id, req.kind) {
                if prior != req.request_id {
                    self.deps.fabric.cancel_request(&prior);
                }
            }
        }

        let token = self
            .deps
            .fabric
            .register(req.client_id.clone(), req.request_id.clone(), req.kind)
            .map_err(|_| ApiError::BadRequest("duplicate request_id".to_string()))?;
        self.deps
            .registry
            .admit(req.client_id.clone(), req.request_id.clone(), req.kind);

        let request_id = req.request_id.clone();
        let deps = self.deps.clone();
        tokio::spawn(async move {
            run_pipeline(deps, req, token, text_sink).await;
        });
        Ok(request_id)
    }
}

fn record(events: &SharedEventStore, req: &AskRequest, name: &str, level: EventLevel, kind: EventKind) {
    events.append(Event::new(
        req.request_id.clone(),
        req.client_id.clone(),
        now_ms(),
        kind,
        name,
        level,
    ));
}

fn record_with(
    events: &SharedEventStore,
    req: &AskRequest,
    name: &str,
    level: EventLevel,
    kind: EventKind,
    fields: &[(&str, serde_json::Value)],
) {
    let mut event = Event::new(req.request_id.clone(), req.client_id.clone(), now_ms(), kind, name, level);
    for (k, v) in fields {
        event = event.with_field(*k, v.clone());
    }
    events.append(event);
}

async fn run_pipeline(deps: OrchestratorDeps, req: AskRequest, token: CancelToken, text_sink: Arc<dyn TextSink>) {
    record(&deps.events, &req, anchors::SUBMIT, EventLevel::Info, EventKind::App);

    let question = match resolve_question(&deps, &req, &token).await {
        Ok(q) => q,
        Err(e) => {
            finish_with_error(&deps, &req, &token, e).await;
            return;
        }
    };

    match intent::classify(&question) {
        intent @ (Intent::Greeting | Intent::TourControl) => {
            let reply = intent::templated_reply(intent);
            let stream: docent_providers::TextStream =
                futures::stream::once(async move { Ok::<String, ApiError>(reply.to_string()) }).boxed();
            run_text_through_cleaner_and_tts(&deps, &req, &token, text_sink, stream).await;
        }
        Intent::Question => {
            let rag_stream = match call_rag(&deps, &req, &question, &token).await {
                Ok(s) => s,
                Err(e) => {
                    finish_with_error(&deps, &req, &token, e).await;
                    return;
                }
            };
            run_text_through_cleaner_and_tts(&deps, &req, &token, text_sink, rag_stream).await;
        }
    }

    deps.registry.complete(&req.request_id);
    deps.fabric.release(&req.request_id);
    deps.events.finish(&req.request_id);
}

async fn resolve_question(deps: &OrchestratorDeps, req: &AskRequest, token: &CancelToken) -> Result<String, ApiError> {
    match &req.input {
        AskInput::Text(text) => Ok(text.clone()),
        AskInput::Audio(bytes) => {
            let Some(asr) = &deps.asr else {
                return Err(ApiError::AsrError {
                    provider: "none".to_string(),
                    message: "no ASR provider configured".to_string(),
                });
            };
            record(&deps.events, req, anchors::ASR_BEGIN, EventLevel::Info, EventKind::Asr);
            let fut = asr.transcribe(bytes.clone(), token);
            let timed = tokio::time::timeout(deps.config.timeouts.asr_soft_timeout(), fut.race(token));
            match timed.await {
                Ok(Ok(Ok(transcript))) => {
                    record_with(
                        &deps.events,
                        req,
                        anchors::ASR_DONE,
                        EventLevel::Info,
                        EventKind::Asr,
                        &[("transcript_len", transcript.len().into())],
                    );
                    Ok(transcript)
                }
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(_)) => Err(ApiError::Cancelled),
                Err(_) => Err(ApiError::Timeout),
            }
        }
    }
}

async fn call_rag(
    deps: &OrchestratorDeps,
    req: &AskRequest,
    question: &str,
    token: &CancelToken,
) -> Result<docent_providers::TextStream, ApiError> {
    let fut = deps.rag.ask(question, &req.session_id, token);
    let timed = tokio::time::timeout(deps.config.timeouts.rag_first_byte_timeout(), fut.race(token));
    match timed.await {
        Ok(Ok(Ok(stream))) => Ok(stream),
        Ok(Ok(Err(e))) => {
            record_with(
                &deps.events,
                req,
                anchors::RAG_ERROR,
                EventLevel::Error,
                EventKind::Rag,
                &[("message", e.to_string().into())],
            );
            Err(e)
        }
        Ok(Err(_)) => Err(ApiError::Cancelled),
        Err(_) => Err(ApiError::Timeout),
    }
}

/// Implements spec.md §4.6 steps 5-8: the segmenter/reader task, the
/// bounded TTS dispatch, and the seq-ordered emitter, wired together with
/// bounded `mpsc` channels so a slow downstream naturally back-pressures
/// the RAG reader (spec.md §4.6 "Back-pressure").
async fn run_text_through_cleaner_and_tts(
    deps: &OrchestratorDeps,
    req: &AskRequest,
    token: &CancelToken,
    text_sink: Arc<dyn TextSink>,
    text_stream: docent_providers::TextStream,
) {
    let cap = deps.config.queue_capacity.max(1);
    let (chunk_tx, chunk_rx) = mpsc::channel::<CleanedChunk>(cap);
    let (order_tx, mut order_rx) = mpsc::channel::<OrderedItem>(cap);
    // Carries whether the cleaner's upstream (RAG) text stream ended with an
    // error rather than cleanly (spec.md §4.6 "RAG error mid-stream",
    // scenario 5). Dropped without a send if the reader exits via
    // cancellation, which the caller already handles separately.
    let (rag_error_tx, rag_error_rx) = tokio::sync::oneshot::channel::<Option<ApiError>>();

    let reader_cancel = token.clone();
    let cleaner_cfg = deps.config.cleaner.clone();
    let text_sink_reader = text_sink.clone();
    let events_reader = deps.events.clone();
    let req_id_for_rag_first = req.request_id.clone();
    let client_id_for_rag_first = req.client_id.clone();
    let resume_from_seq = req.resume_from_seq;
    let reader = tokio::spawn(async move {
        let mut seen_first = false;
        let mut upstream_error = None;
        let mut stream = docent_cleaner::segment_stream(cleaner_cfg, text_stream);
        loop {
            tokio::select! {
                biased;
                _ = reader_cancel.cancelled() => break,
                next = stream.next() => {
                    let Some(item) = next else { break };
                    let chunk = item.chunk;
                    if !seen_first {
                        seen_first = true;
                        // The segmenter consumes the RAG text stream internally, so
                        // the first chunk it yields here is the earliest point both
                        // "RAG produced its first text" and "the cleaner completed
                        // its first chunk" are observable; record both anchors.
                        let ts = now_ms();
                        events_reader.append(Event::new(
                            req_id_for_rag_first.clone(),
                            client_id_for_rag_first.clone(),
                            ts,
                            EventKind::Rag,
                            anchors::RAG_FIRST_CHUNK,
                            EventLevel::Info,
                        ));
                        events_reader.append(Event::new(
                            req_id_for_rag_first.clone(),
                            client_id_for_rag_first.clone(),
                            ts,
                            EventKind::App,
                            anchors::FIRST_SEGMENT,
                            EventLevel::Info,
                        ));
                    }
                    let finalized = chunk.finalized;
                    if chunk.seq >= resume_from_seq {
                        text_sink_reader.emit(chunk.clone()).await;
                        if chunk_tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    if finalized {
                        upstream_error = item.upstream_error;
                        break;
                    }
                }
            }
        }
        let _ = rag_error_tx.send(upstream_error);
    });

    let tts_cancel = token.clone();
    let tts = deps.tts.clone();
    let voice = req.voice.clone();
    let provider = req.tts_provider;
    let audio_buffer = deps.audio_buffer.clone();
    let concurrency = deps.config.tts_concurrency.max(1);
    let req_id = req.request_id.clone();
    let client_id = req.client_id.clone();
    let events_dispatch = deps.events.clone();
    let dispatcher_task = tokio::spawn(async move {
        run_tts_dispatch(
            chunk_rx,
            order_tx,
            tts,
            provider,
            voice,
            tts_cancel,
            audio_buffer,
            concurrency,
            req_id,
            client_id,
            events_dispatch,
            resume_from_seq,
        )
        .await;
    });

    let mut pending: BTreeMap<u32, OrderedItem> = BTreeMap::new();
    let mut next_expected = req.resume_from_seq;
    let mut first_audio_recorded = false;
    let mut segment_count = 0u32;
    let mut fatal: Option<ApiError> = None;

    while let Some(item) = order_rx.recv().await {
        if item.fatal {
            fatal = item.outcome.and_then(|o| o.err());
            break;
        }
        pending.insert(item.seq, item);
        while let Some(next) = pending.remove(&next_expected) {
            if let Some(Ok(segment)) = next.outcome {
                if !first_audio_recorded {
                    first_audio_recorded = true;
                    record(&deps.events, req, anchors::TTS_FIRST_AUDIO, EventLevel::Info, EventKind::Tts);
                }
                segment_count += 1;
                deps.audio_buffer.append(segment);
                record_with(
                    &deps.events,
                    req,
                    anchors::TTS_AUDIO_EMITTED,
                    EventLevel::Info,
                    EventKind::Tts,
                    &[("seq", next_expected.into())],
                );
            }
            let was_finalized = next.finalized;
            next_expected += 1;
            if was_finalized {
                break;
            }
        }
    }

    let _ = reader.await;
    let _ = dispatcher_task.await;
    // `Err` here only means the reader exited via cancellation without
    // sending (the sender was dropped); that path is handled below by the
    // `token.is_cancelled()` check, so treat it the same as "no upstream
    // error" rather than propagating the oneshot's `RecvError`.
    let rag_upstream_error = rag_error_rx.await.ok().flatten();

    if token.is_cancelled() {
        record(&deps.events, req, anchors::CANCELLED, EventLevel::Info, EventKind::App);
        return;
    }

    if let Some(err) = fatal {
        record_with(
            &deps.events,
            req,
            anchors::ERROR,
            EventLevel::Error,
            EventKind::Err,
            &[("code", err.code().into())],
        );
        return;
    }

    record_with(
        &deps.events,
        req,
        anchors::TTS_ALL_DONE,
        EventLevel::Info,
        EventKind::Tts,
        &[("count", segment_count.into())],
    );
    record(&deps.events, req, anchors::PLAY_END, EventLevel::Info, EventKind::App);

    if let Some(rag_err) = rag_upstream_error {
        // spec.md §4.6 "RAG error mid-stream": the chunks already cleaned
        // were emitted and their TTS already completed above; the request
        // still ends as an error (spec.md §8 scenario 5: "response ends
        // with error:rag_partial"), not `done`.
        record_with(
            &deps.events,
            req,
            anchors::RAG_PARTIAL,
            EventLevel::Warn,
            EventKind::Rag,
            &[("message", rag_err.to_string().into())],
        );
        record_with(
            &deps.events,
            req,
            anchors::ERROR,
            EventLevel::Error,
            EventKind::Err,
            &[("code", "rag_partial".into())],
        );
        return;
    }

    record(&deps.events, req, anchors::RAG_DONE, EventLevel::Info, EventKind::Rag);
    record(&deps.events, req, anchors::DONE, EventLevel::Info, EventKind::App);
}

struct OrderedItem {
    seq: u32,
    finalized: bool,
    outcome: Option<Result<AudioSegment, ApiError>>,
    fatal: bool,
}

/// TTS dispatch task (spec.md §4.6 step 7): bounded in-flight TTS calls,
/// the first dispatched chunk's failure fails the whole request, later
/// failures skip just that chunk (spec.md §4.6 "Failure semantics"). The
/// "first chunk" is `seq == resume_from_seq`, not literally `seq == 0`:
/// a `ResumeInPlace` narration's pipeline starts mid-sequence.
#[allow(clippy::too_many_arguments)]
async fn run_tts_dispatch(
    mut chunk_rx: mpsc::Receiver<CleanedChunk>,
    order_tx: mpsc::Sender<OrderedItem>,
    tts: Arc<TtsDispatcher>,
    provider: TtsProviderKind,
    voice: VoiceConfig,
    cancel: CancelToken,
    _audio_buffer: SharedAudioBufferStore,
    concurrency: usize,
    req_id: RequestId,
    client_id: ClientId,
    events: SharedEventStore,
    resume_from_seq: u32,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut workers = Vec::new();

    while let Some(chunk) = chunk_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        if chunk.text.is_empty() {
            // spec.md §4.4 rule 4: the empty finalized chunk is a pure
            // sentinel, never dispatched to TTS.
            let _ = order_tx
                .send(OrderedItem { seq: chunk.seq, finalized: chunk.finalized, outcome: None, fatal: false })
                .await;
            continue;
        }

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let tts = tts.clone();
        let voice = voice.clone();
        let cancel = cancel.clone();
        let order_tx = order_tx.clone();
        let req_id = req_id.clone();
        let client_id = client_id.clone();
        let events = events.clone();
        let seq = chunk.seq;
        let finalized = chunk.finalized;
        let text = chunk.text.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let result = dispatch_one(&tts, provider, &text, &voice, &cancel, &req_id, seq).await;
            match result {
                Ok(segment) => {
                    let _ = order_tx
                        .send(OrderedItem { seq, finalized, outcome: Some(Ok(segment)), fatal: false })
                        .await;
                }
                Err(ApiError::Cancelled) => {
                    // Not an error: the request was cancelled (spec.md §4.6
                    // "Cancellation: never surfaced as an error").
                }
                Err(e) => {
                    events.append(
                        Event::new(req_id, client_id, now_ms(), EventKind::Tts, "tts_error", EventLevel::Error)
                            .with_field("seq", seq)
                            .with_field("message", e.to_string()),
                    );
                    if seq == resume_from_seq {
                        let _ = order_tx
                            .send(OrderedItem { seq, finalized, outcome: Some(Err(e)), fatal: true })
                            .await;
                    } else {
                        let _ = order_tx
                            .send(OrderedItem { seq, finalized, outcome: None, fatal: false })
                            .await;
                    }
                }
            }
        });
        workers.push(handle);
    }

    for handle in workers {
        let _ = handle.await;
    }
}

async fn dispatch_one(
    tts: &TtsDispatcher,
    provider: TtsProviderKind,
    text: &str,
    voice: &VoiceConfig,
    cancel: &CancelToken,
    req_id: &RequestId,
    seq: u32,
) -> Result<AudioSegment, ApiError> {
    let mut stream = tts.dispatch(provider, text.to_string(), voice.clone(), cancel.clone()).await?;
    let mut bytes = Vec::new();
    let mut content_type = String::from("application/octet-stream");
    let mut duration_hint_ms = 0u32;
    let mut got_any = false;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                got_any = true;
                content_type = chunk.content_type;
                bytes.extend_from_slice(&chunk.bytes);
                duration_hint_ms += chunk.duration_hint_ms.unwrap_or(0);
            }
            Err(e) => return Err(e),
        }
    }
    if !got_any {
        warn!(request_id = %req_id, "tts stream produced zero frames");
    }
    Ok(AudioSegment {
        request_id: req_id.clone(),
        seq,
        bytes,
        content_type,
        duration_hint_ms: if duration_hint_ms > 0 { Some(duration_hint_ms) } else { None },
    })
}

async fn finish_with_error(deps: &OrchestratorDeps, req: &AskRequest, token: &CancelToken, err: ApiError) {
    if token.is_cancelled() || matches!(err, ApiError::Cancelled) {
        record(&deps.events, req, anchors::CANCELLED, EventLevel::Info, EventKind::App);
    } else {
        record_with(
            &deps.events,
            req,
            anchors::ERROR,
            EventLevel::Error,
            EventKind::Err,
            &[("code", err.code().into())],
        );
    }
    deps.registry.complete(&req.request_id);
    deps.fabric.release(&req.request_id);
    deps.events.finish(&req.request_id);
}
