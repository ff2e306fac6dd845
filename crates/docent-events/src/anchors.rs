//! Fixed event-name table the derived-timing matcher (`derive.rs`) keys
//! off of. Producers (the orchestrator, the tour machine) must emit events
//! under these exact names for timings to be derivable. Named-constant
//! table in the style of the teacher's `gibberish_events::event_names`
//! module (`crates/events/src/lib.rs`), which exists for the same reason:
//! "prevent runtime deserialization errors from mismatched [event] names".

pub const SUBMIT: &str = "submit";
pub const ASR_BEGIN: &str = "asr_begin";
pub const ASR_DONE: &str = "asr_done";
pub const RAG_FIRST_CHUNK: &str = "rag_first_chunk";
pub const RAG_DONE: &str = "rag_done";
pub const RAG_PARTIAL: &str = "rag_partial";
pub const RAG_ERROR: &str = "rag_error";
pub const FIRST_SEGMENT: &str = "first_segment";
pub const TTS_FIRST_AUDIO: &str = "tts_first_audio";
pub const TTS_AUDIO_EMITTED: &str = "tts_audio_emitted";
pub const TTS_ALL_DONE: &str = "tts_all_done";
pub const PLAY_END: &str = "play_end";
pub const CANCELLED: &str = "cancelled";
pub const DONE: &str = "done";
pub const ERROR: &str = "error";
pub const TOUR_FINISHED: &str = "tour_finished";
