//! Contracts for the three external collaborators (spec.md §1): automatic
//! speech recognition, retrieval-augmented generation, and text-to-speech.
//! Only their *streaming interfaces* are specified here, mirroring the
//! teacher's `querymt::chat::ChatProvider` (`async_trait`, a
//! `Pin<Box<dyn Stream<Item = Result<_, _>> + Send>>` return for the
//! streaming methods) and its `tts`/`stt` request/response structs.

pub mod cancel_aware;
pub mod mock;
pub mod tts_provider;
pub mod traits;
pub mod voice;

pub use cancel_aware::CancelAware;
pub use traits::{AsrProvider, RagProvider, TextStream, TtsAudioStream, TtsChunk, TtsProvider};
pub use tts_provider::TtsProviderKind;
pub use voice::VoiceConfig;
