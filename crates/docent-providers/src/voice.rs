//! Voice configuration translated by the TTS dispatcher into
//! provider-specific parameters (spec.md §4.5). Shaped like the teacher's
//! `querymt::tts::TtsRequest` builder (`crates/querymt/src/tts/mod.rs`),
//! generalized with a `reference_sample` field for voice-cloning providers
//! (`gpt_sovits_*`) that the teacher's single-provider TTS struct had no
//! need to express.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VoiceConfig {
    pub voice_id: Option<String>,
    pub rate: Option<f32>,
    /// Raw reference audio bytes, for voice-cloning providers.
    pub reference_sample: Option<Vec<u8>>,
}

impl VoiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn voice_id(mut self, id: impl Into<String>) -> Self {
        self.voice_id = Some(id.into());
        self
    }

    pub fn rate(mut self, rate: f32) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn reference_sample(mut self, sample: Vec<u8>) -> Self {
        self.reference_sample = Some(sample);
        self
    }
}
