//! Typed configuration. Parsing a config *file* is out of scope (spec.md
//! §1 Non-goals); this module owns the typed shape and its defaults, the
//! way the teacher's `qmt-service::Args` owns bind-address/provider-path
//! defaults via `clap` while leaving file parsing to `toml::from_str`
//! called from `main`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub min_chunk_size: usize,
    pub soft_min: usize,
    pub max_chunk_size: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: 40,
            soft_min: 80,
            max_chunk_size: 260,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_deadline_ms: u64,
    pub asr_soft_timeout_ms: u64,
    pub rag_first_byte_timeout_ms: u64,
    pub rag_inter_byte_timeout_ms: u64,
    pub tts_first_byte_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: 120_000,
            asr_soft_timeout_ms: 10_000,
            rag_first_byte_timeout_ms: 8_000,
            rag_inter_byte_timeout_ms: 5_000,
            tts_first_byte_timeout_ms: 6_000,
        }
    }
}

impl TimeoutConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
    pub fn asr_soft_timeout(&self) -> Duration {
        Duration::from_millis(self.asr_soft_timeout_ms)
    }
    pub fn rag_first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.rag_first_byte_timeout_ms)
    }
    pub fn rag_inter_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.rag_inter_byte_timeout_ms)
    }
    pub fn tts_first_byte_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_first_byte_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContinuousTourResume {
    #[default]
    Restart,
    ResumeInPlace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub rate_limits: BTreeMap<String, RateLimitRule>,
    pub cleaner: CleanerConfig,
    pub timeouts: TimeoutConfig,
    /// Bounded-queue capacity between orchestrator pipeline stages (spec.md §4.6).
    pub queue_capacity: usize,
    /// Max concurrent in-flight TTS calls per request (spec.md §4.6).
    pub tts_concurrency: usize,
    /// Prefetch lookahead window `W` (spec.md §4.8).
    pub prefetch_window: usize,
    /// Event-store retention `K` per request (spec.md §4.3).
    pub event_retention: usize,
    pub sse_heartbeat_ms: u64,
    pub continuous_tour_resume: ContinuousTourResume,
    pub tts_fallback_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert(
            "ask".to_string(),
            RateLimitRule { limit: 30, window_ms: 60_000 },
        );
        rate_limits.insert(
            "ask_prefetch".to_string(),
            RateLimitRule { limit: 120, window_ms: 60_000 },
        );
        rate_limits.insert(
            "asr".to_string(),
            RateLimitRule { limit: 6, window_ms: 3_000 },
        );
        rate_limits.insert(
            "tts".to_string(),
            RateLimitRule { limit: 60, window_ms: 60_000 },
        );
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            rate_limits,
            cleaner: CleanerConfig::default(),
            timeouts: TimeoutConfig::default(),
            queue_capacity: 16,
            tts_concurrency: 2,
            prefetch_window: 2,
            event_retention: 256,
            sse_heartbeat_ms: 15_000,
            continuous_tour_resume: ContinuousTourResume::default(),
            tts_fallback_enabled: true,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = Config::default();
        assert_eq!(c.rate_limits["ask"].limit, 30);
        assert_eq!(c.rate_limits["ask_prefetch"].limit, 120);
        assert_eq!(c.rate_limits["asr"].limit, 6);
        assert_eq!(c.rate_limits["asr"].window_ms, 3_000);
        assert_eq!(c.rate_limits["tts"].limit, 60);
        assert_eq!(c.cleaner.min_chunk_size, 40);
        assert_eq!(c.cleaner.soft_min, 80);
        assert_eq!(c.cleaner.max_chunk_size, 260);
        assert_eq!(c.prefetch_window, 2);
        assert_eq!(c.queue_capacity, 16);
    }

    #[test]
    fn parses_partial_toml_override() {
        let c = Config::from_toml_str("bind_addr = \"127.0.0.1:9000\"\n").unwrap();
        assert_eq!(c.bind_addr, "127.0.0.1:9000");
        // unspecified fields still get their defaults
        assert_eq!(c.prefetch_window, 2);
    }
}
