//! Request Registry & Rate Limiter (spec.md §4.2, C2).
//!
//! Sliding-window counters keyed by `(client_id, endpoint)`, backed by
//! `dashmap` the same way the cancellation fabric (`docent-cancel`) and the
//! teacher's `querymt-agent::delegation::core::ActiveDelegations` registry
//! are: a concurrent map rather than a single `Mutex<HashMap<_>>`, so one
//! client's admission check never blocks another's. Callers supply the
//! current monotonic timestamp rather than the registry reading a clock
//! itself, so admission decisions stay deterministic and replayable in
//! tests (spec.md §3 "Request.created_at: monotonic timestamp").

use dashmap::DashMap;
use docent_core::config::RateLimitRule;
use docent_core::error::ApiError;
use docent_core::ids::{ClientId, RequestId};
use docent_core::model::RequestKind;
use std::collections::{BTreeMap, VecDeque};
use tracing::trace;

/// Rate-limited endpoint categories (spec.md §4.2's table). Distinct from
/// `RequestKind`: `asr` and `tts` are sub-calls made *within* an `ask`
/// request, each with their own window, not top-level request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKind {
    Ask,
    AskPrefetch,
    Asr,
    Tts,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Ask => "ask",
            EndpointKind::AskPrefetch => "ask_prefetch",
            EndpointKind::Asr => "asr",
            EndpointKind::Tts => "tts",
        }
    }
}

impl From<RequestKind> for EndpointKind {
    fn from(k: RequestKind) -> Self {
        match k {
            RequestKind::Ask | RequestKind::WakeWord => EndpointKind::Ask,
            RequestKind::AskPrefetch => EndpointKind::AskPrefetch,
        }
    }
}

struct ActiveEntry {
    client_id: ClientId,
    kind: RequestKind,
}

pub struct RequestRegistry {
    rules: BTreeMap<&'static str, RateLimitRule>,
    windows: DashMap<(ClientId, &'static str), VecDeque<u64>>,
    active: DashMap<RequestId, ActiveEntry>,
}

impl RequestRegistry {
    pub fn new(rules: &BTreeMap<String, RateLimitRule>) -> Self {
        let mut table = BTreeMap::new();
        for kind in [EndpointKind::Ask, EndpointKind::AskPrefetch, EndpointKind::Asr, EndpointKind::Tts] {
            if let Some(rule) = rules.get(kind.as_str()) {
                table.insert(kind.as_str(), rule.clone());
            }
        }
        Self { rules: table, windows: DashMap::new(), active: DashMap::new() }
    }

    /// Checks and records one unit of rate-limit usage for
    /// `(client_id, endpoint)` at `now_ms`. Independent of cancellation: a
    /// request counts toward its window the moment it is admitted, whether
    /// or not it is later cancelled (spec.md §4.2).
    pub fn check_rate_limit(
        &self,
        client_id: &ClientId,
        endpoint: EndpointKind,
        now_ms: u64,
    ) -> Result<(), ApiError> {
        let Some(rule) = self.rules.get(endpoint.as_str()) else {
            // No configured limit for this endpoint: admit unconditionally.
            return Ok(());
        };
        let key = (client_id.clone(), endpoint.as_str());
        let mut window = self.windows.entry(key).or_default();
        let floor = now_ms.saturating_sub(rule.window_ms);
        while let Some(&oldest) = window.front() {
            if oldest < floor {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= rule.limit {
            let oldest = *window.front().expect("len >= limit > 0 implies non-empty");
            let retry_after_ms = (oldest + rule.window_ms).saturating_sub(now_ms);
            trace!(%client_id, endpoint = endpoint.as_str(), retry_after_ms, "rate limited");
            return Err(ApiError::RateLimited { retry_after_ms });
        }
        window.push_back(now_ms);
        Ok(())
    }

    pub fn admit(&self, client_id: ClientId, request_id: RequestId, kind: RequestKind) {
        self.active.insert(request_id, ActiveEntry { client_id, kind });
    }

    pub fn complete(&self, request_id: &RequestId) {
        self.active.remove(request_id);
    }

    pub fn is_active(&self, request_id: &RequestId) -> bool {
        self.active.contains_key(request_id)
    }

    pub fn active_count(&self, client_id: &ClientId) -> usize {
        self.active
            .iter()
            .filter(|e| &e.value().client_id == client_id)
            .count()
    }

    /// Total in-flight requests across every client, used by graceful
    /// shutdown to decide when it is safe to stop waiting.
    pub fn total_active(&self) -> usize {
        self.active.len()
    }

    /// Active requests for a client restricted to one `RequestKind`, used
    /// by the orchestrator to find "the prior request of the same kind"
    /// before implicitly cancelling it (spec.md §3 invariant 3).
    pub fn active_of_kind(&self, client_id: &ClientId, kind: RequestKind) -> Vec<RequestId> {
        self.active
            .iter()
            .filter(|e| e.value().client_id == *client_id && e.value().kind == kind)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docent_core::config::Config;

    fn registry() -> RequestRegistry {
        RequestRegistry::new(&Config::default().rate_limits)
    }

    #[test]
    fn admits_up_to_limit_then_rejects_with_retry_after() {
        let client = ClientId("c1".into());
        // A tight synthetic rule proves the boundary without needing the
        // default 30/min limit's full iteration count.
        let mut rules = BTreeMap::new();
        rules.insert("ask".to_string(), RateLimitRule { limit: 3, window_ms: 1000 });
        let reg = RequestRegistry::new(&rules);
        for t in [0, 100, 200] {
            reg.check_rate_limit(&client, EndpointKind::Ask, t).unwrap();
        }
        let err = reg.check_rate_limit(&client, EndpointKind::Ask, 300).unwrap_err();
        match err {
            ApiError::RateLimited { retry_after_ms } => assert!(retry_after_ms > 0),
            _ => panic!("expected RateLimited"),
        }
    }

    #[test]
    fn exactly_k_minus_limit_rejected_in_a_burst() {
        let mut rules = BTreeMap::new();
        rules.insert("ask".to_string(), RateLimitRule { limit: 5, window_ms: 60_000 });
        let reg = RequestRegistry::new(&rules);
        let client = ClientId("c1".into());
        let k = 12;
        let mut rejected = 0;
        for i in 0..k {
            if reg.check_rate_limit(&client, EndpointKind::Ask, i).is_err() {
                rejected += 1;
            }
        }
        assert_eq!(rejected, k as usize - 5);
    }

    #[test]
    fn window_slides_and_admits_again_after_expiry() {
        let mut rules = BTreeMap::new();
        rules.insert("ask".to_string(), RateLimitRule { limit: 1, window_ms: 1000 });
        let reg = RequestRegistry::new(&rules);
        let client = ClientId("c1".into());
        reg.check_rate_limit(&client, EndpointKind::Ask, 0).unwrap();
        assert!(reg.check_rate_limit(&client, EndpointKind::Ask, 500).is_err());
        assert!(reg.check_rate_limit(&client, EndpointKind::Ask, 1500).is_ok());
    }

    #[test]
    fn active_count_tracks_admit_and_complete() {
        let reg = registry();
        let client = ClientId("c1".into());
        reg.admit(client.clone(), RequestId("r1".into()), RequestKind::Ask);
        assert_eq!(reg.active_count(&client), 1);
        reg.complete(&RequestId("r1".into()));
        assert_eq!(reg.active_count(&client), 0);
    }
}
