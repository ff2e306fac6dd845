//! Per-request audio segment buffer backing the `/tts_stream` endpoint
//! (spec.md §6). `/ask`'s SSE response carries only text and an
//! `audio_ready` notification per segment; the audio bytes themselves are
//! fetched separately by `GET /tts_stream?request_id=&seq=`, so segments
//! need to be addressable after the fact, not just streamed once to
//! whichever task is currently reading. Same ring-buffer-plus-broadcast
//! shape as `docent_events::EventStore`'s per-request log, reused here for
//! the same reason: a late or slow `/tts_stream` reader must still see
//! every emitted segment in order.

use dashmap::DashMap;
use docent_core::ids::RequestId;
use docent_core::model::AudioSegment;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

struct Buffer {
    segments: Mutex<Vec<AudioSegment>>,
    live: broadcast::Sender<AudioSegment>,
}

pub struct AudioBufferStore {
    buffers: DashMap<RequestId, Arc<Buffer>>,
}

impl Default for AudioBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBufferStore {
    pub fn new() -> Self {
        Self { buffers: DashMap::new() }
    }

    fn buffer_for(&self, request_id: &RequestId) -> Arc<Buffer> {
        self.buffers
            .entry(request_id.clone())
            .or_insert_with(|| {
                let (live, _) = broadcast::channel(64);
                Arc::new(Buffer { segments: Mutex::new(Vec::new()), live })
            })
            .clone()
    }

    pub fn append(&self, segment: AudioSegment) {
        let buffer = self.buffer_for(&segment.request_id);
        buffer.segments.lock().push(segment.clone());
        let _ = buffer.live.send(segment);
    }

    /// Segments with `seq >= from_seq`, already emitted, in order — used to
    /// serve a `/tts_stream` request whose reader attaches after some
    /// segments already landed.
    pub fn segments_from(&self, request_id: &RequestId, from_seq: u32) -> Vec<AudioSegment> {
        let Some(buffer) = self.buffers.get(request_id) else {
            return Vec::new();
        };
        buffer
            .segments
            .lock()
            .iter()
            .filter(|s| s.seq >= from_seq)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self, request_id: &RequestId) -> broadcast::Receiver<AudioSegment> {
        self.buffer_for(request_id).live.subscribe()
    }

    pub fn clear(&self, request_id: &RequestId) {
        self.buffers.remove(request_id);
    }
}

pub type SharedAudioBufferStore = Arc<AudioBufferStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use docent_core::ids::RequestId;

    fn seg(req: &str, seq: u32) -> AudioSegment {
        AudioSegment {
            request_id: RequestId(req.into()),
            seq,
            bytes: vec![0u8; 4],
            content_type: "audio/mpeg".into(),
            duration_hint_ms: None,
        }
    }

    #[test]
    fn segments_from_filters_and_orders() {
        let store = AudioBufferStore::new();
        store.append(seg("r1", 0));
        store.append(seg("r1", 1));
        store.append(seg("r1", 2));
        let got = store.segments_from(&RequestId("r1".into()), 1);
        assert_eq!(got.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn subscribe_sees_segments_appended_after() {
        use tokio::sync::broadcast::error::RecvError;
        let store = AudioBufferStore::new();
        let mut rx = store.subscribe(&RequestId("r1".into()));
        store.append(seg("r1", 0));
        let got = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .unwrap();
        match got {
            Ok(s) => assert_eq!(s.seq, 0),
            Err(RecvError::Closed) => panic!("channel closed unexpectedly"),
            Err(e) => panic!("unexpected recv error: {e:?}"),
        }
    }
}
