//! Text Cleaner & Segmenter (spec.md §4.4, C4).
//!
//! Grounded on the mock providers' streaming idiom in `docent-providers`
//! (`futures::stream::then` over owned state) for the lazy adapter, with
//! the sentence-boundary and chunk-emission rules hand-implemented per
//! spec.md's precedence list — the teacher pack has no sentence segmenter
//! to ground this on, so the rules are a direct, literal transcription of
//! §4.4 rather than an adaptation of an existing teacher routine.

use docent_core::config::CleanerConfig;
use docent_core::error::ApiError;
use docent_core::model::CleanedChunk;
use docent_providers::TextStream;
use futures::Stream;
use futures::StreamExt;
use std::pin::Pin;

const TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '；', ';'];

/// Sentence-boundary-aware text segmenter. Owns the accumulation buffer
/// across repeated `push` calls so callers can feed it RAG fragments of
/// arbitrary, provider-determined size (spec.md §4.4).
pub struct Segmenter {
    cfg: CleanerConfig,
    buf: String,
    next_seq: u32,
    done: bool,
}

impl Segmenter {
    pub fn new(cfg: CleanerConfig) -> Self {
        Self { cfg, buf: String::new(), next_seq: 0, done: false }
    }

    /// Normalizes `fragment` (control chars stripped, whitespace collapsed)
    /// and appends it to the buffer, then emits zero or more chunks
    /// (spec.md §4.4 rules 1-3). Must not be called again after `finish`.
    pub fn push(&mut self, fragment: &str) -> Vec<CleanedChunk> {
        debug_assert!(!self.done, "Segmenter::push called after finish");
        self.buf.push_str(&normalize(fragment));
        self.drain_ready_chunks()
    }

    /// Flushes the remainder as one final chunk (spec.md §4.4 rule 4). If
    /// the buffer is empty, emits an empty sentinel chunk. Idempotent only
    /// in the sense that calling twice would double-finalize — callers own
    /// the single-call discipline, matching `CleanedChunk.seq`'s dense
    /// prefix invariant (spec.md §3 invariant 2).
    pub fn finish(mut self) -> CleanedChunk {
        self.done = true;
        let text = std::mem::take(&mut self.buf);
        let seq = self.next_seq;
        CleanedChunk { seq, text, finalized: true }
    }

    fn drain_ready_chunks(&mut self) -> Vec<CleanedChunk> {
        let mut out = Vec::new();
        loop {
            let Some(cut) = self.find_cut_point() else { break };
            if cut == 0 {
                break;
            }
            let text: String = self.buf.drain(..cut).collect();
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            out.push(CleanedChunk { seq: self.next_seq, text, finalized: false });
            self.next_seq += 1;
        }
        out
    }

    /// Returns a byte offset to cut the buffer at, or `None` if nothing is
    /// ready to emit yet. Implements spec.md §4.4 rule 3's three-tier
    /// precedence. `min_chunk_size`/`soft_min`/`max_chunk_size` are all
    /// **char** counts (spec.md §3: "text: non-empty string <=
    /// max_chunk_size chars"), so every size check below is done in chars
    /// and every byte offset this returns is floored to a char boundary —
    /// the buffer routinely holds multi-byte CJK text (spec.md scenarios
    /// 1/2), where a raw byte-length cut panics mid-codepoint.
    fn find_cut_point(&self) -> Option<usize> {
        let buf = &self.buf;
        if buf.is_empty() {
            return None;
        }
        let char_len = buf.chars().count();

        // (a) buffer >= min_chunk_size and the last terminator is >= soft_min.
        if char_len >= self.cfg.min_chunk_size {
            if let Some(t) = last_terminator_end(buf, buf.len()) {
                if char_count(&buf[..t]) >= self.cfg.soft_min {
                    return Some(t);
                }
            }
        }

        if char_len < self.cfg.max_chunk_size {
            return None;
        }

        // (b) buffer >= max_chunk_size: cut at the latest terminator <= max.
        let max_byte_limit = byte_offset_at_char_count(buf, self.cfg.max_chunk_size);
        if let Some(t) = last_terminator_end(buf, max_byte_limit) {
            return Some(t);
        }

        // or the last whitespace <= max.
        let window = &buf[..max_byte_limit];
        if let Some(pos) = window.rfind(char::is_whitespace) {
            let ws_len = window[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
            return Some(pos + ws_len);
        }

        // or, as a last resort, exactly max_chunk_size chars.
        Some(max_byte_limit)
    }
}

/// Byte offset of the boundary just past `n` chars into `buf` (or
/// `buf.len()` if it has fewer), always a valid char boundary.
fn byte_offset_at_char_count(buf: &str, n: usize) -> usize {
    buf.char_indices().nth(n).map(|(i, _)| i).unwrap_or(buf.len())
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset just past the last terminator within `buf[..limit]` that is
/// itself followed by whitespace or the buffer end (spec.md §4.4 rule 2).
/// Quotes immediately after a terminator do not block the match — they are
/// skipped before checking for trailing whitespace/end. `limit` must
/// already be a char boundary (the caller derives it from a char count, or
/// passes `buf.len()`).
fn last_terminator_end(buf: &str, limit: usize) -> Option<usize> {
    let limit = limit.min(buf.len());
    let window = &buf[..limit];
    let mut best = None;
    for (idx, ch) in window.char_indices() {
        if TERMINATORS.contains(&ch) {
            let after = idx + ch.len_utf8();
            // Skip closing quotes/brackets directly after the terminator.
            let mut scan = after;
            for c in buf[after..].chars() {
                if matches!(c, '"' | '\'' | '”' | '’' | '）' | ')') {
                    scan += c.len_utf8();
                } else {
                    break;
                }
            }
            let boundary_ok = buf[scan..]
                .chars()
                .next()
                .map(|c| c.is_whitespace())
                .unwrap_or(true);
            if boundary_ok {
                best = Some(scan);
            }
        }
    }
    best
}

/// Control-character stripping and whitespace collapsing (spec.md §4.4
/// rule 1). Bracketed citation markers (`[1]`, `【1】`) are stripped as the
/// configurable-substitution example spec.md names.
fn normalize(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == ' ')
        .collect();
    let no_citations = strip_citation_markers(&stripped);
    let mut out = String::with_capacity(no_citations.len());
    let mut last_was_space = false;
    for c in no_citations.chars() {
        if c.is_whitespace() {
            if !last_was_space && !out.is_empty() {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn strip_citation_markers(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        let (open, close) = match c {
            '[' => ('[', ']'),
            '【' => ('【', '】'),
            _ => {
                out.push(c);
                continue;
            }
        };
        let mut lookahead = String::new();
        let mut closed = false;
        while let Some(&n) = chars.peek() {
            if n == close {
                chars.next();
                closed = true;
                break;
            }
            if n == open || lookahead.len() > 16 {
                break;
            }
            lookahead.push(n);
            chars.next();
        }
        if !closed || !lookahead.chars().all(|c| c.is_ascii_digit() || c == ',' || c.is_whitespace()) {
            out.push(c);
            out.push_str(&lookahead);
            if closed {
                out.push(close);
            }
        }
    }
    out
}

/// One item of `segment_stream`'s output. `upstream_error` is set only on
/// the final (`finalized: true`) item, and only when the RAG stream ended
/// with an error rather than cleanly — the orchestrator needs to tell
/// those two cases apart to record `rag_partial`+`error` instead of
/// `rag_done`+`done` (spec.md §4.6 "RAG error mid-stream", §8 scenario 5).
pub struct SegmentedChunk {
    pub chunk: CleanedChunk,
    pub upstream_error: Option<ApiError>,
}

/// Adapts a lazy RAG text-fragment stream into a lazy `SegmentedChunk`
/// stream, driving a `Segmenter` internally. The emitted stream always
/// ends with exactly one `finalized: true` chunk, even for an empty input
/// stream (spec.md §4.4 rule 4, §8 "Cleaner: empty RAG stream -> one
/// finalized empty chunk").
enum SegState {
    Running(Segmenter, TextStream, std::collections::VecDeque<CleanedChunk>),
    Finished,
}

pub fn segment_stream(
    cfg: CleanerConfig,
    input: TextStream,
) -> Pin<Box<dyn Stream<Item = SegmentedChunk> + Send>> {
    let state = SegState::Running(Segmenter::new(cfg), input, std::collections::VecDeque::new());
    Box::pin(futures::stream::unfold(state, |state| async move {
        let (mut seg, mut input, mut pending) = match state {
            SegState::Finished => return None,
            SegState::Running(seg, input, pending) => (seg, input, pending),
        };
        loop {
            if let Some(chunk) = pending.pop_front() {
                let item = SegmentedChunk { chunk, upstream_error: None };
                return Some((item, SegState::Running(seg, input, pending)));
            }
            match input.next().await {
                Some(Ok(fragment)) => {
                    pending.extend(seg.push(&fragment));
                    continue;
                }
                Some(Err(e)) => {
                    // RAG error mid-stream: flush whatever was already
                    // cleaned as one finalized chunk, but carry the error
                    // along it so the caller can distinguish this from a
                    // clean end-of-stream.
                    let last = seg.finish();
                    let item = SegmentedChunk { chunk: last, upstream_error: Some(e) };
                    return Some((item, SegState::Finished));
                }
                None => {
                    let last = seg.finish();
                    let item = SegmentedChunk { chunk: last, upstream_error: None };
                    return Some((item, SegState::Finished));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn cfg() -> CleanerConfig {
        CleanerConfig { min_chunk_size: 10, soft_min: 15, max_chunk_size: 40 }
    }

    #[test]
    fn empty_stream_yields_single_finalized_empty_chunk() {
        let seg = Segmenter::new(cfg());
        let chunk = seg.finish();
        assert_eq!(chunk.seq, 0);
        assert!(chunk.text.is_empty());
        assert!(chunk.finalized);
    }

    #[test]
    fn emits_at_sentence_boundary_past_soft_min() {
        let mut seg = Segmenter::new(cfg());
        let chunks = seg.push("This is a longer sentence. And more text follows after it.");
        assert!(!chunks.is_empty());
        assert!(chunks[0].text.ends_with('.'));
        assert!(!chunks[0].finalized);
    }

    #[test]
    fn emits_at_max_size_with_no_terminator_using_whitespace() {
        let mut seg = Segmenter::new(cfg());
        let long_no_terminator = "word ".repeat(20); // no '.', '!', '?'
        let chunks = seg.push(&long_no_terminator);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.len() <= 40);
        }
    }

    #[test]
    fn hard_cut_at_exactly_max_when_no_boundary_at_all() {
        let mut seg = Segmenter::new(cfg());
        let long_no_space = "a".repeat(100);
        let chunks = seg.push(&long_no_space);
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].text.len(), 40);
    }

    #[test]
    fn seq_values_are_dense_and_ordered() {
        let mut seg = Segmenter::new(cfg());
        let mut all = seg.push(&"Sentence one is here. Sentence two is here. Sentence three.".repeat(2));
        all.push(seg.finish());
        for (i, c) in all.iter().enumerate() {
            assert_eq!(c.seq, i as u32);
        }
        assert!(all.last().unwrap().finalized);
        assert!(all[..all.len() - 1].iter().all(|c| !c.finalized));
    }

    #[tokio::test]
    async fn segment_stream_on_empty_input_yields_one_finalized_chunk() {
        let input: TextStream = Box::pin(stream::iter(Vec::<Result<String, ApiError>>::new()));
        let mut out = segment_stream(cfg(), input);
        let item = out.next().await.unwrap();
        assert!(item.chunk.finalized);
        assert!(item.chunk.text.is_empty());
        assert!(item.upstream_error.is_none());
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn segment_stream_exactly_max_size_with_no_terminator_cuts_at_max() {
        let frag = "x".repeat(40);
        let input: TextStream = Box::pin(stream::iter(vec![Ok(frag.clone())]));
        let mut out = segment_stream(cfg(), input);
        let first = out.next().await.unwrap();
        assert_eq!(first.chunk.text.len(), 40);
        assert!(!first.chunk.finalized);
        let last = out.next().await.unwrap();
        assert!(last.chunk.finalized);
        assert!(last.chunk.text.is_empty());
        assert!(last.upstream_error.is_none());
    }

    #[tokio::test]
    async fn segment_stream_mid_stream_rag_error_is_distinguished_from_clean_end() {
        let input: TextStream = Box::pin(stream::iter(vec![
            Ok("第一段介绍。".to_string()),
            Ok("第二段介绍。".to_string()),
            Err(ApiError::RagError { provider: "mock".to_string(), message: "upstream dropped".to_string() }),
        ]));
        let mut out = segment_stream(cfg(), input);
        let mut items = Vec::new();
        while let Some(item) = out.next().await {
            items.push(item);
        }
        let last = items.last().unwrap();
        assert!(last.chunk.finalized);
        assert!(matches!(last.upstream_error, Some(ApiError::RagError { .. })));
        assert!(items[..items.len() - 1].iter().all(|i| i.upstream_error.is_none()));
    }

    #[test]
    fn citation_markers_are_stripped() {
        let cleaned = normalize("Paris is the capital[1] of France.");
        assert!(!cleaned.contains('['));
    }

    #[test]
    fn collapses_repeated_whitespace() {
        let cleaned = normalize("a   b\n\nc");
        assert_eq!(cleaned, "a b c");
    }

    #[test]
    fn cjk_buffer_past_max_with_no_terminator_or_whitespace_does_not_panic() {
        let mut seg = Segmenter::new(cfg());
        let long = "展".repeat(87); // 3-byte-in-UTF-8 CJK codepoints, no terminators/whitespace
        let chunks = seg.push(&long);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.chars().count() <= 40);
        }
        let total: String = chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>().join("");
        assert_eq!(total.chars().count(), 80); // two chunks of 40 drained, 7 left buffered
    }

    /// Default `max_chunk_size` is 260 **chars**; 87 3-byte CJK codepoints
    /// is 261 *bytes* but only 87 chars, so a byte-counting implementation
    /// would wrongly treat the buffer as past `max_chunk_size` and attempt
    /// to cut at byte 260, which is not a char boundary and panics. Under
    /// the char-counting fix the buffer stays below the 260-char threshold
    /// and nothing is emitted yet.
    #[test]
    fn default_config_cjk_buffer_under_char_limit_is_not_cut() {
        let mut seg = Segmenter::new(CleanerConfig::default());
        let long = "展".repeat(87);
        let chunks = seg.push(&long);
        assert!(chunks.is_empty(), "87 chars is under the 260-char max_chunk_size, nothing should emit yet");
        let last = seg.finish();
        assert_eq!(last.text.chars().count(), 87);
        assert!(last.finalized);
    }

    #[test]
    fn cjk_sentence_boundary_is_respected() {
        let mut seg = Segmenter::new(cfg());
        let chunks = seg.push("这是一个比较长的介绍句子。这里还有更多的文字内容跟随其后。");
        assert!(!chunks.is_empty());
        assert!(chunks[0].text.ends_with('。'));
        assert!(!chunks[0].finalized);
    }
}
