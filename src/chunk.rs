//! Overlapping, separator-aware text chunker.
//!
//! Splits a document's text into [`Chunk`]s of at most `max_chars` bytes.
//! Consecutive chunks of the same document share up to `overlap_chars` bytes
//! so a fact that straddles a boundary is still whole in at least one chunk.
//!
//! # Algorithm
//!
//! 1. Open a window of `max_chars` bytes at the current start.
//! 2. If the window reaches the end of the text, emit it and stop.
//! 3. Otherwise end the window at the last separator inside it, trying
//!    paragraph break, line break, sentence end, comma, then space. A
//!    separator is only accepted in the back half of the window; with none
//!    found the window is cut hard at a UTF-8 boundary.
//! 4. Start the next window `overlap_chars` before the end, nudged forward
//!    to the next word start.
//! 5. Drop pieces shorter than `min_chars` after trimming.
//!
//! Boundaries are a pure function of the text and the policy, and chunk ids
//! are UUID v5 over `(document_id, chunk_index)`, so re-chunking unchanged
//! input yields byte-identical chunks.
//!
//! # Example
//!
//! ```rust
//! use docqa::chunk::{chunk_text, ChunkPolicy};
//!
//! let policy = ChunkPolicy { max_chars: 800, overlap_chars: 150, min_chars: 10 };
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", &policy);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Break candidates, strongest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", ", ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub min_chars: usize,
}

impl From<&ChunkingConfig> for ChunkPolicy {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_chars,
            overlap_chars: config.overlap_chars,
            min_chars: config.min_chars,
        }
    }
}

/// Split `text` into overlapping chunks. Text with nothing but whitespace
/// yields no chunks.
pub fn chunk_text(document_id: &str, text: &str, policy: &ChunkPolicy) -> Vec<Chunk> {
    let max_chars = policy.max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = skip_whitespace(text, 0);
    let mut prev_end: Option<usize> = None;

    while start < text.len() {
        let hard_end = snap_to_char_boundary(text, start + max_chars);
        let end = if hard_end >= text.len() {
            text.len()
        } else {
            let end = find_break(text, start, hard_end, max_chars);
            if end > start {
                end
            } else {
                next_char_boundary(text, start)
            }
        };

        let span = &text[start..end];
        let piece = span.trim();
        if !piece.is_empty() && piece.len() >= policy.min_chars {
            let piece_start = start + (span.len() - span.trim_start().len());
            let overlap = prev_end.map(|p| p.saturating_sub(piece_start)).unwrap_or(0);
            let index = chunks.len() as i64;
            chunks.push(make_chunk(document_id, index, piece, piece_start, overlap));
            prev_end = Some(piece_start + piece.len());
        }

        if end >= text.len() {
            break;
        }

        let mut next = next_window_start(text, end, policy.overlap_chars);
        if next <= start {
            next = end;
        }
        start = skip_whitespace(text, next);
    }

    chunks
}

/// Last separator inside `[start, hard_end)`, restricted to the back half of
/// the window. Returns `hard_end` when none qualifies.
fn find_break(text: &str, start: usize, hard_end: usize, max_chars: usize) -> usize {
    let window = &text[start..hard_end];
    let floor = max_chars / 2;
    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            let cut = pos + sep.len();
            if cut > floor {
                return start + cut;
            }
        }
    }
    hard_end
}

/// Step back `overlap` bytes from `end`, then forward to a word start so the
/// next chunk does not open mid-word. Text with no word break in the overlap
/// (CJK, URLs, base64) keeps the full overlap.
fn next_window_start(text: &str, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }
    let candidate = snap_to_char_boundary(text, end.saturating_sub(overlap));
    let mid_word = text[..candidate]
        .chars()
        .next_back()
        .map(|c| !c.is_whitespace())
        .unwrap_or(false);
    if !mid_word {
        return candidate;
    }
    match text[candidate..end].find(char::is_whitespace) {
        Some(offset) => candidate + offset,
        None => candidate,
    }
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    let rest = &text[from..];
    from + (rest.len() - rest.trim_start().len())
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

fn make_chunk(document_id: &str, index: i64, text: &str, start: usize, overlap: usize) -> Chunk {
    let hash = format!("{:x}", Sha256::digest(text.as_bytes()));
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", document_id, index).as_bytes(),
    );

    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
        start,
        overlap,
    }
}
