//! Sentence-boundary text chunker with sentence overlap.
//!
//! Splits extracted document text into overlapping [`Chunk`]s bounded by a
//! whitespace-token budget. Sentences are never cut: a single sentence
//! longer than the budget becomes a chunk of its own.
//!
//! # Algorithm
//!
//! 1. Split text into sentences after `.`, `!` or `?` followed by whitespace.
//! 2. Accumulate sentences while the running token count stays within
//!    `max_tokens`.
//! 3. On overflow, close the current chunk (sentences joined by one space)
//!    and seed the next one with the last `overlap_sentences` sentences of
//!    the closed chunk, then append the overflowing sentence. The seed is
//!    never trimmed, so a seeded chunk may exceed `max_tokens`.
//! 4. Flush the trailing accumulator.
//!
//! Output is a pure function of the input text and parameters.
//!
//! # Example
//!
//! ```rust
//! use helpdesk_harness_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("One two three. Four five six. Seven eight.", 6, 1);
//! assert_eq!(chunks, vec!["One two three. Four five six.", "Four five six. Seven eight."]);
//! ```

use crate::models::{Chunk, ChunkingParams};

/// Whitespace-token count, the unit of every chunk budget.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split text into trimmed, non-empty sentences.
///
/// A boundary is a `.`, `!` or `?` immediately followed by whitespace; the
/// punctuation stays with the preceding sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let followed_by_space = matches!(chars.peek(), Some(&(_, next)) if next.is_whitespace());
        if !followed_by_space {
            continue;
        }
        push_trimmed(&mut sentences, &text[start..i + c.len_utf8()]);
        while let Some(&(_, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            chars.next();
        }
        start = chars.peek().map(|&(j, _)| j).unwrap_or(text.len());
    }
    push_trimmed(&mut sentences, &text[start..]);

    sentences
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, s: &'a str) {
    let s = s.trim();
    if !s.is_empty() {
        out.push(s);
    }
}

/// Chunk text into overlapping sentence groups.
///
/// # Guarantees
///
/// - Empty or whitespace-only input yields no chunks.
/// - With `overlap_sentences = 0`, chunks partition the sentences and every
///   chunk is within `max_tokens` unless it holds a single sentence that
///   alone exceeds the budget.
/// - With `overlap_sentences = k > 0`, chunk `i + 1` starts with the last
///   `min(k, n_i)` sentences of chunk `i`. Only the sentences appended after
///   that seed are bounded by `max_tokens`.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_sentences: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0usize;

    for sentence in split_sentences(text) {
        let tokens = token_count(sentence);

        if current.is_empty() || current_tokens + tokens <= max_tokens {
            current.push(sentence);
            current_tokens += tokens;
            continue;
        }

        chunks.push(current.join(" "));

        let keep = overlap_sentences.min(current.len());
        current = current.split_off(current.len() - keep);
        current_tokens = current.iter().map(|s| token_count(s)).sum();
        current.push(sentence);
        current_tokens += tokens;
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

/// Chunk one document into [`Chunk`]s with contiguous indices from 0.
pub fn chunk_document(source: &str, text: &str, params: ChunkingParams) -> Vec<Chunk> {
    chunk_text(text, params.max_tokens, params.overlap_sentences)
        .into_iter()
        .enumerate()
        .map(|(i, t)| Chunk::new(source, i, t))
        .collect()
}
