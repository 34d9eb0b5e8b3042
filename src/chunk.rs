//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`TextChunk`]s of at most `max_tokens`
//! (approximated as four characters per token). Splitting prefers
//! paragraph boundaries (`\n\n`), then newlines, then spaces. Each chunk
//! carries a SHA-256 of its text so repeated chunks can be dropped before
//! embedding.
//!
//! With a nonzero overlap, every chunk after the first starts with the
//! word-aligned tail of its predecessor; the paragraph split reserves room
//! for it so chunks stay within budget.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub hash: String,
}

/// Splits `text` into chunks with contiguous indices starting at 0.
/// Whitespace-only text yields no chunks. `overlap_tokens` is clamped below
/// `max_tokens`.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<TextChunk> {
    let max_tokens = max_tokens.max(1);
    let overlap_chars = overlap_tokens.min(max_tokens - 1) * CHARS_PER_TOKEN;
    let budget = if overlap_chars == 0 {
        max_tokens * CHARS_PER_TOKEN
    } else {
        // One extra char for the space joining the carried tail.
        max_tokens * CHARS_PER_TOKEN - overlap_chars - 1
    };
    let pieces = overlap(split_pieces(text, budget.max(1)), overlap_chars);

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk {
            index,
            hash: sha256_hex(&text),
            text,
        })
        .collect()
}

fn split_pieces(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            char_len(trimmed)
        } else {
            char_len(&current) + 2 + char_len(trimmed)
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if char_len(trimmed) > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let (head, tail) = split_near(remaining, max_chars);
                let head = head.trim();
                if !head.is_empty() {
                    pieces.push(head.to_string());
                }
                remaining = tail.trim_start();
            }
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn overlap(pieces: Vec<String>, overlap_chars: usize) -> Vec<String> {
    if overlap_chars == 0 {
        return pieces;
    }
    let mut out: Vec<String> = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let carried = match i {
            0 => "",
            _ => tail(&pieces[i - 1], overlap_chars),
        };
        if carried.is_empty() {
            out.push(piece.clone());
        } else {
            out.push(format!("{} {}", carried, piece));
        }
    }
    out
}

/// The last `max_chars` characters of `s`, advanced to a word start when
/// the cut lands mid-word.
fn tail(s: &str, max_chars: usize) -> &str {
    let len = char_len(s);
    if len <= max_chars {
        return s.trim();
    }
    let Some((start, _)) = s.char_indices().nth(len - max_chars) else {
        return "";
    };
    let window = &s[start..];
    let mid_word = !s[..start].ends_with(char::is_whitespace);
    let window = match (mid_word, window.find(char::is_whitespace)) {
        (true, Some(pos)) => &window[pos..],
        _ => window,
    };
    window.trim()
}

/// Drops chunks whose text already appeared, keeping first occurrences in
/// order. Indices are renumbered.
pub fn dedupe_chunks(chunks: Vec<TextChunk>) -> Vec<TextChunk> {
    let mut seen = HashSet::new();
    chunks
        .into_iter()
        .filter(|c| seen.insert(c.hash.clone()))
        .enumerate()
        .map(|(index, c)| TextChunk { index, ..c })
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Splits at most `max_chars` characters off the front of `s`, backing up
/// to the last newline or space when there is one.
fn split_near(s: &str, max_chars: usize) -> (&str, &str) {
    let Some((limit, _)) = s.char_indices().nth(max_chars) else {
        return (s, "");
    };
    let window = &s[..limit];
    let at = window
        .rfind('\n')
        .or_else(|| window.rfind(' '))
        .filter(|&pos| pos > 0)
        .map(|pos| pos + 1)
        .unwrap_or(limit);
    s.split_at(at)
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
