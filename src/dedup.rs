//! Line-level merging of the two search result blocks.
//!
//! The keyword search and the prompt search usually return overlapping
//! chunks. [`dedupe`] filters the second block against the first so the
//! grounded prompt does not repeat context. Filtering is one-directional:
//! the first block is never modified.

use std::collections::HashSet;

/// Removes from `second` every line already present in `first`.
///
/// Lines compare by their trimmed text; blank lines in `second` are
/// dropped. Surviving lines keep their order and their original
/// whitespace.
pub fn dedupe(first: &str, second: &str) -> (String, String) {
    if first.is_empty() || second.is_empty() || first == second {
        // Covers both-empty, one-empty, and identical blocks.
        let kept = if first.is_empty() { "" } else { first };
        let other = if first.is_empty() { second } else { "" };
        return (kept.to_string(), other.to_string());
    }

    let seen: HashSet<&str> = first
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let filtered: Vec<&str> = second
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !seen.contains(trimmed)
        })
        .collect();

    (first.to_string(), filtered.join("\n"))
}

/// Combined context for the grounded prompt: `first`, then the filtered
/// `second`, separated by a newline when both are non-empty.
pub fn combine_context(first: &str, second: &str) -> String {
    let (first, second) = dedupe(first, second);
    match (first.is_empty(), second.is_empty()) {
        (_, true) => first,
        (true, false) => second,
        (false, false) => format!("{}\n{}", first, second),
    }
}
