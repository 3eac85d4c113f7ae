//! Structure-aware text chunker.
//!
//! Splits extracted document text into [`Chunk`]s bounded by `max_tokens`.
//! A token is a maximal run of non-whitespace characters.
//!
//! # Algorithm
//!
//! 1. Tokenize the text, recording the byte span of every token.
//! 2. Assign each token to the structural section containing its start
//!    (a missing structure means one section covering the whole text).
//! 3. Pack whole sections greedily while the running token count stays
//!    within `max_tokens`.
//! 4. A section that does not fit flushes the open chunk. If the section is
//!    itself larger than `max_tokens` it is hard-split at token boundaries
//!    into full chunks; its remainder stays open and may be packed with the
//!    following sections.
//! 5. Every chunk after the first gets the last `overlap_tokens` tokens of
//!    its predecessor prepended to its embedding context. The overlap is
//!    never part of the canonical span.
//!
//! Canonical spans tile the text: the first chunk starts at byte 0, each
//! chunk ends where the next one's first token begins, and the last chunk
//! ends at the end of the text. Concatenating the `text` of every chunk
//! reproduces the input exactly.
//!
//! # Example
//!
//! ```rust
//! use audit_intel_core::chunk::{chunk_document, ChunkParams};
//! use audit_intel_core::models::Structure;
//!
//! let text = "Scope of the audit.\n\nFindings follow.";
//! let chunks = chunk_document("doc-123", text, &Structure::default(), &ChunkParams::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].token_count, 6);
//! ```

use serde::{Deserialize, Serialize};

use crate::models::{chunk_id, fingerprint, Chunk, Structure};

/// Chunking parameters. One set applies to the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
}

/// A run of consecutive tokens that became one chunk.
#[derive(Debug, Clone, Copy)]
struct Group {
    first: usize,
    /// Exclusive.
    last: usize,
    section: usize,
}

/// Split `text` into chunks aligned to `structure`.
///
/// Returns an empty vector when the text contains no tokens. Identical
/// inputs always produce identical chunks, ids and fingerprints included.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    structure: &Structure,
    params: &ChunkParams,
) -> Vec<Chunk> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut sections: Vec<(usize, Option<String>)> = structure
        .sections
        .iter()
        .map(|s| (s.start, s.location.clone()))
        .collect();
    if sections.is_empty() {
        sections.push((0, None));
    }
    sections.sort_by_key(|(start, _)| *start);

    let groups = pack(&tokens, &section_runs(&tokens, &sections), params.max_tokens.max(1));

    let mut chunks = Vec::with_capacity(groups.len());
    for (i, group) in groups.iter().enumerate() {
        let start = if i == 0 { 0 } else { tokens[group.first].start };
        let end = match groups.get(i + 1) {
            Some(next) => tokens[next.first].start,
            None => text.len(),
        };

        let overlap_first = if i == 0 {
            group.first
        } else {
            let prev = groups[i - 1];
            group.first - params.overlap_tokens.min(prev.last - prev.first)
        };
        let overlap_start = tokens[overlap_first].start;
        let context = &text[overlap_start..tokens[group.last - 1].end];

        chunks.push(Chunk {
            id: chunk_id(document_id, i),
            document_id: document_id.to_string(),
            index: i,
            start,
            end,
            overlap_start,
            text: text[start..end].to_string(),
            context: context.to_string(),
            token_count: group.last - group.first,
            fingerprint: fingerprint(context.as_bytes()),
            location: sections[group.section].1.clone(),
        });
    }
    chunks
}

/// Count the tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut open: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        match (ch.is_whitespace(), open) {
            (true, Some(start)) => {
                tokens.push(Token { start, end: i });
                open = None;
            }
            (false, None) => open = Some(i),
            _ => {}
        }
    }
    if let Some(start) = open {
        tokens.push(Token {
            start,
            end: text.len(),
        });
    }
    tokens
}

/// Consecutive token ranges `(first, last_exclusive, section)`, one per
/// section that contains at least one token.
fn section_runs(tokens: &[Token], sections: &[(usize, Option<String>)]) -> Vec<(usize, usize, usize)> {
    let mut runs: Vec<(usize, usize, usize)> = Vec::new();
    let mut current = 0;
    for (t, token) in tokens.iter().enumerate() {
        while current + 1 < sections.len() && sections[current + 1].0 <= token.start {
            current += 1;
        }
        match runs.last_mut() {
            Some(run) if run.2 == current => run.1 = t + 1,
            _ => runs.push((t, t + 1, current)),
        }
    }
    runs
}

fn pack(tokens: &[Token], runs: &[(usize, usize, usize)], max_tokens: usize) -> Vec<Group> {
    let mut groups = Vec::new();
    let mut open: Option<Group> = None;

    for &(first, last, section) in runs {
        let size = last - first;
        if let Some(group) = open.as_mut() {
            if group.last - group.first + size <= max_tokens {
                group.last = last;
                continue;
            }
            groups.push(*group);
            open = None;
        }

        let mut cursor = first;
        while last - cursor > max_tokens {
            groups.push(Group {
                first: cursor,
                last: cursor + max_tokens,
                section,
            });
            cursor += max_tokens;
        }
        open = Some(Group {
            first: cursor,
            last,
            section,
        });
    }

    if let Some(group) = open {
        groups.push(group);
    }
    debug_assert!(groups.iter().all(|g| g.last > g.first && g.last <= tokens.len()));
    groups
}
