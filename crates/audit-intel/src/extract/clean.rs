//! Text cleanup applied between extraction and chunking.
//!
//! Removes page-number artifacts and running headers/footers, normalizes
//! typographic punctuation, and collapses whitespace. Cleaning works per
//! section and rebuilds the [`Structure`] so offsets stay valid for the
//! cleaned text.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use super::{Extracted, StructureBuilder};

/// Lines longer than this are never treated as headers or footers.
const MAX_HEADER_CHARS: usize = 100;
/// A short line seen more often than this is a running header/footer.
const HEADER_REPEAT_THRESHOLD: usize = 3;
/// Header detection only applies to documents with more lines than this.
const MIN_LINES_FOR_HEADER_DETECTION: usize = 10;

static PAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Page [0-9]+ of [0-9]+|- [0-9]+ -").expect("valid regex"));
static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[0-9]+\s*$").expect("valid regex"));
static SPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").expect("valid regex"));

/// Clean every section of `extracted`, dropping sections left empty.
pub fn clean_document(extracted: &Extracted) -> Extracted {
    let sections: Vec<(String, Option<String>)> = extracted
        .structure
        .sections
        .iter()
        .map(|s| {
            (
                normalize_typography(&extracted.text[s.start..s.end]),
                s.location.clone(),
            )
        })
        .collect();

    let repeated = repeated_lines(sections.iter().map(|(text, _)| text.as_str()));

    let mut builder = StructureBuilder::default();
    for (text, location) in sections {
        builder.push_section(&clean_section(&text, &repeated), location);
    }
    builder.finish()
}

/// Short lines that repeat often enough to be running headers or footers.
fn repeated_lines<'a>(sections: impl Iterator<Item = &'a str>) -> HashSet<String> {
    let mut total = 0usize;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for section in sections {
        for line in section.lines() {
            total += 1;
            let stripped = line.trim();
            if !stripped.is_empty() && stripped.chars().count() < MAX_HEADER_CHARS {
                *counts.entry(stripped).or_default() += 1;
            }
        }
    }
    if total <= MIN_LINES_FOR_HEADER_DETECTION {
        return HashSet::new();
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > HEADER_REPEAT_THRESHOLD)
        .map(|(line, _)| line.to_string())
        .collect()
}

fn clean_section(text: &str, repeated: &HashSet<String>) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        if repeated.contains(line.trim()) || is_bare_number(line) {
            continue;
        }
        let line = collapse_spaces(&strip_page_markers(line)).into_owned();
        lines.push(line.trim_end().to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in &lines {
        if line.trim().is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        out.push_str(line);
        blank_run = 0;
    }
    out
}

/// Smart quotes, en/em dashes and non-breaking spaces to ASCII.
pub fn normalize_typography(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            '\u{a0}' => ' ',
            other => other,
        })
        .collect()
}

fn is_bare_number(line: &str) -> bool {
    BARE_NUMBER.is_match(line)
}

/// Remove every page marker (`Page N of M`, `- N -`) from `line`.
fn strip_page_markers(line: &str) -> Cow<'_, str> {
    PAGE_MARKER.replace_all(line, "")
}

fn collapse_spaces(line: &str) -> Cow<'_, str> {
    SPACE_RUN.replace_all(line, " ")
}
