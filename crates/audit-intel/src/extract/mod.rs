//! Multi-format text extraction for uploaded documents.
//!
//! Supported inputs are PDF, DOCX, PPTX, XLSX, plain text and Markdown.
//! Extraction returns the document text together with a [`Structure`]
//! whose sections carry a citation location (`page 3`, `slide 2`,
//! `sheet Findings`). The chunker uses sections as its first-level split.
//!
//! Extraction is CPU-bound and synchronous; the lifecycle manager runs it
//! on the blocking thread pool.

pub mod clean;
mod office;

use std::path::Path;

use audit_intel_core::models::{Section, Structure};
use audit_intel_core::{Error, Result};

pub use clean::clean_document;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

const EXTENSIONS: &[(&str, &str)] = &[
    ("pdf", MIME_PDF),
    ("docx", MIME_DOCX),
    ("pptx", MIME_PPTX),
    ("xlsx", MIME_XLSX),
    ("txt", MIME_TEXT),
    ("md", MIME_MARKDOWN),
];

/// File extensions the default extractor understands, without the dot.
pub fn supported_extensions() -> impl Iterator<Item = &'static str> {
    EXTENSIONS.iter().map(|(ext, _)| *ext)
}

/// MIME type for a filename, by extension (case-insensitive).
pub fn mime_from_filename(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    EXTENSIONS
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

/// Extracted text and its structural boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    pub structure: Structure,
}

/// Converts raw document bytes into text.
pub trait Extractor: Send + Sync {
    fn extract(&self, bytes: &[u8], mime: &str) -> Result<Extracted>;
}

/// Builds document text section by section, recording offsets.
///
/// Sections are trimmed and joined with a blank line; empty sections are
/// skipped.
#[derive(Debug, Default)]
pub struct StructureBuilder {
    text: String,
    sections: Vec<Section>,
}

impl StructureBuilder {
    pub fn push_section(&mut self, text: &str, location: Option<String>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        let start = self.text.len();
        self.text.push_str(text);
        self.sections.push(Section {
            start,
            end: self.text.len(),
            location,
        });
    }

    pub fn finish(self) -> Extracted {
        Extracted {
            text: self.text,
            structure: Structure {
                sections: self.sections,
            },
        }
    }
}

/// Routes by MIME type to the built-in format readers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl Extractor for DefaultExtractor {
    fn extract(&self, bytes: &[u8], mime: &str) -> Result<Extracted> {
        let mime = mime.split(';').next().unwrap_or_default().trim();
        match mime {
            MIME_PDF => extract_pdf(bytes),
            MIME_DOCX => extract_docx(bytes),
            MIME_PPTX => extract_pptx(bytes),
            MIME_XLSX => extract_xlsx(bytes),
            m if m.starts_with("text/") => extract_text(bytes),
            other => Err(Error::Extraction(format!(
                "unsupported content type: {other}"
            ))),
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted> {
    // pdf-extract panics on some malformed inputs.
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| Error::Extraction("PDF parser panicked".to_string()))?
        .map_err(|e| Error::Extraction(format!("PDF extraction failed: {e}")))?;

    let mut builder = StructureBuilder::default();
    for (i, page) in pages.iter().enumerate() {
        builder.push_section(page, Some(format!("page {}", i + 1)));
    }
    Ok(builder.finish())
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted> {
    let mut builder = StructureBuilder::default();
    for paragraph in office::docx_paragraphs(bytes)? {
        builder.push_section(&paragraph, None);
    }
    Ok(builder.finish())
}

fn extract_pptx(bytes: &[u8]) -> Result<Extracted> {
    let mut builder = StructureBuilder::default();
    for (number, paragraphs) in office::pptx_slides(bytes)? {
        builder.push_section(&paragraphs.join("\n"), Some(format!("slide {number}")));
    }
    Ok(builder.finish())
}

/// Each sheet becomes one section. Rows after the first are rendered as
/// `Header: value | Header: value` using the first row as field names.
fn extract_xlsx(bytes: &[u8]) -> Result<Extracted> {
    let mut builder = StructureBuilder::default();
    for sheet in office::xlsx_sheets(bytes)? {
        let Some((header_row, rows)) = sheet.rows.split_first() else {
            continue;
        };
        let header = |col: usize| {
            header_row
                .iter()
                .find(|(c, _)| *c == col)
                .map(|(_, h)| h.trim())
                .unwrap_or_default()
        };

        let mut lines = vec![format!("Sheet: {}", sheet.name)];
        for row in rows {
            let parts: Vec<String> = row
                .iter()
                .filter(|(_, value)| !value.trim().is_empty())
                .map(|(col, value)| match header(*col) {
                    "" => value.trim().to_string(),
                    h => format!("{h}: {}", value.trim()),
                })
                .collect();
            if !parts.is_empty() {
                lines.push(parts.join(" | "));
            }
        }
        if lines.len() > 1 {
            builder.push_section(&lines.join("\n"), Some(format!("sheet {}", sheet.name)));
        }
    }
    Ok(builder.finish())
}

fn extract_text(bytes: &[u8]) -> Result<Extracted> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Extraction(format!("text is not valid UTF-8: {e}")))?;
    let mut builder = StructureBuilder::default();
    for paragraph in text.split("\n\n") {
        builder.push_section(paragraph, None);
    }
    Ok(builder.finish())
}
