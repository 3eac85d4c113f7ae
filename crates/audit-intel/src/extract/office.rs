//! OOXML (docx, pptx, xlsx) readers.
//!
//! Each format is a ZIP archive of XML parts. Parts are read with a size cap
//! (zip-bomb protection) and streamed through `quick-xml`; only text runs
//! and the paragraph/row boundaries around them are kept.

use std::io::Read;

use quick_xml::events::Event;
use quick_xml::Reader;

use audit_intel_core::{Error, Result};

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn ooxml(err: impl std::fmt::Display) -> Error {
    Error::Extraction(format!("OOXML extraction failed: {err}"))
}

fn open(bytes: &[u8]) -> Result<Archive<'_>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(ooxml)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entry names `{prefix}N.xml`, sorted by N.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .filter(|n| !n[prefix.len()..].contains('/'))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collect the text of every `<*:p>` paragraph: `<*:t>` runs concatenated,
/// `<*:tab/>` as a tab and `<*:br/>` as a newline. Empty paragraphs are
/// skipped.
fn paragraphs(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                current.push_str(&te.unescape().map_err(ooxml)?);
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    let text = current.trim();
                    if !text.is_empty() {
                        out.push(text.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    Ok(out)
}

/// Paragraphs of `word/document.xml`.
pub fn docx_paragraphs(bytes: &[u8]) -> Result<Vec<String>> {
    let mut archive = open(bytes)?;
    if archive.index_for_name("word/document.xml").is_none() {
        return Err(ooxml("word/document.xml not found"));
    }
    let xml = read_entry(&mut archive, "word/document.xml")?;
    paragraphs(&xml)
}

/// `(slide number, paragraphs)` for every slide, in slide order.
pub fn pptx_slides(bytes: &[u8]) -> Result<Vec<(usize, Vec<String>)>> {
    let mut archive = open(bytes)?;
    let names = numbered_entries(&archive, "ppt/slides/slide");
    let mut slides = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let xml = read_entry(&mut archive, name)?;
        slides.push((i + 1, paragraphs(&xml)?));
    }
    Ok(slides)
}

/// One worksheet: its name and rows of `(column index, cell text)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<(usize, String)>>,
}

/// Every worksheet with its cell text; shared, inline and literal values.
pub fn xlsx_sheets(bytes: &[u8]) -> Result<Vec<Sheet>> {
    let mut archive = open(bytes)?;
    let shared = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let names = if archive.index_for_name("xl/workbook.xml").is_some() {
        sheet_names(&read_entry(&mut archive, "xl/workbook.xml")?)?
    } else {
        Vec::new()
    };

    let entries = numbered_entries(&archive, "xl/worksheets/sheet");
    let mut sheets = Vec::new();
    for (idx, entry) in entries.iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_entry(&mut archive, entry)?;
        sheets.push(Sheet {
            name: names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("{}", idx + 1)),
            rows: sheet_rows(&xml, &shared)?,
        });
    }
    Ok(sheets)
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => current.push_str(&te.unescape().map_err(ooxml)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_names(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut names = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"name" {
                        names.push(attr.unescape_value().map_err(ooxml)?.into_owned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

/// Zero-based column index of a cell reference such as `"C7"`.
fn column_index(reference: &[u8]) -> Option<usize> {
    let mut col = 0usize;
    let mut seen = false;
    for &b in reference {
        if b.is_ascii_alphabetic() {
            col = col * 26 + (b.to_ascii_uppercase() - b'A' + 1) as usize;
            seen = true;
        } else {
            break;
        }
    }
    seen.then(|| col - 1)
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<(usize, String)>>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<(usize, String)> = Vec::new();
    let mut cell_type = Vec::new();
    let mut cell_col = 0usize;
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_type.clear();
                    cell_col = row.last().map(|(c, _)| c + 1).unwrap_or(0);
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"t" => cell_type = attr.value.to_vec(),
                            b"r" => {
                                if let Some(col) = column_index(&attr.value) {
                                    cell_col = col;
                                }
                            }
                            _ => {}
                        }
                    }
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => value.push_str(&te.unescape().map_err(ooxml)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let raw = value.trim();
                    let text = match cell_type.as_slice() {
                        b"s" => raw.parse::<usize>().ok().and_then(|i| shared.get(i)).cloned(),
                        b"b" => Some(if raw == "1" { "TRUE" } else { "FALSE" }.to_string()),
                        _ => Some(raw.to_string()),
                    };
                    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                        row.push((cell_col, text.trim().to_string()));
                        cells += 1;
                    }
                }
                b"row" => {
                    if !row.is_empty() {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row);
    }
    Ok(rows)
}
