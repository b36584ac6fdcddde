//! Text extraction for the file formats a knowledge source may point at.
//!
//! Binary and structured parsing is delegated to format crates; this module
//! only turns their output into normalized plain text suitable for chunking,
//! remembering where each page or table row starts.

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::{Cursor, Read};
use std::path::Path;

/// Maximum file size accepted for extraction (50MB)
pub const MAX_DOCUMENT_SIZE: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Json,
    Csv,
    Xlsx,
    Pdf,
    Docx,
}

impl DocumentFormat {
    /// Detect format from the file extension; unknown extensions are treated as plain text
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "md" | "markdown" => Self::Markdown,
            "html" | "htm" => Self::Html,
            "json" => Self::Json,
            "csv" => Self::Csv,
            "xlsx" | "xlsm" => Self::Xlsx,
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            _ => Self::PlainText,
        }
    }

    /// Detect format of a fetched document from its Content-Type header
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => Self::Html,
            "application/json" => Self::Json,
            "text/csv" => Self::Csv,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Self::Xlsx,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Self::Docx
            }
            "application/pdf" => Self::Pdf,
            "text/markdown" => Self::Markdown,
            _ => Self::PlainText,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "text",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }
}

/// Start of a located part of a document, such as a PDF page or a table row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMark {
    /// Metadata key the unit is reported under: `page`, `sheet` or `row`
    pub key: &'static str,
    /// 1-based number within the document
    pub number: usize,
    /// Character offset of the unit in the normalized text
    pub char_start: usize,
}

/// Normalized document text and the units it was assembled from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub units: Vec<UnitMark>,
}

impl ExtractedText {
    fn plain(raw: &str) -> Self {
        Self {
            text: normalize_text(raw),
            units: Vec::new(),
        }
    }
}

/// Joins located parts, normalizing each one and skipping the empty ones
#[derive(Default)]
struct UnitText {
    text: String,
    chars: usize,
    units: Vec<UnitMark>,
}

impl UnitText {
    fn push(&mut self, labels: &[(&'static str, usize)], raw: &str, separator: &str) {
        let part = normalize_text(raw);
        if part.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push_str(separator);
            self.chars += separator.chars().count();
        }
        for (key, number) in labels {
            self.units.push(UnitMark {
                key: *key,
                number: *number,
                char_start: self.chars,
            });
        }
        self.text.push_str(&part);
        self.chars += part.chars().count();
    }

    fn finish(self) -> ExtractedText {
        ExtractedText {
            text: self.text,
            units: self.units,
        }
    }
}

/// Unix newlines, no NULs, no surrounding whitespace
pub fn normalize_text(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\0', "")
        .trim()
        .to_string()
}

/// Reject files over [`MAX_DOCUMENT_SIZE`] before reading them
pub fn check_document_size(size: u64) -> Result<()> {
    if size > MAX_DOCUMENT_SIZE {
        anyhow::bail!(
            "document too large: {:.1} MB (max {:.1} MB)",
            size as f64 / (1024.0 * 1024.0),
            MAX_DOCUMENT_SIZE as f64 / (1024.0 * 1024.0)
        );
    }
    Ok(())
}

/// Extract normalized text from raw document bytes
pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> Result<ExtractedText> {
    check_document_size(bytes.len() as u64)?;

    match format {
        DocumentFormat::PlainText | DocumentFormat::Markdown => {
            Ok(ExtractedText::plain(&decode_utf8(bytes)?))
        }
        DocumentFormat::Html => Ok(ExtractedText::plain(&html_to_text(&decode_utf8(bytes)?)?)),
        DocumentFormat::Json => Ok(ExtractedText::plain(&json_to_text(&decode_utf8(bytes)?)?)),
        DocumentFormat::Csv => csv_to_text(&decode_utf8(bytes)?),
        DocumentFormat::Xlsx => xlsx_to_text(bytes),
        DocumentFormat::Pdf => pdf_to_text(bytes),
        DocumentFormat::Docx => Ok(ExtractedText::plain(&docx_to_text(bytes)?)),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes).context("Document is not valid UTF-8")?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
}

pub fn html_to_text(html: &str) -> Result<String> {
    html2text::from_read(html.as_bytes(), 120).context("Failed to convert HTML to text")
}

/// Flatten JSON into `path: value` lines
pub fn json_to_text(json: &str) -> Result<String> {
    let value: Value = serde_json::from_str(json).context("Invalid JSON document")?;
    let mut lines = Vec::new();
    flatten_json(&value, String::new(), &mut lines);
    Ok(lines.join("\n"))
}

fn flatten_json(value: &Value, path: String, lines: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten_json(child, child_path, lines);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_json(child, format!("{}[{}]", path, i), lines);
            }
        }
        Value::String(s) if path.is_empty() => lines.push(s.clone()),
        Value::String(s) => lines.push(format!("{}: {}", path, s)),
        other if path.is_empty() => lines.push(other.to_string()),
        other => lines.push(format!("{}: {}", path, other)),
    }
}

/// `header: cell` pairs for one table row; `None` for a blank row
fn table_row<S: AsRef<str>>(header: &[String], cells: &[S]) -> Option<String> {
    if cells.iter().all(|cell| cell.as_ref().trim().is_empty()) {
        return None;
    }
    let line = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| match header.get(i) {
            Some(name) if !name.is_empty() => format!("{}: {}", name, cell.as_ref()),
            _ => cell.as_ref().to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ");
    Some(line)
}

/// One line per data row, each cell prefixed by its header. Rows are numbered
/// as in a spreadsheet, the header being row 1.
pub fn csv_to_text(csv: &str) -> Result<ExtractedText> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(csv.as_bytes());

    let header: Vec<String> = reader
        .headers()
        .context("Invalid CSV header")?
        .iter()
        .map(|name| name.trim().to_string())
        .collect();

    let mut parts = UnitText::default();
    for (i, record) in reader.records().enumerate() {
        let record = record.context("Invalid CSV record")?;
        let cells: Vec<&str> = record.iter().collect();
        if let Some(line) = table_row(&header, &cells) {
            parts.push(&[("row", i + 2)], &line, "\n");
        }
    }
    Ok(parts.finish())
}

/// Every worksheet as a `Sheet: <name>` heading followed by header-keyed rows
pub fn xlsx_to_text(bytes: &[u8]) -> Result<ExtractedText> {
    use calamine::{Reader, Xlsx};

    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes)).context("Failed to open XLSX workbook")?;

    let mut parts = UnitText::default();
    for (sheet_index, name) in workbook.sheet_names().into_iter().enumerate() {
        let sheet = sheet_index + 1;
        let range = workbook
            .worksheet_range(&name)
            .with_context(|| format!("Failed to read sheet '{}'", name))?;
        let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);

        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            continue;
        };
        let header: Vec<String> = header
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect();

        parts.push(&[("sheet", sheet)], &format!("Sheet: {}", name), "\n\n");
        for (i, row) in rows.enumerate() {
            let cells: Vec<String> = row.iter().map(|cell| cell.to_string()).collect();
            if let Some(line) = table_row(&header, &cells) {
                parts.push(&[("sheet", sheet), ("row", first_row + i + 2)], &line, "\n");
            }
        }
    }
    Ok(parts.finish())
}

/// Page texts joined by blank lines, each page marked
pub fn pdf_to_text(bytes: &[u8]) -> Result<ExtractedText> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .context("Failed to extract PDF text")?;

    let mut parts = UnitText::default();
    for (i, page) in pages.iter().enumerate() {
        parts.push(&[("page", i + 1)], page, "\n\n");
    }
    Ok(parts.finish())
}

/// Paragraph text from word/document.xml inside the DOCX archive
pub fn docx_to_text(bytes: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to read DOCX as ZIP")?;

    let mut doc_xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("Invalid DOCX: missing word/document.xml")?
        .read_to_string(&mut doc_xml)
        .context("Failed to read document.xml")?;

    let mut reader = quick_xml::Reader::from_str(&doc_xml);
    let mut paragraphs = Vec::new();
    let mut paragraph = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event().context("DOCX XML parse error")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"p" => paragraph.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"tab" {
                    paragraph.push('\t');
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"p" => {
                    if !paragraph.trim().is_empty() {
                        paragraphs.push(std::mem::take(&mut paragraph));
                    }
                }
                b"t" => in_text = false,
                _ => {}
            },
            Event::Text(e) if in_text => paragraph.push_str(&String::from_utf8_lossy(&e)),
            Event::GeneralRef(e) if in_text => {
                let entity = match &*e {
                    b"amp" => "&",
                    b"lt" => "<",
                    b"gt" => ">",
                    b"quot" => "\"",
                    b"apos" => "'",
                    _ => "",
                };
                paragraph.push_str(entity);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(paragraphs.join("\n\n"))
}
