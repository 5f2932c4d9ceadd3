//! Text extraction for source documents.
//!
//! Each supported format is a [`TextExtractor`]. The format of a file is
//! decided by [`sniff_format`] from its leading bytes first and its extension
//! second, never by trusting the extension alone.
//!
//! | Format | Detection | Extraction |
//! |--------|-----------|------------|
//! | PDF | `%PDF` magic or `.pdf` | `pdf-extract` |
//! | DOCX | ZIP with `word/document.xml` | `<w:t>` runs, one line per paragraph |
//! | PPTX | ZIP with `ppt/slides/` | `<a:t>` runs, slides in order |
//! | Plain text | `.md`/`.txt`/… or valid UTF-8 | as-is |
//!
//! Extraction failures are returned as [`ExtractError`]; the ingestor records
//! them as warnings and moves on to the next document.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported document format")]
    UnsupportedFormat,
    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Pdf,
    Docx,
    Pptx,
}

impl DocumentFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            DocumentFormat::PlainText => "text/plain",
            DocumentFormat::Pdf => "application/pdf",
            DocumentFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            DocumentFormat::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
        }
    }

    pub fn extractor(&self) -> &'static dyn TextExtractor {
        match self {
            DocumentFormat::PlainText => &PlainTextExtractor,
            DocumentFormat::Pdf => &PdfExtractor,
            DocumentFormat::Docx => &DocxExtractor,
            DocumentFormat::Pptx => &PptxExtractor,
        }
    }
}

/// Capability shared by every supported document format.
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError>;
}

/// Decide the format of a document from its content, falling back to the
/// file extension. Returns `None` for binary content nobody can read.
pub fn sniff_format(path: &Path, bytes: &[u8]) -> Option<DocumentFormat> {
    if bytes.starts_with(b"%PDF") {
        return Some(DocumentFormat::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        if let Some(format) = sniff_ooxml(bytes) {
            return Some(format);
        }
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => return Some(DocumentFormat::Pdf),
        Some("docx") => return Some(DocumentFormat::Docx),
        Some("pptx") => return Some(DocumentFormat::Pptx),
        Some("md") | Some("markdown") | Some("txt") | Some("text") | Some("rst") => {
            return Some(DocumentFormat::PlainText)
        }
        _ => {}
    }

    if std::str::from_utf8(bytes).is_ok() {
        Some(DocumentFormat::PlainText)
    } else {
        None
    }
}

fn sniff_ooxml(bytes: &[u8]) -> Option<DocumentFormat> {
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).ok()?;
    let mut names = archive.file_names();
    if names.any(|n| n == "word/document.xml") {
        return Some(DocumentFormat::Docx);
    }
    if archive.file_names().any(|n| n.starts_with("ppt/slides/")) {
        return Some(DocumentFormat::Pptx);
    }
    None
}

/// Sniff and extract in one step.
pub fn extract_document(
    path: &Path,
    bytes: &[u8],
) -> Result<(DocumentFormat, String), ExtractError> {
    let format = sniff_format(path, bytes).ok_or(ExtractError::UnsupportedFormat)?;
    let text = format.extractor().extract_text(bytes)?;
    Ok((format, text))
}

pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ExtractError::Encoding(e.to_string()))?;
        Ok(text.trim_start_matches('\u{feff}').to_string())
    }
}

pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        // pdf-extract panics on some malformed files instead of erroring.
        match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
            Ok(result) => result.map_err(|e| ExtractError::Pdf(e.to_string())),
            Err(_) => Err(ExtractError::Pdf("parser panicked on malformed input".to_string())),
        }
    }
}

pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_zip(bytes)?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
        collect_text_runs(&xml)
    }
}

pub struct PptxExtractor;

impl TextExtractor for PptxExtractor {
    fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_zip(bytes)?;
        let mut slides: Vec<(u32, String)> = archive
            .file_names()
            .filter_map(|name| {
                let number = name
                    .strip_prefix("ppt/slides/slide")?
                    .strip_suffix(".xml")?
                    .parse::<u32>()
                    .ok()?;
                Some((number, name.to_string()))
            })
            .collect();
        slides.sort();

        let mut out = String::new();
        for (_, name) in slides {
            let xml = read_zip_entry_bounded(&mut archive, &name)?;
            let text = collect_text_runs(&xml)?;
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&text);
        }
        Ok(out)
    }
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Concatenate the text of every `<*:t>` element, ending a line at each
/// `<*:p>` paragraph. Works for both WordprocessingML and DrawingML.
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(text)) if in_run => {
                let unescaped = text
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&unescaped);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}
