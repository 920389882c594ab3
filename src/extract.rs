//! Per-format text extraction for uploaded documents (PDF, plain text, DOCX, SRT).
//!
//! Each supported format has one [`Extractor`] implementation. The
//! [`ExtractorRegistry`] maps a [`DocumentFormat`] to its extractor, so the
//! chunker dispatches on capability rather than on a type hierarchy.
//! Extraction never panics outward: corrupt input becomes an [`ExtractError`]
//! and the caller skips that file.

use std::collections::HashMap;
use std::io::Read;

use crate::models::{DocumentFormat, Page};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("text is not valid UTF-8: {0}")]
    Encoding(String),
}

/// Turns raw document bytes into pages of plain UTF-8 text.
pub trait Extractor: Send + Sync {
    fn format(&self) -> DocumentFormat;
    fn extract(&self, bytes: &[u8]) -> Result<Vec<Page>, ExtractError>;
}

/// Capability set of extractors keyed by format.
pub struct ExtractorRegistry {
    extractors: HashMap<DocumentFormat, Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Registry with the four built-in formats.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(PdfExtractor));
        registry.register(Box::new(TextExtractor));
        registry.register(Box::new(DocxExtractor));
        registry.register(Box::new(SrtExtractor));
        registry
    }

    /// Register an extractor, replacing any previous one for the same format.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.insert(extractor.format(), extractor);
    }

    pub fn get(&self, format: &DocumentFormat) -> Option<&dyn Extractor> {
        self.extractors.get(format).map(|e| e.as_ref())
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ============ PDF ============

pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
        // pdf-extract panics on some malformed inputs.
        let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
            .map_err(|_| ExtractError::Pdf("parser panicked on malformed input".to_string()))?
            .map_err(|e| ExtractError::Pdf(e.to_string()))?;

        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| Page {
                number: Some(i as u32 + 1),
                text: normalize_newlines(&text),
            })
            .collect())
    }
}

// ============ Plain text ============

pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Text
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ExtractError::Encoding(e.to_string()))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        Ok(vec![Page {
            number: None,
            text: normalize_newlines(text),
        }])
    }
}

// ============ DOCX ============

pub struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Docx
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
        let text = extract_w_paragraphs(&doc_xml)?;
        Ok(vec![Page { number: None, text }])
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Docx(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Docx(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Collect `<w:t>` runs; each `</w:p>` ends a paragraph (blank line), `<w:br/>`
/// is a line break and `<w:tab/>` a space.
fn extract_w_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut paragraph = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(e.to_string()))?;
                paragraph.push_str(&text);
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"br" | b"cr" => paragraph.push('\n'),
                b"tab" => paragraph.push(' '),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let trimmed = paragraph.trim();
                    if !trimmed.is_empty() {
                        if !out.is_empty() {
                            out.push_str("\n\n");
                        }
                        out.push_str(trimmed);
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let trailing = paragraph.trim();
    if !trailing.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(trailing);
    }
    Ok(out)
}

// ============ SRT ============

pub struct SrtExtractor;

impl Extractor for SrtExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Srt
    }

    fn extract(&self, bytes: &[u8]) -> Result<Vec<Page>, ExtractError> {
        let raw = std::str::from_utf8(bytes).map_err(|e| ExtractError::Encoding(e.to_string()))?;
        let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
        Ok(vec![Page {
            number: None,
            text: srt_to_text(&normalize_newlines(raw)),
        }])
    }
}

/// Drop cue numbers, timing lines and inline markup; one paragraph per cue.
fn srt_to_text(raw: &str) -> String {
    let mut cues = Vec::new();
    for block in raw.split("\n\n") {
        let lines: Vec<&str> = block
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter(|l| !l.contains("-->"))
            .filter(|l| !l.chars().all(|c| c.is_ascii_digit()))
            .collect();
        if lines.is_empty() {
            continue;
        }
        let cue = strip_markup(&lines.join(" "));
        let cue = cue.trim();
        if !cue.is_empty() {
            cues.push(cue.to_string());
        }
    }
    cues.join("\n\n")
}

fn strip_markup(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0usize;
    for c in line.chars() {
        match c {
            '<' | '{' => depth += 1,
            '>' | '}' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn registry_has_all_builtin_formats() {
        let registry = ExtractorRegistry::with_defaults();
        for format in [
            DocumentFormat::Pdf,
            DocumentFormat::Text,
            DocumentFormat::Docx,
            DocumentFormat::Srt,
        ] {
            assert!(registry.get(&format).is_some(), "missing {}", format);
        }
        assert!(registry
            .get(&DocumentFormat::Unknown("xlsx".to_string()))
            .is_none());
    }

    #[test]
    fn text_strips_bom_and_crlf() {
        let pages = TextExtractor.extract("\u{feff}one\r\ntwo".as_bytes()).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "one\ntwo");
        assert_eq!(pages[0].number, None);
    }

    #[test]
    fn invalid_utf8_text_is_an_error() {
        let err = TextExtractor.extract(&[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, ExtractError::Encoding(_)));
    }

    /// A PDF with one page per entry of `pages`, each drawing its text.
    fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages.len() as i64,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn pdf_pages_are_numbered_from_one() {
        let bytes = pdf_with_pages(&["Rust engineer", "Speaks German and French"]);
        let pages = PdfExtractor.extract(&bytes).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, Some(1));
        assert_eq!(pages[1].number, Some(2));
        assert!(pages[0].text.contains("Rust engineer"));
        assert!(pages[1].text.contains("German and French"));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = PdfExtractor.extract(b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = DocxExtractor.extract(b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn docx_paragraphs_become_blank_line_separated() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t xml:space=\"preserve\">Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Second</w:t><w:tab/><w:t>para</w:t></w:r></w:p>",
        );
        let pages = DocxExtractor.extract(&bytes).unwrap();
        assert_eq!(pages[0].text, "Hello world\n\nSecond para");
    }

    #[test]
    fn docx_without_document_xml_is_an_error() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = DocxExtractor.extract(&buf).unwrap_err();
        assert!(err.to_string().contains("word/document.xml"));
    }

    #[test]
    fn srt_drops_numbers_timings_and_markup() {
        let srt = "1\r\n00:00:01,000 --> 00:00:03,000\r\n<i>Hello there.</i>\r\n\r\n\
                   2\r\n00:00:04,000 --> 00:00:06,000\r\nGeneral\r\nKenobi!\r\n";
        let pages = SrtExtractor.extract(srt.as_bytes()).unwrap();
        assert_eq!(pages[0].text, "Hello there.\n\nGeneral Kenobi!");
    }

    #[test]
    fn srt_keeps_numeric_words_inside_sentences() {
        let text = srt_to_text("1\n00:00:01,000 --> 00:00:02,000\nI have 20 years\n");
        assert_eq!(text, "I have 20 years");
    }
}
