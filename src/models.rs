//! Core data models used throughout the pipeline.
//!
//! These types represent the uploaded files, segments, and answers that flow
//! through ingestion and retrieval.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Document format, derived from the upload's file extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentFormat {
    Pdf,
    Text,
    Docx,
    Srt,
    /// Any other extension. Carried through so the chunker can reject it by name.
    Unknown(String),
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => DocumentFormat::Pdf,
            "txt" => DocumentFormat::Text,
            "docx" => DocumentFormat::Docx,
            "srt" => DocumentFormat::Srt,
            other => DocumentFormat::Unknown(other.to_string()),
        }
    }

    pub fn from_file_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        Self::from_extension(ext)
    }

    pub fn extension(&self) -> &str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Text => "txt",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Srt => "srt",
            DocumentFormat::Unknown(ext) => ext,
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentFormat::Unknown(ext) if ext.is_empty() => write!(f, "(no extension)"),
            other => write!(f, "{}", other.extension()),
        }
    }
}

/// A file handed to the pipeline for ingestion.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Document identifier; the upload's file name.
    pub name: String,
    pub bytes: Vec<u8>,
    pub format: DocumentFormat,
}

impl SourceFile {
    /// Build a source file, declaring its format from the name's extension.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let format = DocumentFormat::from_file_name(&name);
        Self {
            name,
            bytes,
            format,
        }
    }

    /// Read a file from disk, using its file name as the document id.
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, bytes))
    }
}

/// A page of extracted text. Formats without pages produce a single page
/// with `number = None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: Option<u32>,
    pub text: String,
}

/// A bounded span of extracted text with provenance; the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub document_id: String,
    pub sequence_index: i64,
    pub text: String,
    pub page: Option<u32>,
    /// Character offset of the segment start within its page text.
    pub offset: usize,
    pub hash: String,
}

/// A segment with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSegment {
    pub segment: Segment,
    pub score: f32,
}

/// A cited segment, in the shape returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDocument {
    pub text: String,
    pub document_id: String,
    pub page: Option<u32>,
    pub offset: usize,
    pub score: f32,
}

impl From<&ScoredSegment> for SourceDocument {
    fn from(s: &ScoredSegment) -> Self {
        Self {
            text: s.segment.text.clone(),
            document_id: s.segment.document_id.clone(),
            page: s.segment.page,
            offset: s.segment.offset,
            score: s.score,
        }
    }
}

/// The answer to a question plus the segments it was grounded on.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub result: String,
    pub source_documents: Vec<SourceDocument>,
}
