//! Overlap-aware text chunker.
//!
//! Splits extracted document text into [`Segment`]s of bounded length.
//! A cut prefers, in order: a paragraph break (`\n\n`), a sentence end, any
//! whitespace, and only then a hard cut. Consecutive segments share an
//! overlap of up to `overlap_chars`, snapped to a word boundary, so that
//! context straddling a cut is not lost.
//!
//! Each segment receives a deterministic UUID derived from its document ID
//! and index, plus a SHA-256 hash of its text. Identical input always yields
//! identical output.
//!
//! [`Chunker`] wraps the splitter with per-format extraction and collects
//! per-file failures instead of aborting the batch.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::{FileFailure, RagError};
use crate::extract::ExtractorRegistry;
use crate::models::{DocumentFormat, Page, Segment, SourceFile};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// A cut must land past this fraction of the window to count as a
/// paragraph or sentence boundary; otherwise segments get too short.
const MIN_FILL_DIVISOR: usize = 2;

/// Character budget for the splitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl ChunkingParams {
    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            max_chars: config.max_tokens * CHARS_PER_TOKEN,
            overlap_chars: config.overlap_tokens * CHARS_PER_TOKEN,
        }
    }
}

/// Result of chunking a batch of files.
#[derive(Debug, Default)]
pub struct ChunkOutput {
    pub segments: Vec<Segment>,
    /// Ids of the documents that produced segments, in upload order.
    pub document_names: Vec<String>,
    pub failures: Vec<FileFailure>,
}

/// Extracts and splits uploaded files.
pub struct Chunker {
    registry: ExtractorRegistry,
    params: ChunkingParams,
}

impl Chunker {
    pub fn new(registry: ExtractorRegistry, params: ChunkingParams) -> Self {
        Self { registry, params }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(
            ExtractorRegistry::with_defaults(),
            ChunkingParams::from_config(config),
        )
    }

    /// Chunk a batch of files.
    ///
    /// A file name that appears more than once is superseded by its last
    /// occurrence but keeps its first position in the ordering. A failing
    /// file is recorded in [`ChunkOutput::failures`] and the rest of the
    /// batch continues.
    pub fn chunk(&self, files: &[SourceFile]) -> ChunkOutput {
        let mut order: Vec<&str> = Vec::new();
        for f in files {
            if !order.contains(&f.name.as_str()) {
                order.push(&f.name);
            }
        }

        let mut out = ChunkOutput::default();
        for name in order {
            let Some(file) = files.iter().rev().find(|f| f.name == name) else {
                continue;
            };
            match self.chunk_file(file) {
                Ok(segments) => {
                    debug!(file = %file.name, segments = segments.len(), "chunked document");
                    out.document_names.push(file.name.clone());
                    out.segments.extend(segments);
                }
                Err(e) => {
                    warn!(file = %file.name, error = %e, "skipping file");
                    out.failures.push(FileFailure::from_error(&file.name, &e));
                }
            }
        }
        out
    }

    fn chunk_file(&self, file: &SourceFile) -> Result<Vec<Segment>, RagError> {
        let extractor = match &file.format {
            DocumentFormat::Unknown(_) => None,
            known => self.registry.get(known),
        }
        .ok_or_else(|| RagError::UnsupportedFormat {
            file: file.name.clone(),
            format: file.format.to_string(),
        })?;

        let pages = extractor
            .extract(&file.bytes)
            .map_err(|e| RagError::Extraction {
                file: file.name.clone(),
                reason: e.to_string(),
            })?;

        let segments = chunk_pages(&file.name, &pages, self.params);
        if segments.is_empty() {
            return Err(RagError::Extraction {
                file: file.name.clone(),
                reason: "document contains no extractable text".to_string(),
            });
        }
        Ok(segments)
    }
}

/// Split every page of a document, numbering segments contiguously from 0.
pub fn chunk_pages(document_id: &str, pages: &[Page], params: ChunkingParams) -> Vec<Segment> {
    let mut segments = Vec::new();
    for page in pages {
        for (offset, text) in split_text(&page.text, params) {
            let index = segments.len() as i64;
            segments.push(make_segment(document_id, index, &text, page.number, offset));
        }
    }
    segments
}

/// Split text into `(char offset, text)` pieces. Empty or whitespace-only
/// input yields no pieces.
pub fn split_text(text: &str, params: ChunkingParams) -> Vec<(usize, String)> {
    let max = params.max_chars.max(1);
    let overlap = params.overlap_chars.min(max - 1);
    let len = text.len();

    let mut pieces = Vec::new();
    let mut pos = skip_whitespace(text, 0);

    while pos < len {
        if len - pos <= max {
            push_piece(&mut pieces, text, pos, len);
            break;
        }

        let window_end = floor_char_boundary(text, pos + max);
        let cut = find_cut(text, pos, window_end);
        push_piece(&mut pieces, text, pos, cut);

        let mut next = cut;
        if overlap > 0 {
            let start = floor_char_boundary(text, cut.saturating_sub(overlap).max(pos));
            if let Some(ws) = text[start..cut].find(char::is_whitespace) {
                next = start + ws;
            }
        }
        next = skip_whitespace(text, next);
        if next <= pos {
            next = skip_whitespace(text, cut);
        }
        pos = next;
    }

    pieces
}

fn push_piece(pieces: &mut Vec<(usize, String)>, text: &str, start: usize, end: usize) {
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = raw.len() - raw.trim_start().len();
    let offset = text[..start + lead].chars().count();
    pieces.push((offset, trimmed.to_string()));
}

/// Choose the byte position to cut `text[pos..window_end]` at.
fn find_cut(text: &str, pos: usize, window_end: usize) -> usize {
    let window = &text[pos..window_end];
    let min_fill = window.len() / MIN_FILL_DIVISOR;

    if let Some(i) = window.rfind("\n\n") {
        if i >= min_fill {
            return pos + i;
        }
    }

    let mut sentence_end = None;
    for (i, c) in window.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let after = i + c.len_utf8();
            let next_is_space = window[after..]
                .chars()
                .next()
                .map(char::is_whitespace)
                .unwrap_or(false);
            if next_is_space && after >= min_fill {
                sentence_end = Some(after);
            }
        }
    }
    if let Some(i) = sentence_end {
        return pos + i;
    }

    if let Some(i) = window.rfind(char::is_whitespace) {
        if i > 0 {
            return pos + i;
        }
    }

    // Hard cut; guarantee progress even with a multi-byte first char.
    if window_end > pos {
        window_end
    } else {
        ceil_char_boundary(text, pos + 1)
    }
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

fn floor_char_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn make_segment(
    document_id: &str,
    index: i64,
    text: &str,
    page: Option<u32>,
    offset: usize,
) -> Segment {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}#{}", document_id, index).as_bytes(),
    );

    Segment {
        id: id.to_string(),
        document_id: document_id.to_string(),
        sequence_index: index,
        text: text.to_string(),
        page,
        offset,
        hash,
    }
}
