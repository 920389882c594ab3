//! Retrieval chain: fetch the best segments for a question and compose the
//! prompt handed to the language model.
//!
//! The prompt mode decides how much the model may rely on its own knowledge:
//!
//! | Mode | System prompt |
//! |------|---------------|
//! | [`PromptMode::Restricted`] | answer only from the context, otherwise reply with [`INSUFFICIENT_CONTEXT_REPLY`] |
//! | [`PromptMode::Unrestricted`] | context offered as support, general knowledge allowed |
//!
//! In restricted mode an empty retrieval still produces a prompt, with an
//! explicit "no relevant context" block, so the insufficiency is stated to
//! the model rather than left for it to guess.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index::EmbeddingIndex;
use crate::models::ScoredSegment;

/// Fixed reply the model is told to give when the context is insufficient.
pub const INSUFFICIENT_CONTEXT_REPLY: &str =
    "The uploaded documents do not contain enough information to answer this question.";

/// Context block used when retrieval found nothing.
pub const NO_CONTEXT_BLOCK: &str = "(no relevant context was found in the uploaded documents)";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    Restricted,
    #[default]
    Unrestricted,
}

impl FromStr for PromptMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "restricted" => Ok(PromptMode::Restricted),
            "unrestricted" => Ok(PromptMode::Unrestricted),
            other => Err(RagError::invalid(
                "prompt_mode",
                format!("'{}' is not one of restricted, unrestricted", other),
            )),
        }
    }
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptMode::Restricted => write!(f, "restricted"),
            PromptMode::Unrestricted => write!(f, "unrestricted"),
        }
    }
}

/// Where retrieval may look for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SourceScope {
    /// Only the documents ingested into this corpus.
    #[default]
    UploadedDocuments,
}

/// A composed prompt plus the segments it cites.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPayload {
    pub system: String,
    pub user: String,
    pub cited: Vec<ScoredSegment>,
    pub mode: PromptMode,
}

#[derive(Debug, Clone)]
pub struct RetrievalChain {
    min_score: f32,
}

impl RetrievalChain {
    pub fn new(min_score: f32) -> Self {
        Self { min_score }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(config.min_score)
    }

    /// Retrieve the `k` best segments for `question` and compose the prompt.
    pub async fn retrieve_and_compose(
        &self,
        index: &EmbeddingIndex,
        embedder: &dyn EmbeddingProvider,
        question: &str,
        k: usize,
        mode: PromptMode,
        scope: SourceScope,
    ) -> Result<PromptPayload> {
        if question.trim().is_empty() {
            return Err(RagError::invalid("question", "must not be empty"));
        }

        let hits = match scope {
            SourceScope::UploadedDocuments => index.search_with(embedder, question, k).await?,
        };
        let retrieved = hits.len();
        let cited: Vec<ScoredSegment> = hits
            .into_iter()
            .filter(|h| h.score >= self.min_score)
            .collect();

        debug!(
            retrieved,
            cited = cited.len(),
            mode = %mode,
            "context retrieved"
        );
        Ok(compose(question, cited, mode))
    }
}

/// Build the prompt for `question` over already-retrieved segments.
pub fn compose(question: &str, cited: Vec<ScoredSegment>, mode: PromptMode) -> PromptPayload {
    let context = if cited.is_empty() {
        NO_CONTEXT_BLOCK.to_string()
    } else {
        cited
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{}] {}\n{}", i + 1, citation_label(s), s.segment.text))
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR)
    };

    let system = match mode {
        PromptMode::Restricted => format!(
            "You answer questions using only the context taken from the user's documents. \
             Do not use any other knowledge. If the context does not contain the answer, \
             reply exactly with: \"{}\"",
            INSUFFICIENT_CONTEXT_REPLY
        ),
        PromptMode::Unrestricted => "You are a helpful assistant. Use the context taken from the \
             user's documents where it is relevant; you may also draw on general knowledge."
            .to_string(),
    };

    let user = format!("Context:\n{}\n\nQuestion: {}", context, question.trim());

    PromptPayload {
        system,
        user,
        cited,
        mode,
    }
}

fn citation_label(s: &ScoredSegment) -> String {
    match s.segment.page {
        Some(page) => format!("{} (page {})", s.segment.document_id, page),
        None => s.segment.document_id.clone(),
    }
}

/// Join free-form instructions, information about the user, and the actual
/// request into one question, skipping blank parts.
pub fn compose_question(instructions: Option<&str>, about: Option<&str>, request: &str) -> String {
    [instructions, about, Some(request)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
