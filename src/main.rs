//! # rag-harness CLI (`rag`)
//!
//! Ingest documents and ask questions about them.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag ingest <FILES>...` | Replace the corpus with the given PDF/TXT/DOCX/SRT files |
//! | `rag ask "<question>"` | Answer a question from the indexed documents |
//! | `rag docs` | List the indexed documents |
//! | `rag usage` | Show the host-key usage counter |
//!
//! ## Examples
//!
//! ```bash
//! rag ingest cv.pdf job-posting.docx --secret "$UPLOAD_SECRET"
//! rag ask "Write a cover letter for this position." \
//!     --about "I have 20 years of experience." --temperature 0.7
//! rag ask "What languages does the applicant speak?" --mode restricted --show-sources
//! ```
//!
//! The host key is read from `OPENAI_API_KEY`. Passing `--api-key` uses the
//! caller's own key instead, which does not count towards usage.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use rag_harness::config::{self, Config};
use rag_harness::logging;
use rag_harness::models::SourceFile;
use rag_harness::pipeline::{AnswerRequest, IngestRequest, PipelineController};
use rag_harness::retrieval::{compose_question, PromptMode, SourceScope};

const HOST_KEY_ENV: &str = "OPENAI_API_KEY";

/// Retrieval-augmented question answering over uploaded documents.
#[derive(Parser)]
#[command(name = "rag", version, about)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the corpus with the given documents.
    ///
    /// Unsupported or unreadable files are reported and skipped; the rest
    /// are indexed. Uploading a name twice keeps the last copy.
    Ingest {
        /// Files to ingest (.pdf, .txt, .docx, .srt).
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Upload secret, required when `auth.upload_secret` is configured.
        #[arg(long)]
        secret: Option<String>,

        /// Use this provider key instead of the host's.
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Answer a question from the indexed documents.
    Ask {
        /// The request or question.
        question: String,

        /// Instructions prepended to the question.
        #[arg(long)]
        instructions: Option<String>,

        /// Information about yourself, added after the instructions.
        #[arg(long)]
        about: Option<String>,

        /// `restricted` answers only from the documents; `unrestricted`
        /// may also use general knowledge.
        #[arg(long, default_value = "unrestricted")]
        mode: String,

        /// Sampling temperature, 0.0 to 2.0. Defaults to `generation.temperature`.
        #[arg(long)]
        temperature: Option<f32>,

        /// Number of segments to retrieve. Defaults to `retrieval.top_k`.
        #[arg(short)]
        k: Option<usize>,

        /// Print the cited segments after the answer.
        #[arg(long)]
        show_sources: bool,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,

        /// Use this provider key instead of the host's.
        #[arg(long)]
        api_key: Option<String>,
    },

    /// List the indexed documents.
    Docs,

    /// Show how many documents were ingested with the host's key.
    Usage,
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    let _log_guard = logging::init(&cfg)?;

    let controller = PipelineController::open(cfg)
        .await
        .context("Failed to open the pipeline")?
        .with_host_key(std::env::var(HOST_KEY_ENV).ok());

    match cli.command {
        Commands::Ingest {
            files,
            secret,
            api_key,
        } => {
            let files = files
                .iter()
                .map(|p| SourceFile::read(p).with_context(|| format!("Failed to read {}", p.display())))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let report = controller
                .ingest(IngestRequest {
                    files,
                    api_key,
                    secret,
                })
                .await?;

            println!(
                "Ingested {} document(s), {} segment(s).",
                report.document_names.len(),
                report.segments
            );
            for failure in &report.failures {
                println!("  skipped {}: {}", failure.file, failure.error);
            }
        }
        Commands::Ask {
            question,
            instructions,
            about,
            mode,
            temperature,
            k,
            show_sources,
            json,
            api_key,
        } => {
            let prompt_mode: PromptMode = mode.parse()?;
            let result = controller
                .answer(AnswerRequest {
                    question: compose_question(instructions.as_deref(), about.as_deref(), &question),
                    prompt_mode,
                    source_scope: SourceScope::UploadedDocuments,
                    api_key,
                    temperature,
                    k,
                })
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.result);
                if show_sources {
                    println!();
                    println!("Sources:");
                    for (i, doc) in result.source_documents.iter().enumerate() {
                        let page = doc
                            .page
                            .map(|p| format!(" (p. {})", p))
                            .unwrap_or_default();
                        println!("{}. {}{}  [score: {:.2}]", i + 1, doc.document_id, page, doc.score);
                        println!("   {}", doc.text.replace('\n', " "));
                    }
                }
            }
        }
        Commands::Docs => {
            let names = controller.document_names().await;
            if names.is_empty() {
                println!("No documents uploaded yet.");
            } else {
                println!("Uploaded documents:");
                for (i, name) in names.iter().enumerate() {
                    println!("{}. {}", i + 1, name);
                }
            }
        }
        Commands::Usage => {
            println!("{}", controller.usage_counter());
        }
    }

    Ok(())
}
