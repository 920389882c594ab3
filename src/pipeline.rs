//! Pipeline controller: owns one corpus and sequences ingestion and
//! question answering over it.
//!
//! # State
//!
//! ```text
//! Empty ──ingest──▶ Ingesting ──ok──▶ Ready ◀──▶ Querying
//!                       │                ▲
//!                       └──err──▶ previous state
//! ```
//!
//! The index sits behind a `tokio::sync::RwLock`. `ingest` holds the write
//! lock from embedding through persistence and swap, so ingests run one at a
//! time and answers wait for them. `answer` holds a read lock; any number of
//! answers may run concurrently.
//!
//! # Retries
//!
//! Providers never retry. The controller wraps each provider call in a
//! [`RetryPolicy`], which retries only errors that classify as retryable
//! (rate limits, timeouts, provider 5xx) with exponential backoff.
//!
//! # Usage counter
//!
//! Ingests whose embeddings were paid for by the host's key add the number
//! of ingested documents to a counter. The increment is written in the same
//! transaction as the snapshot it belongs to.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::chunk::Chunker;
use crate::config::{Config, EmbeddingConfig, GenerationConfig};
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::{FileFailure, RagError, Result};
use crate::generation::{create_language_model, validate_temperature, GenerationClient, LanguageModel};
use crate::index::{build_snapshot, EmbeddingIndex};
use crate::models::{QueryResult, SourceFile};
use crate::retrieval::{PromptMode, RetrievalChain, SourceScope};
use crate::store::IndexStore;

/// Exponent cap for the backoff multiplier.
const MAX_BACKOFF_EXPONENT: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

const PHASE_EMPTY: u8 = 0;
const PHASE_INGESTING: u8 = 1;
const PHASE_READY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Empty,
    Ingesting,
    Ready,
    Querying,
}

/// Who pays for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// The operator's key (`OPENAI_API_KEY`); its usage is counted.
    Host,
    /// A key the caller supplied with the request.
    User,
}

// ============ Retry ============

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based): `base × 2^attempt`,
    /// exponent capped at 5.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.min(MAX_BACKOFF_EXPONENT))
    }

    /// Run `op`, retrying retryable failures up to `max_retries` times.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient provider error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Embedding provider decorator that applies a [`RetryPolicy`] to each call.
struct RetryingEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
}

#[async_trait]
impl EmbeddingProvider for RetryingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.policy.run("embedding", || self.inner.embed(texts)).await
    }
}

// ============ Providers ============

/// Binds providers to an API key. The seam tests use to inject fakes.
pub trait ProviderFactory: Send + Sync {
    fn embedder(&self, api_key: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>>;
    fn language_model(&self, api_key: Option<&str>) -> Result<Arc<dyn LanguageModel>>;

    /// Whether the embedder spends the key it is given. Usage is only
    /// counted when it does.
    fn embedder_uses_key(&self) -> bool {
        true
    }
}

/// Providers built from configuration.
pub struct ConfiguredProviders {
    embedding: EmbeddingConfig,
    generation: GenerationConfig,
}

impl ConfiguredProviders {
    pub fn new(config: &Config) -> Self {
        Self {
            embedding: config.embedding.clone(),
            generation: config.generation.clone(),
        }
    }
}

impl ProviderFactory for ConfiguredProviders {
    fn embedder(&self, api_key: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>> {
        create_embedder(&self.embedding, api_key)
    }
    fn language_model(&self, api_key: Option<&str>) -> Result<Arc<dyn LanguageModel>> {
        create_language_model(&self.generation, api_key)
    }
    fn embedder_uses_key(&self) -> bool {
        self.embedding.requires_key()
    }
}

// ============ Requests ============

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub files: Vec<SourceFile>,
    /// Caller-supplied key; the host key is used when absent.
    pub api_key: Option<String>,
    /// Upload secret, checked when one is configured.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_names: Vec<String>,
    pub segments: usize,
    pub failures: Vec<FileFailure>,
    /// Whose key paid for the embeddings; `None` when no key was spent.
    pub key_source: Option<KeySource>,
    pub usage_counter: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub question: String,
    pub prompt_mode: PromptMode,
    pub source_scope: SourceScope,
    pub api_key: Option<String>,
    /// Falls back to `generation.temperature`.
    pub temperature: Option<f32>,
    /// Falls back to `retrieval.top_k`.
    pub k: Option<usize>,
}

impl AnswerRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }
}

/// Per-question settings resolved against configuration. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuerySession {
    pub prompt_mode: PromptMode,
    pub source_scope: SourceScope,
    pub temperature: f32,
    pub k: usize,
}

// ============ Controller ============

pub struct PipelineController {
    config: Config,
    chunker: Arc<Chunker>,
    retrieval: RetrievalChain,
    factory: Arc<dyn ProviderFactory>,
    store: IndexStore,
    index: RwLock<EmbeddingIndex>,
    phase: AtomicU8,
    active_queries: AtomicUsize,
    usage: AtomicU64,
    host_api_key: Option<String>,
    embedding_retry: RetryPolicy,
    generation_retry: RetryPolicy,
}

impl PipelineController {
    /// Open a controller with providers built from `config`, restoring the
    /// index persisted at `index.path`.
    pub async fn open(config: Config) -> Result<Self> {
        let factory = Arc::new(ConfiguredProviders::new(&config));
        Self::with_factory(config, factory).await
    }

    pub async fn with_factory(config: Config, factory: Arc<dyn ProviderFactory>) -> Result<Self> {
        let store = if config.index.in_memory {
            IndexStore::in_memory().await?
        } else {
            IndexStore::open(&config.index.path).await?
        };

        let index = store
            .load()
            .await?
            .map(EmbeddingIndex::from_snapshot)
            .unwrap_or_default();
        let usage = store.usage_count().await?;

        if !index.is_empty() {
            info!(
                documents = index.document_names().len(),
                segments = index.snapshot().len(),
                model = index.snapshot().model(),
                "restored persisted index"
            );
        }

        let phase = if index.is_empty() { PHASE_EMPTY } else { PHASE_READY };
        Ok(Self {
            chunker: Arc::new(Chunker::from_config(&config.chunking)),
            retrieval: RetrievalChain::from_config(&config.retrieval),
            embedding_retry: RetryPolicy::new(config.embedding.max_retries, DEFAULT_BASE_DELAY),
            generation_retry: RetryPolicy::new(config.generation.max_retries, DEFAULT_BASE_DELAY),
            config,
            factory,
            store,
            index: RwLock::new(index),
            phase: AtomicU8::new(phase),
            active_queries: AtomicUsize::new(0),
            usage: AtomicU64::new(usage),
            host_api_key: None,
        })
    }

    /// Set the operator's key, used whenever a request carries none.
    pub fn with_host_key(mut self, key: Option<String>) -> Self {
        self.host_api_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_retry_policies(mut self, embedding: RetryPolicy, generation: RetryPolicy) -> Self {
        self.embedding_retry = embedding;
        self.generation_retry = generation;
        self
    }

    pub fn state(&self) -> PipelineState {
        match self.phase.load(Ordering::SeqCst) {
            PHASE_INGESTING => PipelineState::Ingesting,
            PHASE_READY if self.active_queries.load(Ordering::SeqCst) > 0 => PipelineState::Querying,
            PHASE_READY => PipelineState::Ready,
            _ => PipelineState::Empty,
        }
    }

    /// Names of the indexed documents, in ingestion order.
    pub async fn document_names(&self) -> Vec<String> {
        self.index.read().await.document_names().to_vec()
    }

    pub fn usage_counter(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    fn resolve_key(&self, supplied: Option<&str>) -> (Option<String>, Option<KeySource>) {
        match supplied.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => (Some(key.to_string()), Some(KeySource::User)),
            None => {
                let source = self.host_api_key.as_ref().map(|_| KeySource::Host);
                (self.host_api_key.clone(), source)
            }
        }
    }

    fn check_secret(&self, supplied: Option<&str>) -> Result<()> {
        match &self.config.auth.upload_secret {
            Some(expected) if !secrets_match(expected, supplied.unwrap_or("")) => {
                warn!("upload rejected: wrong secret");
                Err(RagError::auth("upload secret does not match"))
            }
            _ => Ok(()),
        }
    }

    /// Replace the corpus with the documents in `request.files`.
    ///
    /// Files that cannot be read are reported in the result's `failures`
    /// while the rest are indexed. When no file yields any text the error
    /// is [`RagError::NoUsableDocuments`] and the current index stays.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport> {
        self.check_secret(request.secret.as_deref())?;
        if request.files.is_empty() {
            return Err(RagError::invalid("files", "no files to ingest"));
        }

        let (api_key, key_source) = self.resolve_key(request.api_key.as_deref());
        let key_source = key_source.filter(|_| self.factory.embedder_uses_key());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(RetryingEmbedder {
            inner: self.factory.embedder(api_key.as_deref())?,
            policy: self.embedding_retry,
        });

        let chunker = Arc::clone(&self.chunker);
        let files = request.files;
        let output = tokio::task::spawn_blocking(move || chunker.chunk(&files))
            .await
            .map_err(|e| RagError::Internal(format!("chunking task failed: {}", e)))?;

        if output.segments.is_empty() {
            return Err(RagError::NoUsableDocuments {
                failures: output.failures,
            });
        }

        let mut index = self.index.write().await;
        let previous = self.phase.swap(PHASE_INGESTING, Ordering::SeqCst);
        let mut phase = PhaseGuard {
            phase: &self.phase,
            settle: previous,
        };

        let segment_count = output.segments.len();
        let snapshot =
            build_snapshot(embedder.as_ref(), output.segments, &output.document_names).await?;
        let usage_increment = match key_source {
            Some(KeySource::Host) => output.document_names.len() as u64,
            _ => 0,
        };
        let usage_counter = self.store.save(&snapshot, usage_increment).await?;

        // Nothing below can fail.
        index.configure(embedder);
        index.replace(snapshot);
        self.usage.store(usage_counter, Ordering::SeqCst);
        phase.settle = PHASE_READY;

        info!(
            documents = ?output.document_names,
            segments = segment_count,
            failed = output.failures.len(),
            usage_counter,
            "ingest complete"
        );

        Ok(IngestReport {
            document_names: output.document_names,
            segments: segment_count,
            failures: output.failures,
            key_source,
            usage_counter,
        })
    }

    fn session(&self, request: &AnswerRequest) -> Result<QuerySession> {
        let temperature = request
            .temperature
            .unwrap_or(self.config.generation.temperature);
        validate_temperature(temperature)?;
        let k = request.k.unwrap_or(self.config.retrieval.top_k);
        if k == 0 {
            return Err(RagError::invalid("k", "must be >= 1"));
        }
        Ok(QuerySession {
            prompt_mode: request.prompt_mode,
            source_scope: request.source_scope,
            temperature,
            k,
        })
    }

    /// Answer a question from the indexed documents.
    pub async fn answer(&self, request: AnswerRequest) -> Result<QueryResult> {
        let session = self.session(&request)?;

        let index = self.index.read().await;
        if index.is_empty() {
            return Err(RagError::NotReady);
        }
        let _query = QueryGuard::enter(&self.active_queries);

        let (api_key, key_source) = self.resolve_key(request.api_key.as_deref());
        let embedder = RetryingEmbedder {
            inner: self.factory.embedder(api_key.as_deref())?,
            policy: self.embedding_retry,
        };
        let model = self.factory.language_model(api_key.as_deref())?;
        debug!(?session, ?key_source, model = model.model_name(), "answering question");

        let payload = self
            .retrieval
            .retrieve_and_compose(
                &index,
                &embedder,
                &request.question,
                session.k,
                session.prompt_mode,
                session.source_scope,
            )
            .await?;

        let client = GenerationClient::new(model, self.config.generation.max_tokens);
        let result = self
            .generation_retry
            .run("generation", || client.generate(&payload, session.temperature))
            .await?;

        info!(
            cited = result.source_documents.len(),
            mode = %session.prompt_mode,
            "question answered"
        );
        Ok(result)
    }
}

/// Restores the phase on every exit path, including cancellation.
struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
    settle: u8,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(self.settle, Ordering::SeqCst);
    }
}

struct QueryGuard<'a>(&'a AtomicUsize);

impl<'a> QueryGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Compare secrets in constant time by comparing fixed-length MACs of both.
fn secrets_match(expected: &str, supplied: &str) -> bool {
    let mac = |value: &str| {
        Hmac::<Sha256>::new_from_slice(b"rag-harness upload secret").map(|mut m| {
            m.update(value.as_bytes());
            m
        })
    };
    match (mac(expected), mac(supplied)) {
        (Ok(expected), Ok(supplied)) => supplied
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(3200));
        assert_eq!(policy.delay(9), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn retries_only_retryable_errors() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let calls = AtomicU32::new(0);
        let result = policy
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RagError::RateLimit {
                        message: "slow down".to_string(),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RagError::auth("bad key"))
            })
            .await;
        assert!(matches!(result, Err(RagError::Authentication { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RagError::RateLimit {
                    message: "still busy".to_string(),
                })
            })
            .await;
        assert!(matches!(result, Err(RagError::RateLimit { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("hunter2", "hunter2"));
        assert!(!secrets_match("hunter2", "hunter3"));
        assert!(!secrets_match("hunter2", ""));
        assert!(!secrets_match("hunter2", "hunter2 "));
    }

    #[test]
    fn answer_request_defaults() {
        let request = AnswerRequest::new("why?");
        assert_eq!(request.prompt_mode, PromptMode::Unrestricted);
        assert_eq!(request.source_scope, SourceScope::UploadedDocuments);
        assert!(request.temperature.is_none());
    }
}
