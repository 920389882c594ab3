//! End-to-end tests of the pipeline controller with in-process providers.
//!
//! The fake embedder wraps the hashing embedder; the fake language model
//! echoes which prompt policy it was given and which document ranked first,
//! so tests can assert on retrieval and prompt composition through the
//! public `answer` API.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use rag_harness::config::Config;
use rag_harness::embedding::{EmbeddingProvider, HashingEmbedder};
use rag_harness::generation::{CompletionRequest, LanguageModel};
use rag_harness::models::SourceFile;
use rag_harness::pipeline::{
    AnswerRequest, IngestRequest, KeySource, PipelineController, PipelineState, ProviderFactory,
    RetryPolicy,
};
use rag_harness::retrieval::{PromptMode, INSUFFICIENT_CONTEXT_REPLY, NO_CONTEXT_BLOCK};
use rag_harness::{ErrorClass, RagError, Result};

const LANGUAGES: &str = "The applicant speaks German, English and French fluently.";
const TALK: &str = "1\n00:00:01,000 --> 00:00:04,000\nWelcome to the sailing course.\n\n\
                    2\n00:00:05,000 --> 00:00:08,000\nToday we learn <i>knots</i>.\n";
const INVOICES: &str = "Invoices are due within thirty days of delivery.";

struct Fakes {
    embedder: HashingEmbedder,
    embed_calls: AtomicUsize,
    /// Number of upcoming embed calls that fail with a rate limit.
    rate_limited: AtomicUsize,
    reject_embeddings: AtomicBool,
    completions: Mutex<Vec<CompletionRequest>>,
    keys: Mutex<Vec<Option<String>>>,
    /// Pause answers inside the language model until `release`.
    gated: AtomicBool,
    /// Pause ingests inside the embedder until `release`.
    gate_embeddings: AtomicBool,
    entered: Notify,
    release: Notify,
    spends_key: AtomicBool,
}

impl Fakes {
    fn new(dims: usize) -> Arc<Self> {
        Arc::new(Self {
            embedder: HashingEmbedder::new(dims),
            embed_calls: AtomicUsize::new(0),
            rate_limited: AtomicUsize::new(0),
            reject_embeddings: AtomicBool::new(false),
            completions: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
            gated: AtomicBool::new(false),
            gate_embeddings: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
            spends_key: AtomicBool::new(true),
        })
    }

    fn completion_count(&self) -> usize {
        self.completions.lock().unwrap().len()
    }
}

struct FakeEmbedder(Arc<Fakes>);

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        self.0.embedder.model_name()
    }
    fn dims(&self) -> usize {
        self.0.embedder.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.0.embed_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.gate_embeddings.load(Ordering::SeqCst) {
            self.0.entered.notify_one();
            self.0.release.notified().await;
        }
        if self.0.reject_embeddings.load(Ordering::SeqCst) {
            return Err(RagError::Authentication {
                message: "key revoked".to_string(),
            });
        }
        let limited = self.0.rate_limited.load(Ordering::SeqCst);
        if limited > 0 {
            self.0.rate_limited.store(limited - 1, Ordering::SeqCst);
            return Err(RagError::RateLimit {
                message: "too many requests".to_string(),
            });
        }
        self.0.embedder.embed(texts).await
    }
}

struct EchoModel(Arc<Fakes>);

#[async_trait]
impl LanguageModel for EchoModel {
    fn model_name(&self) -> &str {
        "echo"
    }
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.0.completions.lock().unwrap().push(request.clone());
        if self.0.gated.load(Ordering::SeqCst) {
            self.0.entered.notify_one();
            self.0.release.notified().await;
        }
        let restricted = request.system.contains(INSUFFICIENT_CONTEXT_REPLY);
        if restricted && request.user.contains(NO_CONTEXT_BLOCK) {
            return Ok(INSUFFICIENT_CONTEXT_REPLY.to_string());
        }
        let top = request.user.lines().nth(1).unwrap_or_default();
        let policy = if restricted { "restricted" } else { "unrestricted" };
        Ok(format!("{} | {}", policy, top))
    }
}

struct FakeFactory(Arc<Fakes>);

impl ProviderFactory for FakeFactory {
    fn embedder(&self, api_key: Option<&str>) -> Result<Arc<dyn EmbeddingProvider>> {
        self.0.keys.lock().unwrap().push(api_key.map(str::to_string));
        Ok(Arc::new(FakeEmbedder(self.0.clone())))
    }
    fn language_model(&self, _api_key: Option<&str>) -> Result<Arc<dyn LanguageModel>> {
        Ok(Arc::new(EchoModel(self.0.clone())))
    }
    fn embedder_uses_key(&self) -> bool {
        self.0.spends_key.load(Ordering::SeqCst)
    }
}

/// Configuration with a private in-memory index.
fn memory_config() -> Config {
    let mut config = Config::default();
    config.index.in_memory = true;
    config
}

fn file_config(path: PathBuf) -> Config {
    let mut config = Config::default();
    config.index.path = path;
    config
}

async fn controller_with(config: Config, fakes: &Arc<Fakes>) -> PipelineController {
    PipelineController::with_factory(config, Arc::new(FakeFactory(fakes.clone())))
        .await
        .unwrap()
        .with_retry_policies(RetryPolicy::none(), RetryPolicy::none())
}

fn text(name: &str, body: &str) -> SourceFile {
    SourceFile::new(name, body.as_bytes().to_vec())
}

fn upload(files: Vec<SourceFile>) -> IngestRequest {
    IngestRequest {
        files,
        ..Default::default()
    }
}

async fn ready_controller(fakes: &Arc<Fakes>) -> PipelineController {
    let controller = controller_with(memory_config(), fakes).await;
    controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES), text("talk.srt", TALK)]))
        .await
        .unwrap();
    controller
}

#[tokio::test]
async fn answer_before_ingest_is_not_ready() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes).await;
    assert_eq!(controller.state(), PipelineState::Empty);

    let err = controller
        .answer(AnswerRequest::new("anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::NotReady));
    assert_eq!(err.class(), ErrorClass::InvalidInput);
    assert_eq!(fakes.completion_count(), 0);
}

#[tokio::test]
async fn ingest_indexes_supported_files_and_reports_the_rest() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes).await;

    let report = controller
        .ingest(upload(vec![
            text("cv.txt", LANGUAGES),
            text("budget.xlsx", "a,b,c"),
            text("talk.srt", TALK),
        ]))
        .await
        .unwrap();

    assert_eq!(report.document_names, vec!["cv.txt", "talk.srt"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].file, "budget.xlsx");
    assert!(report.failures[0].unsupported);
    assert_eq!(controller.state(), PipelineState::Ready);
    assert_eq!(controller.document_names().await, vec!["cv.txt", "talk.srt"]);
}

#[tokio::test]
async fn answer_cites_the_most_relevant_document() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;

    let result = controller
        .answer(AnswerRequest::new(
            "Which languages does the applicant speak fluently?",
        ))
        .await
        .unwrap();

    assert_eq!(result.result, "unrestricted | [1] cv.txt");
    assert_eq!(result.source_documents[0].document_id, "cv.txt");
    assert!(result.source_documents[0].text.contains("French"));
    assert_eq!(controller.state(), PipelineState::Ready);
}

#[tokio::test]
async fn srt_cues_are_indexed_without_timings() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;

    let mut request = AnswerRequest::new("sailing course knots");
    request.k = Some(1);
    let result = controller.answer(request).await.unwrap();

    assert_eq!(result.source_documents.len(), 1);
    let cited = &result.source_documents[0];
    assert_eq!(cited.document_id, "talk.srt");
    assert!(cited.text.contains("Today we learn knots."));
    assert!(!cited.text.contains("-->"));
}

#[tokio::test]
async fn reingest_replaces_the_whole_corpus() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;

    controller
        .ingest(upload(vec![text("terms.txt", INVOICES)]))
        .await
        .unwrap();
    assert_eq!(controller.document_names().await, vec!["terms.txt"]);

    let mut request = AnswerRequest::new("Which languages does the applicant speak?");
    request.k = Some(10);
    let result = controller.answer(request).await.unwrap();
    assert!(result
        .source_documents
        .iter()
        .all(|d| d.document_id == "terms.txt"));
}

#[tokio::test]
async fn unusable_batch_leaves_index_untouched() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;

    let err = controller
        .ingest(upload(vec![text("sheet.xlsx", "x"), text("blank.txt", "  \n ")]))
        .await
        .unwrap_err();

    match err {
        RagError::NoUsableDocuments { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].unsupported);
            assert!(!failures[1].unsupported);
        }
        other => panic!("expected NoUsableDocuments, got {:?}", other),
    }
    assert_eq!(controller.document_names().await, vec!["cv.txt", "talk.srt"]);
    assert_eq!(controller.state(), PipelineState::Ready);
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes).await;
    let err = controller.ingest(upload(Vec::new())).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidParameter { .. }));
}

#[tokio::test]
async fn failed_embedding_keeps_previous_index() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;

    fakes.reject_embeddings.store(true, Ordering::SeqCst);
    let err = controller
        .ingest(upload(vec![text("terms.txt", INVOICES)]))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Authentication { .. }));
    assert_eq!(controller.state(), PipelineState::Ready);
    assert_eq!(controller.document_names().await, vec!["cv.txt", "talk.srt"]);

    fakes.reject_embeddings.store(false, Ordering::SeqCst);
    assert!(controller
        .answer(AnswerRequest::new("languages"))
        .await
        .is_ok());
}

#[tokio::test]
async fn restricted_mode_declines_without_relevant_context() {
    let fakes = Fakes::new(512);
    let mut config = memory_config();
    config.retrieval.min_score = 0.5;
    let controller = controller_with(config, &fakes).await;
    controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
        .await
        .unwrap();

    let mut request = AnswerRequest::new("What is the boiling point of mercury?");
    request.prompt_mode = PromptMode::Restricted;
    let result = controller.answer(request).await.unwrap();

    assert_eq!(result.result, INSUFFICIENT_CONTEXT_REPLY);
    assert!(result.source_documents.is_empty());
    let sent = fakes.completions.lock().unwrap().last().cloned().unwrap();
    assert!(sent.system.contains(INSUFFICIENT_CONTEXT_REPLY));
    assert!(sent.user.contains(NO_CONTEXT_BLOCK));
}

#[tokio::test]
async fn unrestricted_mode_does_not_carry_the_restriction() {
    let fakes = Fakes::new(512);
    let mut config = memory_config();
    config.retrieval.min_score = 0.5;
    let controller = controller_with(config, &fakes).await;
    controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
        .await
        .unwrap();

    let result = controller
        .answer(AnswerRequest::new("What is the boiling point of mercury?"))
        .await
        .unwrap();
    assert_eq!(result.result, format!("unrestricted | {}", NO_CONTEXT_BLOCK));
}

#[tokio::test]
async fn temperature_is_validated_before_any_provider_call() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;
    let embeds_before = fakes.embed_calls.load(Ordering::SeqCst);

    let mut request = AnswerRequest::new("languages");
    request.temperature = Some(2.1);
    let err = controller.answer(request).await.unwrap_err();
    assert!(matches!(err, RagError::InvalidParameter { .. }));
    assert_eq!(fakes.embed_calls.load(Ordering::SeqCst), embeds_before);
    assert_eq!(fakes.completion_count(), 0);

    for t in [0.0, 2.0] {
        let mut request = AnswerRequest::new("languages");
        request.temperature = Some(t);
        controller.answer(request).await.unwrap();
    }
    let temperatures: Vec<f32> = fakes
        .completions
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.temperature)
        .collect();
    assert_eq!(temperatures, vec![0.0, 2.0]);
}

#[tokio::test]
async fn zero_k_is_invalid() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;
    let mut request = AnswerRequest::new("languages");
    request.k = Some(0);
    assert!(matches!(
        controller.answer(request).await,
        Err(RagError::InvalidParameter { .. })
    ));
}

#[tokio::test]
async fn identical_questions_get_identical_results() {
    let fakes = Fakes::new(512);
    let controller = ready_controller(&fakes).await;

    let first = controller
        .answer(AnswerRequest::new("sailing"))
        .await
        .unwrap();
    let second = controller
        .answer(AnswerRequest::new("sailing"))
        .await
        .unwrap();
    assert_eq!(first.result, second.result);
    assert_eq!(first.source_documents, second.source_documents);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_answers_share_the_index() {
    let fakes = Fakes::new(512);
    let controller = Arc::new(ready_controller(&fakes).await);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let controller = controller.clone();
        tasks.spawn(async move {
            controller
                .answer(AnswerRequest::new("Which languages does the applicant speak?"))
                .await
        });
    }

    let mut answers = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        answers.push(joined.unwrap().unwrap().result);
    }
    assert_eq!(answers.len(), 8);
    assert!(answers.iter().all(|a| a == &answers[0]));
    assert_eq!(fakes.completion_count(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_reports_querying_while_an_answer_is_in_flight() {
    let fakes = Fakes::new(512);
    let controller = Arc::new(ready_controller(&fakes).await);
    fakes.gated.store(true, Ordering::SeqCst);

    let task = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.answer(AnswerRequest::new("sailing")).await })
    };
    fakes.entered.notified().await;
    assert_eq!(controller.state(), PipelineState::Querying);

    fakes.release.notify_one();
    task.await.unwrap().unwrap();
    assert_eq!(controller.state(), PipelineState::Ready);
}

#[tokio::test]
async fn upload_secret_gates_ingest() {
    let fakes = Fakes::new(512);
    let mut config = memory_config();
    config.auth.upload_secret = Some("s3cret".to_string());
    let controller = controller_with(config, &fakes).await;

    for secret in [None, Some("wrong")] {
        let mut request = upload(vec![text("cv.txt", LANGUAGES)]);
        request.secret = secret.map(str::to_string);
        let err = controller.ingest(request).await.unwrap_err();
        assert!(matches!(err, RagError::Authentication { .. }));
    }
    assert_eq!(fakes.embed_calls.load(Ordering::SeqCst), 0);
    assert_eq!(controller.state(), PipelineState::Empty);

    let mut request = upload(vec![text("cv.txt", LANGUAGES)]);
    request.secret = Some("s3cret".to_string());
    controller.ingest(request).await.unwrap();
    assert_eq!(controller.state(), PipelineState::Ready);
}

#[tokio::test]
async fn usage_counts_only_host_key_ingests() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes)
        .await
        .with_host_key(Some("sk-host".to_string()));

    let report = controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES), text("talk.srt", TALK)]))
        .await
        .unwrap();
    assert_eq!(report.key_source, Some(KeySource::Host));
    assert_eq!(report.usage_counter, 2);

    let mut request = upload(vec![text("terms.txt", INVOICES)]);
    request.api_key = Some("sk-user".to_string());
    let report = controller.ingest(request).await.unwrap();
    assert_eq!(report.key_source, Some(KeySource::User));
    assert_eq!(report.usage_counter, 2);
    assert_eq!(controller.usage_counter(), 2);

    let keys = fakes.keys.lock().unwrap().clone();
    assert_eq!(
        keys,
        vec![Some("sk-host".to_string()), Some("sk-user".to_string())]
    );
}

#[tokio::test]
async fn rate_limited_embeddings_are_retried() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes)
        .await
        .with_retry_policies(
            RetryPolicy::new(3, Duration::from_millis(1)),
            RetryPolicy::none(),
        );

    fakes.rate_limited.store(2, Ordering::SeqCst);
    controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
        .await
        .unwrap();
    assert_eq!(fakes.embed_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_surfaces_without_retries() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes).await;

    fakes.rate_limited.store(1, Ordering::SeqCst);
    let err = controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::RateLimit { .. }));
    assert!(err.is_retryable());
    assert_eq!(controller.state(), PipelineState::Empty);
}

#[tokio::test]
async fn persisted_index_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let config = file_config(tmp.path().join("data").join("index.sqlite"));

    let fakes = Fakes::new(512);
    {
        let controller = controller_with(config.clone(), &fakes)
            .await
            .with_host_key(Some("sk-host".to_string()));
        controller
            .ingest(upload(vec![text("cv.txt", LANGUAGES), text("talk.srt", TALK)]))
            .await
            .unwrap();
    }

    let reopened = controller_with(config, &fakes).await;
    assert_eq!(reopened.state(), PipelineState::Ready);
    assert_eq!(reopened.document_names().await, vec!["cv.txt", "talk.srt"]);
    assert_eq!(reopened.usage_counter(), 2);

    let result = reopened
        .answer(AnswerRequest::new(
            "Which languages does the applicant speak fluently?",
        ))
        .await
        .unwrap();
    assert_eq!(result.source_documents[0].document_id, "cv.txt");
}

#[tokio::test]
async fn changed_embedding_model_fails_fast() {
    let tmp = TempDir::new().unwrap();
    let config = file_config(tmp.path().join("index.sqlite"));

    {
        let controller = controller_with(config.clone(), &Fakes::new(512)).await;
        controller
            .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
            .await
            .unwrap();
    }

    let other = Fakes::new(128);
    let reopened = controller_with(config, &other).await;
    let err = reopened
        .answer(AnswerRequest::new("languages"))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::IndexMismatch { .. }));
    assert_eq!(err.class(), ErrorClass::Internal);
    assert_eq!(other.completion_count(), 0);
}

#[tokio::test]
async fn usage_ignores_ingests_without_a_spent_host_key() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes).await;
    let report = controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
        .await
        .unwrap();
    assert_eq!(report.key_source, None);
    assert_eq!(report.usage_counter, 0);

    let offline = Fakes::new(512);
    offline.spends_key.store(false, Ordering::SeqCst);
    let controller = controller_with(memory_config(), &offline)
        .await
        .with_host_key(Some("sk-host".to_string()));
    let report = controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES)]))
        .await
        .unwrap();
    assert_eq!(report.key_source, None);
    assert_eq!(controller.usage_counter(), 0);
}

#[tokio::test]
async fn failed_usage_write_keeps_previous_corpus() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("index.sqlite");
    let fakes = Fakes::new(512);
    let controller = controller_with(file_config(path.clone()), &fakes)
        .await
        .with_host_key(Some("sk-host".to_string()));
    controller
        .ingest(upload(vec![text("cv.txt", LANGUAGES), text("talk.srt", TALK)]))
        .await
        .unwrap();

    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_usage BEFORE UPDATE ON meta WHEN NEW.key = 'usage_count' \
         BEGIN SELECT RAISE(ABORT, 'usage write rejected'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = controller
        .ingest(upload(vec![text("terms.txt", INVOICES)]))
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Storage(_)));
    assert_eq!(controller.state(), PipelineState::Ready);
    assert_eq!(controller.document_names().await, vec!["cv.txt", "talk.srt"]);
    assert_eq!(controller.usage_counter(), 2);

    sqlx::query("DROP TRIGGER reject_usage")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
    drop(controller);

    let reopened = controller_with(file_config(path), &fakes).await;
    assert_eq!(reopened.document_names().await, vec!["cv.txt", "talk.srt"]);
    assert_eq!(reopened.usage_counter(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ingest_blocks_answers_until_the_new_corpus_is_in_place() {
    let fakes = Fakes::new(512);
    let controller = Arc::new(ready_controller(&fakes).await);
    fakes.gate_embeddings.store(true, Ordering::SeqCst);

    let ingest = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .ingest(upload(vec![text("terms.txt", INVOICES)]))
                .await
        })
    };
    fakes.entered.notified().await;
    assert_eq!(controller.state(), PipelineState::Ingesting);

    let answer = {
        let controller = controller.clone();
        tokio::spawn(async move {
            let mut request = AnswerRequest::new("When are invoices due after delivery?");
            request.k = Some(10);
            controller.answer(request).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!answer.is_finished());
    assert_eq!(fakes.completion_count(), 0);

    fakes.gate_embeddings.store(false, Ordering::SeqCst);
    fakes.release.notify_one();

    ingest.await.unwrap().unwrap();
    let result = answer.await.unwrap().unwrap();
    assert!(!result.source_documents.is_empty());
    assert!(result
        .source_documents
        .iter()
        .all(|d| d.document_id == "terms.txt"));
    assert_eq!(controller.state(), PipelineState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ingests_run_one_after_another() {
    let fakes = Fakes::new(512);
    let controller = Arc::new(ready_controller(&fakes).await);
    fakes.gate_embeddings.store(true, Ordering::SeqCst);

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .ingest(upload(vec![text("terms.txt", INVOICES)]))
                .await
        })
    };
    fakes.entered.notified().await;
    let embeds_while_first_holds_the_index = fakes.embed_calls.load(Ordering::SeqCst);

    let second = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.ingest(upload(vec![text("talk.srt", TALK)])).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished());
    assert_eq!(
        fakes.embed_calls.load(Ordering::SeqCst),
        embeds_while_first_holds_the_index
    );

    fakes.gate_embeddings.store(false, Ordering::SeqCst);
    fakes.release.notify_one();

    assert_eq!(first.await.unwrap().unwrap().document_names, vec!["terms.txt"]);
    assert_eq!(second.await.unwrap().unwrap().document_names, vec!["talk.srt"]);
    assert_eq!(controller.document_names().await, vec!["talk.srt"]);
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

#[tokio::test]
async fn resume_and_posting_then_resume_alone() {
    let fakes = Fakes::new(512);
    let controller = controller_with(memory_config(), &fakes).await;
    let resume = SourceFile::new(
        "resume.pdf",
        pdf_with_pages(&[
            "Jane Doe. Senior Rust engineer with ten years of systems experience.",
            "Languages: German, English and French.",
        ]),
    );
    let posting = text(
        "posting.txt",
        "We are hiring a backend developer in Berlin to build payment services.",
    );

    let report = controller
        .ingest(upload(vec![resume.clone(), posting]))
        .await
        .unwrap();
    assert_eq!(report.document_names, vec!["resume.pdf", "posting.txt"]);
    assert!(report.failures.is_empty());

    let mut request = AnswerRequest::new("Languages German English French");
    request.k = Some(1);
    let result = controller.answer(request).await.unwrap();
    let cited = &result.source_documents[0];
    assert_eq!(cited.document_id, "resume.pdf");
    assert_eq!(cited.page, Some(2));
    assert!(cited.text.contains("French"));

    let mut request = AnswerRequest::new("hiring backend developer Berlin payment services");
    request.k = Some(1);
    let result = controller.answer(request).await.unwrap();
    assert_eq!(result.source_documents[0].document_id, "posting.txt");

    controller.ingest(upload(vec![resume])).await.unwrap();
    assert_eq!(controller.document_names().await, vec!["resume.pdf"]);

    let mut request = AnswerRequest::new("Senior Rust engineer hiring in Berlin");
    request.k = Some(10);
    let result = controller.answer(request).await.unwrap();
    assert!(!result.source_documents.is_empty());
    assert!(result
        .source_documents
        .iter()
        .all(|d| d.document_id == "resume.pdf"));
}
