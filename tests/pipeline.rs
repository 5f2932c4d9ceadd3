//! End-to-end tests of the library: build, persist, reload, retrieve, answer.

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use docqa::chat::{ChatOrchestrator, ChatSession, TurnState};
use docqa::config::{parse_config, Config};
use docqa::embedding::{self, EmbeddingService};
use docqa::error::ErrorKind;
use docqa::generate::{AnswerGenerator, BackendError, GenerationBackend, RetryPolicy};
use docqa::index::{IndexHandle, VectorIndex};
use docqa::ingest::{self, BuildStatus};
use docqa::models::Message;
use docqa::prompt::{ContextAssembler, Prompt, PromptBudget};
use docqa::retrieve::Retriever;

const QUESTION: &str = "What is the capital of France?";

fn corpus() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("france.txt"), "Paris is the capital of France.").unwrap();
    fs::write(docs.join("japan.txt"), "Tokyo is the capital of Japan.").unwrap();
    let config = config_for(tmp.path());
    (tmp, config)
}

fn config_for(root: &Path) -> Config {
    parse_config(&format!(
        r#"
[documents]
root = "{root}/docs"

[index]
path = "{root}/data/index.sqlite"
"#,
        root = root.display()
    ))
    .unwrap()
}

fn embedder(config: &Config) -> Arc<EmbeddingService> {
    let backend = embedding::create_backend(&config.embedding, None).unwrap();
    Arc::new(EmbeddingService::new(backend, &config.embedding))
}

/// Answers with the first line of reference material it was given.
struct QuotingBackend {
    prompts: Arc<Mutex<Vec<Prompt>>>,
}

#[async_trait]
impl GenerationBackend for QuotingBackend {
    fn name(&self) -> &str {
        "quoting"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let quoted = prompt
            .system
            .lines()
            .skip_while(|l| !l.starts_with("[source:"))
            .nth(1)
            .unwrap_or("I don't know.");
        Ok(format!("According to the documents: {}", quoted))
    }
}

fn orchestrator(
    config: &Config,
    index: Arc<IndexHandle>,
) -> (ChatOrchestrator, Arc<Mutex<Vec<Prompt>>>) {
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let generator = AnswerGenerator::new(
        Box::new(QuotingBackend {
            prompts: Arc::clone(&prompts),
        }),
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(5),
        },
    );
    let orchestrator = ChatOrchestrator::new(
        Retriever::new(embedder(config), index),
        ContextAssembler::from_config(&config.prompt),
        generator,
        PromptBudget::from(&config.prompt),
        config.retrieval.top_k,
    );
    (orchestrator, prompts)
}

#[tokio::test]
async fn test_capital_of_france_scenario() {
    let (_tmp, config) = corpus();
    let report = ingest::run_build(&config, &embedder(&config)).await.unwrap();
    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(report.entries, 2);

    let handle = Arc::new(IndexHandle::open(&config.index.path).await);
    let retriever = Retriever::new(embedder(&config), Arc::clone(&handle));
    let result = retriever.retrieve(QUESTION, 4).await.unwrap();
    assert_eq!(result.hits[0].entry.text, "Paris is the capital of France.");
    assert_eq!(result.hits[0].entry.source, "france.txt");

    let prompt = ContextAssembler::default()
        .assemble(QUESTION, &result, &[], &PromptBudget::from(&config.prompt))
        .unwrap();
    let text = prompt.render();
    let paris = text.find("Paris is the capital of France.").unwrap();
    let query = text.rfind(QUESTION).unwrap();
    assert!(paris < query);
}

#[tokio::test]
async fn test_chat_endpoint_answers_from_documents() {
    let (_tmp, config) = corpus();
    ingest::run_build(&config, &embedder(&config)).await.unwrap();
    let handle = Arc::new(IndexHandle::open(&config.index.path).await);
    let (orchestrator, prompts) = orchestrator(&config, handle);

    let reply = orchestrator
        .respond(&[Message::user(QUESTION)])
        .await
        .unwrap();
    assert_eq!(
        reply,
        Message::assistant("According to the documents: Paris is the capital of France.")
    );
    assert_eq!(prompts.lock().unwrap()[0].chunks_used, 2);
}

#[tokio::test]
async fn test_persisted_index_answers_like_built_index() {
    let (_tmp, config) = corpus();
    let service = embedder(&config);
    let (built, _) = ingest::build_index(&config, &service).await.unwrap();
    built.persist(&config.index.path).await.unwrap();
    let loaded = VectorIndex::load(&config.index.path).await.unwrap();

    for probe in [QUESTION, "Tokyo Japan", "capital", "unrelated words entirely"] {
        let vector = service.embed(probe).await.unwrap().vector;
        assert_eq!(built.search(&vector, 2), loaded.search(&vector, 2));
    }
}

#[tokio::test]
async fn test_reload_swaps_in_rebuilt_index() {
    let (tmp, config) = corpus();
    let service = embedder(&config);
    ingest::run_build(&config, &service).await.unwrap();
    let handle = Arc::new(IndexHandle::open(&config.index.path).await);
    let (orchestrator, _) = orchestrator(&config, Arc::clone(&handle));

    let before = handle.snapshot().unwrap();
    assert_eq!(before.len(), 2);

    fs::write(
        tmp.path().join("docs/italy.txt"),
        "Rome is the capital of Italy.",
    )
    .unwrap();
    ingest::run_build(&config, &service).await.unwrap();
    handle.reload(&config.index.path).await.unwrap();

    assert_eq!(before.len(), 2);
    assert_eq!(handle.snapshot().unwrap().len(), 3);

    let reply = orchestrator
        .respond(&[Message::user("What is the capital of Italy?")])
        .await
        .unwrap();
    assert!(reply.content.contains("Rome"));
}

#[tokio::test]
async fn test_missing_index_fails_turn_without_touching_history() {
    let (_tmp, config) = corpus();
    let handle = Arc::new(IndexHandle::open(&config.index.path).await);
    let (orchestrator, prompts) = orchestrator(&config, handle);

    let mut session = ChatSession::new();
    let err = orchestrator.turn(&mut session, QUESTION).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::IndexUnavailable);
    assert_eq!(session.state(), TurnState::Failed);
    assert!(session.conversation().is_empty());
    assert!(prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_corpus_answers_without_context() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("docs")).unwrap();
    let config = config_for(tmp.path());
    let report = ingest::run_build(&config, &embedder(&config)).await.unwrap();
    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(report.entries, 0);

    let handle = Arc::new(IndexHandle::open(&config.index.path).await);
    let (orchestrator, prompts) = orchestrator(&config, handle);
    let reply = orchestrator
        .respond(&[Message::user(QUESTION)])
        .await
        .unwrap();
    assert_eq!(reply.content, "According to the documents: I don't know.");
    assert_eq!(prompts.lock().unwrap()[0].chunks_used, 0);
}
