//! End-to-end tests over the library API with deterministic mock
//! collaborators: a token-hash embedder (shared tokens raise cosine
//! similarity) and a canned generator. No network, no model runtime.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use corpus_qa::classify::HeuristicClassifier;
use corpus_qa::config::{
    ChunkingConfig, Config, EmbeddingConfig, FewshotConfig, GenerationConfig,
    KnowledgeBaseConfig, RetrievalConfig, ServerConfig, SessionConfig, StorageConfig,
    UpdatePolicy,
};
use corpus_qa::embedding::Embedder;
use corpus_qa::fewshot;
use corpus_qa::generation::{GenerateOptions, Generator};
use corpus_qa::ingest::scan_knowledge_base;
use corpus_qa::rank::tokenize;
use corpus_qa::router::{AnswerMode, AnswerStatus, QaEngine, NO_ANSWER_TEXT};
use corpus_qa::store::KnowledgeStore;

const DIMS: usize = 128;

// ============ Mock collaborators ============

/// Deterministic embedder: each token maps to a pseudo-random unit
/// vector, texts sum their tokens and normalize. Texts sharing tokens
/// land close in cosine space.
struct MockEmbedder {
    queries: Mutex<Vec<String>>,
}

impl MockEmbedder {
    fn new() -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
        }
    }

    fn recorded(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

fn token_vector(token: &str) -> Vec<f32> {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    token.hash(&mut hasher);
    let mut seed = hasher.finish();
    (0..DIMS)
        .map(|_| {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((seed >> 32) as u32 as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}

fn embed_text(text: &str) -> Vec<f32> {
    let mut acc = vec![0.0f32; DIMS];
    for token in tokenize(text) {
        for (a, t) in acc.iter_mut().zip(token_vector(&token)) {
            *a += t;
        }
    }
    let norm: f32 = acc.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for a in acc.iter_mut() {
            *a /= norm;
        }
    }
    acc
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn model_identity(&self) -> &str {
        "mock-embed-v1"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.queries.lock().unwrap().push(text.to_string());
        Ok(embed_text(text))
    }
}

/// Embedder that always fails, for exercising collaborator-error paths.
struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_identity(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding backend unreachable")
    }
}

/// Generator returning a fixed response and counting invocations.
struct MockGenerator {
    response: String,
    calls: AtomicUsize,
}

impl MockGenerator {
    fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

// ============ Harness ============

fn test_config(data_dir: PathBuf, kbs: Vec<KnowledgeBaseConfig>) -> Config {
    Config {
        storage: StorageConfig {
            data_dir,
            update_policy: UpdatePolicy::Append,
        },
        chunking: ChunkingConfig {
            max_chunk_size: 600,
            overlap_size: 0,
        },
        retrieval: RetrievalConfig {
            min_similarity: 0.3,
            relevance_threshold: 0.38,
            ..RetrievalConfig::default()
        },
        fewshot: FewshotConfig::default(),
        embedding: EmbeddingConfig {
            provider: "ollama".to_string(),
            model: "mock-embed-v1".to_string(),
            dims: DIMS,
            url: None,
            batch_size: 64,
            max_retries: 0,
            timeout_secs: 5,
        },
        generation: GenerationConfig::default(),
        session: SessionConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
        knowledge_bases: kbs,
    }
}

fn kb_config(name: &str, docs_root: PathBuf) -> KnowledgeBaseConfig {
    KnowledgeBaseConfig {
        name: name.to_string(),
        docs_root,
        examples_root: None,
        include_globs: vec!["**/*.md".to_string(), "**/*.txt".to_string()],
        exclude_globs: Vec::new(),
    }
}

struct Fixture {
    _tmp: TempDir,
    config: Config,
    docs_root: PathBuf,
}

fn fixture(kb_name: &str) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let docs_root = tmp.path().join("docs");
    std::fs::create_dir_all(&docs_root).unwrap();
    let data_dir = tmp.path().join("data");
    let config = test_config(data_dir, vec![kb_config(kb_name, docs_root.clone())]);
    Fixture {
        _tmp: tmp,
        config,
        docs_root,
    }
}

async fn open_store(config: &Config, kb_name: &str) -> KnowledgeStore {
    KnowledgeStore::open(kb_name, &config.storage.data_dir, config.chunking.clone())
        .await
        .unwrap()
}

async fn fts_row_count(store: &KnowledgeStore) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

async fn all_chunk_ids(store: &KnowledgeStore) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM chunks ORDER BY id")
        .fetch_all(store.pool())
        .await
        .unwrap()
}

// ============ Retrieval and routing ============

#[tokio::test]
async fn direct_qa_shortcut_answers_verbatim_without_generation() {
    let fx = fixture("support");
    std::fs::write(
        fx.docs_root.join("doc-a.txt"),
        "Q: What is Acme?\nA: Acme Corp was founded in 1998.",
    )
    .unwrap();

    let embedder = Arc::new(MockEmbedder::new());
    let mut store = open_store(&fx.config, "support").await;
    let files = scan_knowledge_base(&fx.config.knowledge_bases[0]).unwrap();
    store.rebuild(&files, embedder.as_ref()).await.unwrap();

    let generator = MockGenerator::new("should never be used");
    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        embedder.clone(),
        Some(generator.clone()),
        Box::new(HeuristicClassifier),
    );

    let answer = engine.ask("What is Acme?", "s1").await.unwrap();

    assert_eq!(answer.answer_text, "Acme Corp was founded in 1998.");
    assert_eq!(answer.mode, AnswerMode::Context);
    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].document, "doc-a.txt");
    assert_eq!(generator.call_count(), 0, "direct match must beat generation");
}

#[tokio::test]
async fn unrelated_query_reports_insufficient_information() {
    let mut fx = fixture("support");
    fx.config.retrieval.min_similarity = 0.35;
    std::fs::write(
        fx.docs_root.join("acme.md"),
        "Acme Corp builds industrial anvils and rocket skates.",
    )
    .unwrap();

    let embedder = Arc::new(MockEmbedder::new());
    let mut store = open_store(&fx.config, "support").await;
    let files = scan_knowledge_base(&fx.config.knowledge_bases[0]).unwrap();
    store.rebuild(&files, embedder.as_ref()).await.unwrap();

    // No generation collaborator: a weak corpus match must not be
    // dressed up as an answer.
    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        embedder,
        None,
        Box::new(HeuristicClassifier),
    );

    let answer = engine
        .ask("Explain the quantum entanglement paradox thoroughly please", "s1")
        .await
        .unwrap();

    assert_eq!(answer.status, AnswerStatus::InsufficientInformation);
    assert_eq!(answer.mode, AnswerMode::None);
    assert_eq!(answer.answer_text, NO_ANSWER_TEXT);
    assert!(answer.sources.is_empty());
}

#[tokio::test]
async fn follow_up_is_rewritten_with_accumulated_context() {
    let fx = fixture("support");
    std::fs::write(
        fx.docs_root.join("acme.md"),
        "Acme Corp revenue grew 40 percent year over year.",
    )
    .unwrap();

    let embedder = Arc::new(MockEmbedder::new());
    let mut store = open_store(&fx.config, "support").await;
    let files = scan_knowledge_base(&fx.config.knowledge_bases[0]).unwrap();
    store.rebuild(&files, embedder.as_ref()).await.unwrap();

    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        embedder.clone(),
        None,
        Box::new(HeuristicClassifier),
    );

    engine
        .ask("Give me an overview of Acme Corp operations", "s1")
        .await
        .unwrap();
    engine.ask("what about revenue", "s1").await.unwrap();

    let rewritten = embedder
        .recorded()
        .into_iter()
        .find(|q| q.starts_with("what about revenue"))
        .expect("follow-up query was embedded");
    assert!(
        rewritten.contains("Acme Corp"),
        "expected accumulated context in rewrite, got: {}",
        rewritten
    );
}

#[tokio::test]
async fn context_answer_cites_best_hit() {
    let fx = fixture("support");
    std::fs::write(
        fx.docs_root.join("refunds.md"),
        "Refunds are processed within five business days after approval.",
    )
    .unwrap();

    let embedder = Arc::new(MockEmbedder::new());
    let mut store = open_store(&fx.config, "support").await;
    let files = scan_knowledge_base(&fx.config.knowledge_bases[0]).unwrap();
    store.rebuild(&files, embedder.as_ref()).await.unwrap();

    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        embedder,
        None,
        Box::new(HeuristicClassifier),
    );

    let answer = engine
        .ask(
            "When are refunds processed within business days after approval",
            "s1",
        )
        .await
        .unwrap();

    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.mode, AnswerMode::Context);
    assert!(answer
        .answer_text
        .contains("Refunds are processed within five business days"));
    assert_eq!(answer.sources[0].knowledge_base, "support");
    assert_eq!(answer.sources[0].document, "refunds.md");
}

// ============ Store invariants ============

#[tokio::test]
async fn unchanged_files_are_skipped_and_index_is_stable() {
    let fx = fixture("docs");
    std::fs::write(fx.docs_root.join("a.md"), "Alpha document body.").unwrap();
    std::fs::write(fx.docs_root.join("b.md"), "Beta document body.").unwrap();

    let embedder = MockEmbedder::new();
    let store = open_store(&fx.config, "docs").await;
    let files = scan_knowledge_base(&fx.config.knowledge_bases[0]).unwrap();

    let first = store
        .incremental_update(&files, UpdatePolicy::Append, &embedder)
        .await
        .unwrap();
    assert_eq!(first.files_processed, 2);
    assert_eq!(first.chunks_written, 2);

    let chunks_before = store.chunk_count().await.unwrap();
    let fts_before = fts_row_count(&store).await;
    let ids_before = all_chunk_ids(&store).await;

    let second = store
        .incremental_update(&files, UpdatePolicy::Append, &embedder)
        .await
        .unwrap();
    assert_eq!(second.files_processed, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.chunks_written, 0);

    assert_eq!(store.chunk_count().await.unwrap(), chunks_before);
    assert_eq!(fts_row_count(&store).await, fts_before);
    assert_eq!(all_chunk_ids(&store).await, ids_before);
}

#[tokio::test]
async fn append_policy_keeps_superseded_chunks_retrievable() {
    let fx = fixture("docs");
    let file = fx.docs_root.join("policy.md");
    std::fs::write(&file, "The refund window is thirty days.").unwrap();

    let embedder = MockEmbedder::new();
    let store = open_store(&fx.config, "docs").await;
    let kb = &fx.config.knowledge_bases[0];

    let files = scan_knowledge_base(kb).unwrap();
    store
        .incremental_update(&files, UpdatePolicy::Append, &embedder)
        .await
        .unwrap();

    std::fs::write(&file, "The refund window is ninety days.").unwrap();
    let files = scan_knowledge_base(kb).unwrap();
    store
        .incremental_update(&files, UpdatePolicy::Append, &embedder)
        .await
        .unwrap();

    let hits = store.keyword_candidates("\"refund\"", 10).await.unwrap();
    assert_eq!(hits.len(), 2, "superseded chunk must remain retrievable");

    let positions: HashSet<i64> = hits.iter().map(|h| h.chunk_id).collect();
    assert_eq!(positions.len(), 2, "(doc, chunk_id) must stay unique");
}

#[tokio::test]
async fn replace_policy_removes_superseded_chunks_and_postings() {
    let fx = fixture("docs");
    let file = fx.docs_root.join("policy.md");
    std::fs::write(&file, "The refund window is thirty days.").unwrap();

    let embedder = MockEmbedder::new();
    let store = open_store(&fx.config, "docs").await;
    let kb = &fx.config.knowledge_bases[0];

    let files = scan_knowledge_base(kb).unwrap();
    store
        .incremental_update(&files, UpdatePolicy::Replace, &embedder)
        .await
        .unwrap();

    std::fs::write(&file, "The refund window is ninety days.").unwrap();
    let files = scan_knowledge_base(kb).unwrap();
    store
        .incremental_update(&files, UpdatePolicy::Replace, &embedder)
        .await
        .unwrap();

    let hits = store.keyword_candidates("\"thirty\"", 10).await.unwrap();
    assert!(hits.is_empty(), "replaced chunk's postings must be gone");

    let hits = store.keyword_candidates("\"ninety\"", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(store.chunk_count().await.unwrap(), 1);
    assert_eq!(fts_row_count(&store).await, 1);
}

#[tokio::test]
async fn chunk_ids_are_monotonic_and_never_reused() {
    let fx = fixture("docs");
    let file = fx.docs_root.join("doc.md");
    let embedder = MockEmbedder::new();
    let kb = &fx.config.knowledge_bases[0];

    let mut store = open_store(&fx.config, "docs").await;
    let mut seen: HashSet<i64> = HashSet::new();

    // update → replace-update → rebuild, ids must only climb.
    std::fs::write(&file, "Version one of the document.").unwrap();
    let files = scan_knowledge_base(kb).unwrap();
    store
        .incremental_update(&files, UpdatePolicy::Replace, &embedder)
        .await
        .unwrap();
    let ids = all_chunk_ids(&store).await;
    for &id in &ids {
        assert!(seen.insert(id), "id {} was reused", id);
    }
    let after_first = *ids.iter().max().unwrap();

    std::fs::write(&file, "Version two of the document.").unwrap();
    let files = scan_knowledge_base(kb).unwrap();
    store
        .incremental_update(&files, UpdatePolicy::Replace, &embedder)
        .await
        .unwrap();
    let ids = all_chunk_ids(&store).await;
    assert!(ids.iter().all(|&id| id > after_first));
    for &id in &ids {
        assert!(seen.insert(id), "id {} was reused", id);
    }
    let after_second = *ids.iter().max().unwrap();

    std::fs::write(&file, "Version three of the document.").unwrap();
    let files = scan_knowledge_base(kb).unwrap();
    store.rebuild(&files, &embedder).await.unwrap();
    let ids = all_chunk_ids(&store).await;
    assert!(
        ids.iter().all(|&id| id > after_second),
        "rebuild must not reuse ids: {:?} vs max {}",
        ids,
        after_second
    );
}

#[tokio::test]
async fn failed_rebuild_leaves_live_database_untouched() {
    let fx = fixture("docs");
    std::fs::write(fx.docs_root.join("doc.md"), "Original corpus content.").unwrap();

    let embedder = MockEmbedder::new();
    let mut store = open_store(&fx.config, "docs").await;
    let kb = &fx.config.knowledge_bases[0];

    let files = scan_knowledge_base(kb).unwrap();
    store.rebuild(&files, &embedder).await.unwrap();
    let chunks_before = store.chunk_count().await.unwrap();
    assert!(chunks_before > 0);

    let err = store.rebuild(&files, &FailingEmbedder).await;
    assert!(err.is_err());

    // Live data survives; no temp artifact is left behind.
    assert_eq!(store.chunk_count().await.unwrap(), chunks_before);
    let tmp_exists = std::fs::read_dir(&fx.config.storage.data_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().contains(".tmp"));
    assert!(!tmp_exists, "failed rebuild must discard temp artifacts");
}

#[tokio::test]
async fn empty_document_yields_zero_chunks_but_is_recorded() {
    let fx = fixture("docs");
    std::fs::write(fx.docs_root.join("empty.md"), "   \n\n  ").unwrap();

    let embedder = MockEmbedder::new();
    let store = open_store(&fx.config, "docs").await;
    let files = scan_knowledge_base(&fx.config.knowledge_bases[0]).unwrap();

    let summary = store
        .incremental_update(&files, UpdatePolicy::Append, &embedder)
        .await
        .unwrap();
    assert_eq!(summary.chunks_written, 0);
    assert_eq!(store.document_count().await.unwrap(), 1);

    // Second pass hash-skips the still-empty file.
    let summary = store
        .incremental_update(&files, UpdatePolicy::Append, &embedder)
        .await
        .unwrap();
    assert_eq!(summary.files_skipped, 1);
}

// ============ Few-shot generation fallback ============

async fn fewshot_fixture(
    example_input: &str,
    generator_response: &str,
    min_confidence: f32,
) -> (Fixture, Arc<MockGenerator>, QaEngine) {
    let mut fx = fixture("support");
    fx.config.fewshot.min_confidence = min_confidence;

    let embedder = Arc::new(MockEmbedder::new());
    let store = open_store(&fx.config, "support").await;

    let examples_dir = fx.docs_root.parent().unwrap().join("examples");
    std::fs::create_dir_all(&examples_dir).unwrap();
    std::fs::write(
        examples_dir.join("support.jsonl"),
        format!(
            "{}\n",
            serde_json::json!({ "input": example_input, "output": "A canned support answer." })
        ),
    )
    .unwrap();
    fewshot::rebuild_index(&store, &examples_dir, embedder.as_ref())
        .await
        .unwrap();

    let generator = MockGenerator::new(generator_response);
    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        embedder,
        Some(generator.clone()),
        Box::new(HeuristicClassifier),
    );
    (fx, generator, engine)
}

#[tokio::test]
async fn generation_fallback_answers_when_confident() {
    let (_fx, generator, engine) = fewshot_fixture(
        "what is the acme refund policy",
        "Acme refunds within thirty days of purchase.",
        0.5,
    )
    .await;

    let answer = engine
        .ask("what is the acme refund policy", "s1")
        .await
        .unwrap();

    assert_eq!(answer.mode, AnswerMode::Generated);
    assert_eq!(answer.status, AnswerStatus::Answered);
    assert_eq!(answer.answer_text, "Acme refunds within thirty days of purchase.");
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn hedged_generation_downgrades_to_insufficient_information() {
    let (_fx, generator, engine) = fewshot_fixture(
        "what is the acme refund policy",
        "That information is not publicly disclosed.",
        0.5,
    )
    .await;

    let answer = engine
        .ask("what is the acme refund policy", "s1")
        .await
        .unwrap();

    assert_eq!(generator.call_count(), 1, "text was produced");
    assert_eq!(
        answer.status,
        AnswerStatus::InsufficientInformation,
        "but the router must not trust it"
    );
    assert_eq!(answer.answer_text, NO_ANSWER_TEXT);
}

#[tokio::test]
async fn example_index_is_cached_until_model_or_files_change() {
    let fx = fixture("support");
    let embedder = MockEmbedder::new();
    let store = open_store(&fx.config, "support").await;

    let examples_dir = fx.docs_root.parent().unwrap().join("examples");
    std::fs::create_dir_all(&examples_dir).unwrap();
    let file = examples_dir.join("e.jsonl");
    std::fs::write(
        &file,
        "{\"input\": \"first question\", \"output\": \"first answer\"}\n",
    )
    .unwrap();

    let count = fewshot::ensure_index(&store, &examples_dir, &embedder)
        .await
        .unwrap();
    assert_eq!(count, 1);
    let embeds_after_build = embedder.recorded().len();

    // Unchanged files + same model: no re-embedding.
    fewshot::ensure_index(&store, &examples_dir, &embedder)
        .await
        .unwrap();
    assert_eq!(embedder.recorded().len(), embeds_after_build);

    // Changed files: wholesale rebuild.
    std::fs::write(
        &file,
        "{\"input\": \"first question\", \"output\": \"first answer\"}\n{\"input\": \"second question\", \"output\": \"second answer\"}\n",
    )
    .unwrap();
    let count = fewshot::ensure_index(&store, &examples_dir, &embedder)
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert!(embedder.recorded().len() > embeds_after_build);
}

// ============ Failure surfacing ============

#[tokio::test]
async fn embedding_failure_surfaces_as_error_not_answer() {
    let fx = fixture("support");
    let store = open_store(&fx.config, "support").await;

    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        Arc::new(FailingEmbedder),
        None,
        Box::new(HeuristicClassifier),
    );

    let result = engine.ask("any question at all here", "s1").await;
    assert!(result.is_err(), "collaborator failure must not become an answer");
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let fx = fixture("support");
    let store = open_store(&fx.config, "support").await;
    let engine = QaEngine::with_parts(
        fx.config.clone(),
        vec![store],
        Arc::new(MockEmbedder::new()),
        None,
        Box::new(HeuristicClassifier),
    );

    let result = engine.ask("   ", "s1").await;
    assert!(result.is_err());
}
