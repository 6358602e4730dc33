//! Few-shot example selection and generation prompts.
//!
//! Examples live in line-delimited JSON files under a per-knowledge-base
//! directory. Field names vary across example formats in the wild, so
//! loading normalizes recognized aliases onto one canonical record shape
//! and skips (with a warning) records with no recognizable input field.
//!
//! Each knowledge base carries a persisted example index — every example's
//! input embedded — cached under `(model identity, files digest)` and
//! rebuilt wholesale whenever either changes. Selection embeds the query
//! once and takes the top `per_kb_k` examples per knowledge base by cosine
//! similarity.
//!
//! The accompanying confidence estimate is the maximum lexical
//! token-overlap ratio between the query and any selected example's input.
//! It is a cheap proxy for answer correctness, not a semantic judgment,
//! and a post-hoc hedge detection pass downgrades it sharply when the
//! generated text is a stock non-answer.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::warn;

use crate::classify::Classifier;
use crate::embedding::{cosine_similarity, Embedder};
use crate::generation::{GenerateOptions, Generator};
use crate::rank::token_overlap;
use crate::session::{ChatMessage, Role};
use crate::store::KnowledgeStore;

/// Recognized aliases for the example input field, in precedence order.
const INPUT_ALIASES: &[&str] = &["input", "question", "prompt", "query", "instruction"];
/// Recognized aliases for the example output field, in precedence order.
const OUTPUT_ALIASES: &[&str] = &["output", "answer", "response", "completion"];

/// Multiplier applied to confidence when the generated text is a hedge.
const HEDGE_DOWNGRADE: f32 = 0.2;

/// One normalized example record.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleRecord {
    pub input_text: String,
    pub output_text: String,
}

/// An example chosen for a query, tagged with its origin.
#[derive(Debug, Clone)]
pub struct SelectedExample {
    pub knowledge_base: String,
    pub input_text: String,
    pub output_text: String,
    pub score: f32,
}

/// A generated answer with its heuristic confidence.
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub text: String,
    pub confidence: f32,
}

/// Map one JSON line onto the canonical record shape.
///
/// Returns `None` when no recognized input or output field is present.
fn normalize_record(value: &serde_json::Value) -> Option<ExampleRecord> {
    let field = |aliases: &[&str]| {
        aliases
            .iter()
            .find_map(|k| value.get(k).and_then(|v| v.as_str()))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let input_text = field(INPUT_ALIASES)?;
    let output_text = field(OUTPUT_ALIASES)?;
    Some(ExampleRecord {
        input_text,
        output_text,
    })
}

/// Load every example record under `dir` (files matching `*.jsonl` or
/// `*.ndjson`). Malformed lines and unrecognizable records are skipped
/// individually with a warning, never fatal to the batch.
pub fn load_example_records(dir: &Path) -> Result<Vec<ExampleRecord>> {
    let mut records = Vec::new();

    for path in example_files(dir)? {
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unreadable example file skipped");
                continue;
            }
        };

        for (line_no, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) => match normalize_record(&value) {
                    Some(record) => records.push(record),
                    None => {
                        warn!(
                            file = %path.display(),
                            line = line_no + 1,
                            "example record has no recognizable input/output field; skipped"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "malformed example line skipped"
                    );
                }
            }
        }
    }

    Ok(records)
}

/// Sorted list of example files under `dir`. Missing directories yield an
/// empty list rather than an error.
fn example_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<std::path::PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("jsonl") | Some("ndjson")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Digest of the backing example files: names plus content hashes.
/// Part of the index cache key alongside the embedding model identity.
pub fn files_digest(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in example_files(dir)? {
        hasher.update(path.to_string_lossy().as_bytes());
        let bytes = std::fs::read(&path).unwrap_or_default();
        hasher.update(Sha256::digest(&bytes));
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Ensure the knowledge base's persisted example index matches the current
/// model identity and backing files, rebuilding it wholesale otherwise.
///
/// Returns the number of indexed examples.
pub async fn ensure_index(
    store: &KnowledgeStore,
    examples_root: &Path,
    embedder: &dyn Embedder,
) -> Result<usize> {
    let digest = files_digest(examples_root)?;
    let model = embedder.model_identity().to_string();

    if let Some((cached_model, cached_digest)) = store.fewshot_cache_key().await? {
        if cached_model == model && cached_digest == digest {
            return Ok(store.load_fewshot_examples().await?.len());
        }
    }

    rebuild_index(store, examples_root, embedder).await
}

/// Re-embed every example input and replace the persisted index,
/// regardless of the cache key.
pub async fn rebuild_index(
    store: &KnowledgeStore,
    examples_root: &Path,
    embedder: &dyn Embedder,
) -> Result<usize> {
    let digest = files_digest(examples_root)?;
    let model = embedder.model_identity().to_string();

    let records = load_example_records(examples_root)?;
    let inputs: Vec<String> = records.iter().map(|r| r.input_text.clone()).collect();
    let vectors = embedder.embed_batch(&inputs).await?;

    let rows: Vec<(String, String, Vec<f32>)> = records
        .into_iter()
        .zip(vectors)
        .map(|(r, v)| (r.input_text, r.output_text, v))
        .collect();

    store.replace_fewshot_index(&model, &digest, &rows).await?;
    Ok(rows.len())
}

/// Select the best `per_kb_k` examples from each knowledge base's index,
/// concatenated in knowledge-base order, best first within each.
pub async fn select(
    stores: &[KnowledgeStore],
    embedder: &dyn Embedder,
    query: &str,
    per_kb_k: usize,
) -> Result<Vec<SelectedExample>> {
    if per_kb_k == 0 {
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed(query).await?;
    let mut selected = Vec::new();

    for store in stores {
        let examples = store.load_fewshot_examples().await?;
        let mut scored: Vec<SelectedExample> = examples
            .into_iter()
            .map(|(input_text, output_text, embedding)| SelectedExample {
                knowledge_base: store.name().to_string(),
                score: cosine_similarity(&query_vec, &embedding),
                input_text,
                output_text,
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(per_kb_k);
        selected.extend(scored);
    }

    Ok(selected)
}

/// Maximum token-overlap ratio between the query and any selected
/// example's input — the cheap confidence proxy.
pub fn selection_confidence(examples: &[SelectedExample], query: &str) -> f32 {
    examples
        .iter()
        .map(|e| token_overlap(&e.input_text, query))
        .fold(0.0, f32::max)
}

/// Assemble the few-shot prompt: selected examples as input/output pairs,
/// a short window of conversation history, then the live question.
pub fn build_prompt(
    examples: &[SelectedExample],
    history: &[ChatMessage],
    question: &str,
) -> String {
    let mut prompt = String::new();

    if !examples.is_empty() {
        prompt.push_str("Answer in the style of these examples.\n\n");
        for example in examples {
            prompt.push_str("Input: ");
            prompt.push_str(&example.input_text);
            prompt.push_str("\nOutput: ");
            prompt.push_str(&example.output_text);
            prompt.push_str("\n\n");
        }
    }

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for message in history {
            let role = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            prompt.push_str(&format!("{}: {}\n", role, message.content));
        }
        prompt.push('\n');
    }

    prompt.push_str("Input: ");
    prompt.push_str(question);
    prompt.push_str("\nOutput:");
    prompt
}

/// Generate an answer from selected examples and score its confidence.
///
/// Confidence starts at the lexical selection estimate and is downgraded
/// sharply when the generated text matches a hedge pattern — text was
/// produced, but the router should not trust it.
pub async fn answer_with_examples(
    generator: &dyn Generator,
    options: &GenerateOptions,
    classifier: &dyn Classifier,
    examples: &[SelectedExample],
    history: &[ChatMessage],
    question: &str,
) -> Result<GeneratedAnswer> {
    let prompt = build_prompt(examples, history, question);
    let text = generator.generate(&prompt, options).await?;

    let mut confidence = selection_confidence(examples, question);
    if classifier.is_hedge(&text) {
        confidence *= HEDGE_DOWNGRADE;
    }

    Ok(GeneratedAnswer { text, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize_onto_canonical_shape() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"question": "What is X?", "answer": "X is Y."}"#).unwrap();
        let record = normalize_record(&value).unwrap();
        assert_eq!(record.input_text, "What is X?");
        assert_eq!(record.output_text, "X is Y.");

        let value: serde_json::Value =
            serde_json::from_str(r#"{"prompt": "p", "completion": "c"}"#).unwrap();
        assert!(normalize_record(&value).is_some());
    }

    #[test]
    fn unrecognizable_records_are_rejected() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"text": "no recognized fields"}"#).unwrap();
        assert!(normalize_record(&value).is_none());

        let value: serde_json::Value =
            serde_json::from_str(r#"{"question": "input only"}"#).unwrap();
        assert!(normalize_record(&value).is_none());
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("examples.jsonl"),
            "{\"input\": \"a\", \"output\": \"b\"}\nnot json at all\n{\"bad\": 1}\n{\"query\": \"c\", \"response\": \"d\"}\n",
        )
        .unwrap();

        let records = load_example_records(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].input_text, "a");
        assert_eq!(records[1].input_text, "c");
    }

    #[test]
    fn missing_directory_yields_no_records() {
        let records = load_example_records(Path::new("/nonexistent/examples")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn digest_tracks_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("e.jsonl");
        std::fs::write(&file, "{\"input\": \"a\", \"output\": \"b\"}\n").unwrap();
        let d1 = files_digest(dir.path()).unwrap();
        let d2 = files_digest(dir.path()).unwrap();
        assert_eq!(d1, d2);

        std::fs::write(&file, "{\"input\": \"changed\", \"output\": \"b\"}\n").unwrap();
        let d3 = files_digest(dir.path()).unwrap();
        assert_ne!(d1, d3);
    }

    fn selected(input: &str) -> SelectedExample {
        SelectedExample {
            knowledge_base: "kb".to_string(),
            input_text: input.to_string(),
            output_text: "out".to_string(),
            score: 0.5,
        }
    }

    #[test]
    fn confidence_is_max_overlap_over_selected() {
        let examples = vec![selected("refund policy details"), selected("what is acme")];
        let confidence = selection_confidence(&examples, "what is acme");
        assert!((confidence - 1.0).abs() < 1e-6);
        assert_eq!(selection_confidence(&[], "anything"), 0.0);
    }

    #[test]
    fn prompt_formats_examples_then_question() {
        let examples = vec![selected("sample input")];
        let prompt = build_prompt(&examples, &[], "live question");
        assert!(prompt.contains("Input: sample input\nOutput: out"));
        assert!(prompt.ends_with("Input: live question\nOutput:"));
    }

    #[test]
    fn prompt_includes_history_window() {
        let history = vec![
            ChatMessage {
                role: Role::User,
                content: "earlier question".to_string(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: "earlier answer".to_string(),
            },
        ];
        let prompt = build_prompt(&[], &history, "next");
        assert!(prompt.contains("User: earlier question"));
        assert!(prompt.contains("Assistant: earlier answer"));
    }
}
