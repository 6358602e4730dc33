//! Hybrid candidate ranking with a deterministic direct-answer shortcut.
//!
//! Ranking is a bounded linear re-rank, not an ANN index: per knowledge
//! base, a full-text pass prunes to a candidate set (with an unranked scan
//! fallback when the query shares no tokens with the corpus), then cosine
//! similarity against a single query embedding orders the candidates.
//! Per-base top-k survivors merge into a global top-k, and hits under the
//! minimum-similarity floor are dropped outright rather than surfaced as
//! weak context.
//!
//! The direct Q/A shortcut scans ranked hits for `Q: ... A: ...` shaped
//! chunks and answers verbatim from the stored answer when the stored
//! question overlaps the live query strongly enough. An adequate direct
//! match takes strict precedence over generation.

use anyhow::Result;
use std::collections::HashSet;

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, Embedder};
use crate::store::KnowledgeStore;

/// One ranked chunk reference. Transient; never persisted.
#[derive(Debug, Clone)]
pub struct RetrievalHit {
    pub knowledge_base: String,
    pub doc: String,
    pub chunk_pos: i64,
    pub text: String,
    pub score: f32,
}

/// A direct Q/A shortcut match: the stored answer, verbatim, plus the hit
/// it came from.
#[derive(Debug, Clone)]
pub struct DirectAnswer {
    pub answer: String,
    pub hit: RetrievalHit,
}

/// Rank chunks across all knowledge bases, highest score first.
///
/// Hits below `params.min_similarity` are dropped — an empty result means
/// the corpus holds nothing relevant enough, a first-class outcome distinct
/// from any system fault.
pub async fn rank(
    stores: &[KnowledgeStore],
    embedder: &dyn Embedder,
    query: &str,
    params: &RetrievalConfig,
) -> Result<Vec<RetrievalHit>> {
    let normalized = normalize_query(query);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embedder.embed(&normalized).await?;

    let mut merged: Vec<RetrievalHit> = Vec::new();

    for store in stores {
        let candidates = match fts_match_expr(&normalized) {
            Some(expr) => {
                let found = store
                    .keyword_candidates(&expr, params.candidate_limit)
                    .await?;
                if found.is_empty() {
                    store.scan_candidates(params.candidate_limit).await?
                } else {
                    found
                }
            }
            None => store.scan_candidates(params.candidate_limit).await?,
        };

        let mut hits: Vec<RetrievalHit> = candidates
            .into_iter()
            .map(|c| {
                let score = cosine_similarity(&query_vec, &c.embedding);
                RetrievalHit {
                    knowledge_base: store.name().to_string(),
                    doc: c.doc,
                    chunk_pos: c.chunk_id,
                    text: c.text,
                    score,
                }
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(params.top_k);
        merged.extend(hits);
    }

    sort_hits(&mut merged);
    merged.truncate(params.top_k);
    merged.retain(|h| h.score >= params.min_similarity);

    Ok(merged)
}

/// Deterministic ordering: score descending, then origin for stable ties.
fn sort_hits(hits: &mut [RetrievalHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.knowledge_base.cmp(&b.knowledge_base))
            .then_with(|| a.doc.cmp(&b.doc))
            .then_with(|| a.chunk_pos.cmp(&b.chunk_pos))
    });
}

/// Trim, collapse whitespace, and strip trailing punctuation.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['?', '!', '.', ',', ';', ':'])
        .trim()
        .to_string()
}

/// Build an FTS5 match expression from the query's alphanumeric tokens,
/// OR-joined so partial overlap still matches. Returns `None` when the
/// query has no indexable tokens.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Lowercase, strip non-alphanumerics, split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Token-overlap ratio: `|intersection| / |question tokens|`.
pub fn token_overlap(question: &str, query: &str) -> f32 {
    let q_tokens: HashSet<String> = tokenize(question).into_iter().collect();
    if q_tokens.is_empty() {
        return 0.0;
    }
    let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
    let matched = q_tokens.intersection(&query_tokens).count();
    matched as f32 / q_tokens.len() as f32
}

/// Split a chunk of the canonical `Q: <question> A: <answer>` shape.
fn parse_qa(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix("Q:")?;
    let split = rest.find(" A: ")?;
    let question = rest[..split].trim();
    let answer = rest[split + 4..].trim();
    if question.is_empty() || answer.is_empty() {
        return None;
    }
    Some((question, answer))
}

/// Scan ranked hits for a Q/A-shaped chunk whose stored question overlaps
/// the live query at or above `threshold`. The best such match answers
/// verbatim, bypassing generation entirely.
pub fn direct_answer(hits: &[RetrievalHit], query: &str, threshold: f32) -> Option<DirectAnswer> {
    let mut best: Option<(f32, DirectAnswer)> = None;

    for hit in hits {
        let Some((question, answer)) = parse_qa(&hit.text) else {
            continue;
        };
        let overlap = token_overlap(question, query);
        if overlap < threshold {
            continue;
        }
        if best.as_ref().map(|(s, _)| overlap > *s).unwrap_or(true) {
            best = Some((
                overlap,
                DirectAnswer {
                    answer: answer.to_string(),
                    hit: hit.clone(),
                },
            ));
        }
    }

    best.map(|(_, d)| d)
}

/// CLI entry point for `cqa search` — retrieval only, no routing.
pub async fn run_search(
    config: &crate::config::Config,
    query: &str,
    limit: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let embedder = crate::embedding::create_embedder(&config.embedding)?;

    let mut stores = Vec::new();
    for kb in &config.knowledge_bases {
        stores.push(
            KnowledgeStore::open(&kb.name, &config.storage.data_dir, config.chunking.clone())
                .await?,
        );
    }

    let mut params = config.retrieval.clone();
    if let Some(limit) = limit {
        params.top_k = limit;
    }

    let hits = rank(&stores, embedder.as_ref(), query, &params).await?;

    if hits.is_empty() {
        println!("No results.");
    } else {
        for (i, hit) in hits.iter().enumerate() {
            println!(
                "{}. [{:.2}] {} / {} (chunk {})",
                i + 1,
                hit.score,
                hit.knowledge_base,
                hit.doc,
                hit.chunk_pos
            );
            let excerpt: String = hit.text.chars().take(160).collect();
            println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
            println!();
        }
    }

    for store in &stores {
        store.close().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(text: &str, score: f32) -> RetrievalHit {
        RetrievalHit {
            knowledge_base: "kb".to_string(),
            doc: "doc.txt".to_string(),
            chunk_pos: 0,
            text: text.to_string(),
            score,
        }
    }

    #[test]
    fn normalize_strips_trailing_punctuation_and_whitespace() {
        assert_eq!(normalize_query("  What   is Acme??  "), "What is Acme");
        assert_eq!(normalize_query("hello."), "hello");
        assert_eq!(normalize_query(""), "");
    }

    #[test]
    fn tokenize_lowercases_and_strips_symbols() {
        assert_eq!(
            tokenize("What's Acme-Corp, Inc.?"),
            vec!["whats", "acmecorp", "inc"]
        );
    }

    #[test]
    fn fts_expr_quotes_tokens() {
        assert_eq!(
            fts_match_expr("what is acme").as_deref(),
            Some("\"what\" OR \"is\" OR \"acme\"")
        );
        assert_eq!(fts_match_expr("¿¿ ??"), None);
    }

    #[test]
    fn overlap_is_fraction_of_question_tokens() {
        let overlap = token_overlap("What is Acme", "what is acme corp");
        assert!((overlap - 1.0).abs() < 1e-6);

        let partial = token_overlap("What is Acme Corp revenue", "acme revenue");
        assert!((partial - 0.4).abs() < 1e-6);

        assert_eq!(token_overlap("", "anything"), 0.0);
    }

    #[test]
    fn parse_qa_requires_canonical_shape() {
        assert_eq!(
            parse_qa("Q: What is Acme? A: Acme Corp was founded in 1998."),
            Some(("What is Acme?", "Acme Corp was founded in 1998."))
        );
        assert_eq!(parse_qa("Plain paragraph text."), None);
        assert_eq!(parse_qa("Q: dangling question"), None);
    }

    #[test]
    fn direct_answer_returns_stored_answer_verbatim() {
        let hits = vec![
            hit("Some unrelated paragraph about revenue.", 0.9),
            hit("Q: What is Acme? A: Acme Corp was founded in 1998.", 0.8),
        ];
        let direct = direct_answer(&hits, "What is Acme?", 0.38).unwrap();
        assert_eq!(direct.answer, "Acme Corp was founded in 1998.");
    }

    #[test]
    fn direct_answer_respects_threshold() {
        let hits = vec![hit(
            "Q: How do I configure the flux capacitor? A: Turn the dial.",
            0.9,
        )];
        assert!(direct_answer(&hits, "What is Acme?", 0.38).is_none());
    }

    #[test]
    fn direct_answer_prefers_best_overlap() {
        let hits = vec![
            hit("Q: What is Acme Corp doing? A: wrong", 0.9),
            hit("Q: What is Acme? A: right", 0.8),
        ];
        let direct = direct_answer(&hits, "what is acme", 0.38).unwrap();
        assert_eq!(direct.answer, "right");
    }

    #[test]
    fn sort_is_deterministic_on_ties() {
        let mut hits = vec![
            RetrievalHit {
                knowledge_base: "b".into(),
                doc: "x".into(),
                chunk_pos: 0,
                text: String::new(),
                score: 0.5,
            },
            RetrievalHit {
                knowledge_base: "a".into(),
                doc: "x".into(),
                chunk_pos: 0,
                text: String::new(),
                score: 0.5,
            },
        ];
        sort_hits(&mut hits);
        assert_eq!(hits[0].knowledge_base, "a");
    }
}
