//! Multi-turn conversation routing.
//!
//! Every turn runs the same state machine:
//! `RECEIVE → REWRITE → RETRIEVE → FILTER → decision → RECORD`.
//! Follow-up turns are rewritten with accumulated context terms and the
//! last inferred objective before retrieval. Retrieval hits surviving the
//! relevance filter answer from context (with the direct Q/A shortcut
//! taking precedence over everything generated); otherwise the few-shot
//! generation fallback runs, and when neither path clears its confidence
//! bar the engine says so instead of guessing.
//!
//! [`QaEngine`] owns the shared pieces: knowledge stores, the embedding
//! and (optional) generation collaborators, the classifier, and the
//! session store. Turns on the same session serialize on that session's
//! lock; turns on different sessions proceed in parallel.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::classify::{extract_context_terms, Classifier, HeuristicClassifier, TurnKind};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::fewshot;
use crate::generation::{create_generator, GenerateOptions, Generator};
use crate::rank::{direct_answer, rank, RetrievalHit};
use crate::session::SessionStore;
use crate::store::KnowledgeStore;

/// Fixed response when neither retrieval nor generation clears its bar.
pub const NO_ANSWER_TEXT: &str =
    "I don't have enough information in the knowledge base to answer that.";

/// Context terms extracted from a single turn.
const TERMS_PER_TURN: usize = 8;

/// How the answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerMode {
    Context,
    Generated,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    InsufficientInformation,
}

/// Provenance of a context answer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub knowledge_base: String,
    pub document: String,
    pub chunk_position: i64,
    pub score: f32,
}

impl From<&RetrievalHit> for SourceRef {
    fn from(hit: &RetrievalHit) -> Self {
        Self {
            knowledge_base: hit.knowledge_base.clone(),
            document: hit.doc.clone(),
            chunk_position: hit.chunk_pos,
            score: hit.score,
        }
    }
}

/// The result of one conversational turn.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub status: AnswerStatus,
    pub answer_text: String,
    pub mode: AnswerMode,
    pub sources: Vec<SourceRef>,
}

pub struct QaEngine {
    config: Config,
    stores: Vec<KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    classifier: Box<dyn Classifier>,
    sessions: SessionStore,
}

impl QaEngine {
    /// Open the engine from configuration: connect every knowledge base
    /// and instantiate the configured collaborators.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;

        let mut stores = Vec::with_capacity(config.knowledge_bases.len());
        for kb in &config.knowledge_bases {
            stores.push(
                KnowledgeStore::open(&kb.name, &config.storage.data_dir, config.chunking.clone())
                    .await?,
            );
        }

        Ok(Self::with_parts(
            config,
            stores,
            embedder,
            generator,
            Box::new(HeuristicClassifier),
        ))
    }

    /// Assemble an engine from pre-built parts. Used by tests to inject
    /// deterministic collaborators.
    pub fn with_parts(
        config: Config,
        stores: Vec<KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        let sessions = SessionStore::new(config.session.max_sessions, config.session.ttl_secs);
        Self {
            config,
            stores,
            embedder,
            generator,
            classifier,
            sessions,
        }
    }

    pub fn stores(&self) -> &[KnowledgeStore] {
        &self.stores
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Answer one conversational turn.
    ///
    /// Collaborator failures surface as errors — the caller reports the
    /// engine as temporarily unavailable rather than fabricating an
    /// answer. A confident "no" is not an error: it comes back as the
    /// insufficient-information outcome.
    pub async fn ask(&self, question: &str, session_id: &str) -> Result<Answer> {
        if question.trim().is_empty() {
            bail!("question must not be empty");
        }

        let entry = self.sessions.checkout(session_id);
        let mut state = entry.state.lock().await;

        // REWRITE: follow-ups get the accumulated context appended.
        let kind = self.classifier.turn_kind(question);
        if let Some(objective) = self.classifier.objective(question) {
            state.objective = Some(objective);
        }
        let rewritten = rewrite_query(
            question,
            kind,
            state.context_terms(),
            state.objective.as_deref(),
        );
        state.merge_context_terms(
            &extract_context_terms(question, TERMS_PER_TURN),
            self.config.session.max_context_terms,
        );

        // RETRIEVE.
        let hits = rank(
            &self.stores,
            self.embedder.as_ref(),
            &rewritten,
            &self.config.retrieval,
        )
        .await?;

        // FILTER.
        let threshold = self.config.retrieval.relevance_threshold;
        let surviving: Vec<&RetrievalHit> = hits.iter().filter(|h| h.score >= threshold).collect();

        // Decision. The direct Q/A shortcut is checked over every ranked
        // hit: an adequate stored answer always beats generation.
        let answer = if let Some(direct) = direct_answer(&hits, &rewritten, threshold) {
            Answer {
                status: AnswerStatus::Answered,
                answer_text: direct.answer,
                mode: AnswerMode::Context,
                sources: vec![SourceRef::from(&direct.hit)],
            }
        } else if let Some(best) = surviving.first() {
            Answer {
                status: AnswerStatus::Answered,
                answer_text: format!(
                    "{}\n\nSource: {}/{} (chunk {})",
                    best.text, best.knowledge_base, best.doc, best.chunk_pos
                ),
                mode: AnswerMode::Context,
                sources: vec![SourceRef::from(*best)],
            }
        } else if let Some(generator) = &self.generator {
            self.generate_fallback(generator.as_ref(), &state, question)
                .await?
        } else {
            no_answer()
        };

        // RECORD.
        state.record_turn(question, &answer.answer_text);

        Ok(answer)
    }

    /// Generation fallback: few-shot examples plus recent history. The
    /// hedge-downgraded confidence must clear `fewshot.min_confidence`,
    /// otherwise the outcome is insufficient information, not the text.
    async fn generate_fallback(
        &self,
        generator: &dyn Generator,
        state: &crate::session::ConversationState,
        question: &str,
    ) -> Result<Answer> {
        let examples = fewshot::select(
            &self.stores,
            self.embedder.as_ref(),
            question,
            self.config.fewshot.per_kb_k,
        )
        .await?;

        let options = GenerateOptions {
            temperature: self.config.generation.temperature,
            max_tokens: self.config.generation.max_tokens,
        };
        let history = state.recent_messages(self.config.session.history_window);

        let generated = fewshot::answer_with_examples(
            generator,
            &options,
            self.classifier.as_ref(),
            &examples,
            history,
            question,
        )
        .await?;

        if generated.confidence < self.config.fewshot.min_confidence {
            return Ok(no_answer());
        }

        Ok(Answer {
            status: AnswerStatus::Answered,
            answer_text: generated.text,
            mode: AnswerMode::Generated,
            sources: Vec::new(),
        })
    }
}

/// CLI entry point for `cqa ask`.
pub async fn run_ask(config: &Config, question: &str, session: Option<String>) -> Result<()> {
    let engine = QaEngine::open(config.clone()).await?;
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let answer = engine.ask(question, &session_id).await?;

    println!("{}", answer.answer_text);
    println!();
    println!(
        "mode: {}   session: {}",
        match answer.mode {
            AnswerMode::Context => "context",
            AnswerMode::Generated => "generated",
            AnswerMode::None => "none",
        },
        session_id
    );
    for source in &answer.sources {
        println!(
            "source: {} / {} (chunk {}, score {:.2})",
            source.knowledge_base, source.document, source.chunk_position, source.score
        );
    }

    Ok(())
}

fn no_answer() -> Answer {
    Answer {
        status: AnswerStatus::InsufficientInformation,
        answer_text: NO_ANSWER_TEXT.to_string(),
        mode: AnswerMode::None,
        sources: Vec::new(),
    }
}

/// Append the accumulated context as a parenthetical hint to follow-up
/// turns; standalone turns pass through unchanged.
fn rewrite_query(
    question: &str,
    kind: TurnKind,
    context_terms: &[String],
    objective: Option<&str>,
) -> String {
    if kind == TurnKind::Standalone {
        return question.to_string();
    }

    let mut parts = Vec::new();
    if !context_terms.is_empty() {
        parts.push(format!("context: {}", context_terms.join(", ")));
    }
    if let Some(objective) = objective {
        parts.push(format!("goal: {}", objective));
    }

    if parts.is_empty() {
        question.to_string()
    } else {
        format!("{} ({})", question, parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standalone_turns_pass_through() {
        let rewritten = rewrite_query(
            "Describe the complete refund workflow for enterprise customers",
            TurnKind::Standalone,
            &["Acme".to_string()],
            Some("describe the refund workflow"),
        );
        assert_eq!(
            rewritten,
            "Describe the complete refund workflow for enterprise customers"
        );
    }

    #[test]
    fn follow_ups_carry_context_terms_and_objective() {
        let rewritten = rewrite_query(
            "what about revenue",
            TurnKind::FollowUp,
            &["Acme".to_string(), "pricing".to_string()],
            Some("what is Acme"),
        );
        assert_eq!(
            rewritten,
            "what about revenue (context: Acme, pricing; goal: what is Acme)"
        );
    }

    #[test]
    fn follow_up_without_context_is_unchanged() {
        let rewritten = rewrite_query("what about revenue", TurnKind::FollowUp, &[], None);
        assert_eq!(rewritten, "what about revenue");
    }

    #[test]
    fn modes_serialize_to_wire_names() {
        assert_eq!(
            serde_json::to_string(&AnswerMode::Context).unwrap(),
            "\"context\""
        );
        assert_eq!(
            serde_json::to_string(&AnswerStatus::InsufficientInformation).unwrap(),
            "\"insufficient_information\""
        );
    }
}
