//! Heuristic turn classification.
//!
//! The router never pattern-matches text itself; everything heuristic goes
//! through the [`Classifier`] trait so an alternative strategy (e.g. a
//! small trained classifier) can be swapped in without touching the state
//! machine. [`HeuristicClassifier`] is the default, built on fixed cue
//! lists and regex patterns.
//!
//! Context-term extraction lives here too: capitalized multi-word phrases
//! found verbatim in a turn, merged with the most frequent non-stopword
//! tokens, phrases first, deduplicated case-insensitively.

use regex::Regex;
use std::sync::OnceLock;

/// How a turn relates to the conversation so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// Continuation of the previous topic; gets rewritten with context.
    FollowUp,
    /// Self-contained question; passes through unchanged.
    Standalone,
}

/// Classification seam for the conversation router.
pub trait Classifier: Send + Sync {
    fn turn_kind(&self, text: &str) -> TurnKind;
    fn objective(&self, text: &str) -> Option<String>;
    fn is_hedge(&self, text: &str) -> bool;
}

/// Continuation cues that mark a turn as a follow-up.
const FOLLOW_UP_CUES: &[&str] = &[
    "what about",
    "how about",
    "and ",
    "also ",
    "what else",
    "anything else",
    "then ",
    "ok but",
    "but ",
];

/// Turns shorter than this many tokens are treated as follow-ups.
const FOLLOW_UP_MAX_TOKENS: usize = 6;

/// Task/question cue words; the matched suffix becomes the objective.
const OBJECTIVE_CUES: &[&str] = &[
    "summarize",
    "explain",
    "compare",
    "list",
    "describe",
    "how",
    "why",
    "what",
    "when",
    "where",
    "who",
    "which",
];

fn hedge_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)not\s+publicly\s+(disclosed|available)",
            r"(?i)contact\s+(our\s+)?(support|sales|billing)",
            r"(?i)i\s+(don't|do\s+not|cannot|can't)\s+(have|provide|share|answer)",
            r"(?i)no\s+(such\s+)?information\s+(is\s+)?available",
            r"(?i)i'?m\s+not\s+(sure|certain)",
            r"(?i)unable\s+to\s+(answer|determine|find)",
            r"(?i)as\s+an\s+ai",
            r"(?i)insufficient\s+(information|context|data)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("hedge pattern"))
        .collect()
    })
}

fn phrase_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b[A-Z][A-Za-z0-9]*(?:\s+[A-Z][A-Za-z0-9]*)+\b").expect("phrase pattern")
    })
}

/// The default pattern-matching classifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn turn_kind(&self, text: &str) -> TurnKind {
        let lowered = text.trim().to_lowercase();
        if FOLLOW_UP_CUES.iter().any(|cue| lowered.starts_with(cue)) {
            return TurnKind::FollowUp;
        }
        if lowered.split_whitespace().count() < FOLLOW_UP_MAX_TOKENS {
            return TurnKind::FollowUp;
        }
        TurnKind::Standalone
    }

    fn objective(&self, text: &str) -> Option<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            let bare: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if OBJECTIVE_CUES.contains(&bare.as_str()) {
                let suffix = words[i..].join(" ");
                let trimmed = suffix.trim_end_matches(['?', '!', '.', ',']).trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
        None
    }

    fn is_hedge(&self, text: &str) -> bool {
        hedge_patterns().iter().any(|p| p.is_match(text))
    }
}

/// Words too generic to carry topical context.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "been", "being", "have", "has", "had", "but",
    "not", "you", "your", "yours", "our", "ours", "their", "them", "they", "this", "that",
    "these", "those", "with", "from", "into", "about", "what", "how", "why", "when", "where",
    "who", "which", "does", "did", "can", "could", "should", "would", "will", "shall", "may",
    "might", "please", "tell", "show", "give", "get", "let", "its", "it's", "there", "here",
    "very", "much", "more", "most", "some", "any", "all", "than", "then", "also", "just",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Extract up to `cap` context terms from one turn.
///
/// Capitalized multi-word phrases are taken verbatim and have precedence;
/// remaining slots go to the most frequent non-stopword tokens of length
/// >= 3, in frequency order then first appearance.
pub fn extract_context_terms(text: &str, cap: usize) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for m in phrase_pattern().find_iter(text) {
        let phrase = m.as_str().trim().to_string();
        if seen.insert(phrase.to_lowercase()) {
            terms.push(phrase);
        }
        if terms.len() >= cap {
            return terms;
        }
    }

    // Token frequencies, preserving first-appearance order for ties.
    let mut counts: Vec<(String, usize)> = Vec::new();
    for raw in text.split_whitespace() {
        let token: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if token.len() < 3 || is_stopword(&token) {
            continue;
        }
        match counts.iter_mut().find(|(t, _)| *t == token) {
            Some((_, n)) => *n += 1,
            None => counts.push((token, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    for (token, _) in counts {
        if terms.len() >= cap {
            break;
        }
        // A token already covered by a captured phrase adds nothing.
        if seen
            .iter()
            .any(|s| s.split_whitespace().any(|w| w == token))
        {
            continue;
        }
        if seen.insert(token.clone()) {
            terms.push(token);
        }
    }

    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_cues_mark_follow_ups() {
        let c = HeuristicClassifier;
        assert_eq!(c.turn_kind("what about revenue"), TurnKind::FollowUp);
        assert_eq!(c.turn_kind("how about the enterprise tier"), TurnKind::FollowUp);
        assert_eq!(c.turn_kind("and the refund policy?"), TurnKind::FollowUp);
    }

    #[test]
    fn short_turns_are_follow_ups() {
        let c = HeuristicClassifier;
        assert_eq!(c.turn_kind("pricing?"), TurnKind::FollowUp);
        assert_eq!(
            c.turn_kind("describe the complete onboarding process for new enterprise customers"),
            TurnKind::Standalone
        );
    }

    #[test]
    fn objective_keeps_matched_suffix() {
        let c = HeuristicClassifier;
        assert_eq!(
            c.objective("Can you explain how billing cycles work?"),
            Some("explain how billing cycles work".to_string())
        );
        assert_eq!(
            c.objective("Summarize the incident report"),
            Some("Summarize the incident report".to_string())
        );
        assert_eq!(c.objective("acme acme acme"), None);
    }

    #[test]
    fn hedges_are_detected() {
        let c = HeuristicClassifier;
        assert!(c.is_hedge("That figure is not publicly disclosed."));
        assert!(c.is_hedge("Please contact our support team for details."));
        assert!(c.is_hedge("I'm not sure about that."));
        assert!(!c.is_hedge("Acme Corp was founded in 1998."));
    }

    #[test]
    fn capitalized_phrases_take_precedence() {
        let terms = extract_context_terms("Tell me about Acme Corp quarterly revenue", 4);
        assert_eq!(terms[0], "Acme Corp");
        assert!(terms.iter().any(|t| t == "quarterly"));
        assert!(terms.iter().any(|t| t == "revenue"));
    }

    #[test]
    fn single_capitalized_word_survives_as_token() {
        let terms = extract_context_terms("Tell me about Acme", 4);
        assert!(terms.iter().any(|t| t == "acme"));
    }

    #[test]
    fn dedup_is_case_insensitive_and_capped() {
        let terms = extract_context_terms("Acme Corp acme corp ACME CORP acme corp", 2);
        assert_eq!(terms.len(), 1, "phrase absorbs its own tokens: {:?}", terms);
        assert_eq!(terms[0], "Acme Corp");
    }

    #[test]
    fn stopwords_and_short_tokens_are_skipped() {
        let terms = extract_context_terms("what is it to me", 5);
        assert!(terms.is_empty());
    }
}
