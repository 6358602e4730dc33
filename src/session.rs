//! Per-session conversation state and the session store.
//!
//! State is in-memory and ephemeral: message history, a bounded set of
//! accumulated context terms (insertion-ordered, oldest evicted past the
//! cap), and the last inferred objective. The store is keyed by session
//! id with LRU + TTL eviction so idle sessions cannot grow memory without
//! bound.
//!
//! Each entry guards its state behind an async mutex: turns on one
//! session serialize, turns on different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Mutable per-session state, owned by its [`SessionStore`] entry.
#[derive(Debug, Default)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
    context_terms: Vec<String>,
    pub objective: Option<String>,
}

impl ConversationState {
    pub fn context_terms(&self) -> &[String] {
        &self.context_terms
    }

    /// Merge newly extracted terms into the accumulated set.
    ///
    /// Set semantics with case-insensitive identity; insertion order is
    /// kept only to know which terms are oldest when the cap evicts.
    pub fn merge_context_terms(&mut self, terms: &[String], cap: usize) {
        for term in terms {
            let key = term.to_lowercase();
            if self
                .context_terms
                .iter()
                .any(|t| t.to_lowercase() == key)
            {
                continue;
            }
            self.context_terms.push(term.clone());
        }
        while self.context_terms.len() > cap {
            self.context_terms.remove(0);
        }
    }

    /// Append the user turn and the produced answer to the history.
    pub fn record_turn(&mut self, question: &str, answer: &str) {
        self.messages.push(ChatMessage {
            role: Role::User,
            content: question.to_string(),
        });
        self.messages.push(ChatMessage {
            role: Role::Assistant,
            content: answer.to_string(),
        });
    }

    /// The trailing `window` messages, oldest first.
    pub fn recent_messages(&self, window: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// One live session: state plus last-use bookkeeping for eviction.
pub struct SessionEntry {
    pub state: tokio::sync::Mutex<ConversationState>,
    last_used: AtomicI64,
}

impl SessionEntry {
    fn new(now: i64) -> Self {
        Self {
            state: tokio::sync::Mutex::new(ConversationState::default()),
            last_used: AtomicI64::new(now),
        }
    }
}

/// Session store keyed by session identifier, with LRU + TTL eviction.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    max_sessions: usize,
    ttl_secs: i64,
}

impl SessionStore {
    pub fn new(max_sessions: usize, ttl_secs: i64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
            ttl_secs,
        }
    }

    /// Fetch or create the entry for `session_id`, refreshing its
    /// last-used stamp and evicting expired or excess sessions.
    pub fn checkout(&self, session_id: &str) -> Arc<SessionEntry> {
        self.checkout_at(session_id, chrono::Utc::now().timestamp())
    }

    fn checkout_at(&self, session_id: &str, now: i64) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");

        sessions.retain(|_, entry| now - entry.last_used.load(Ordering::Relaxed) <= self.ttl_secs);

        if let Some(entry) = sessions.get(session_id) {
            entry.last_used.store(now, Ordering::Relaxed);
            return entry.clone();
        }

        // Room for the new entry: drop least-recently-used sessions.
        while sessions.len() >= self.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    sessions.remove(&key);
                }
                None => break,
            }
        }

        let entry = Arc::new(SessionEntry::new(now));
        sessions.insert(session_id.to_string(), entry.clone());
        entry
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_terms_dedupe_case_insensitively() {
        let mut state = ConversationState::default();
        state.merge_context_terms(&["Acme".into(), "acme".into(), "revenue".into()], 10);
        assert_eq!(state.context_terms(), &["Acme", "revenue"]);
    }

    #[test]
    fn context_terms_evict_oldest_past_cap() {
        let mut state = ConversationState::default();
        state.merge_context_terms(&["one".into(), "two".into(), "three".into()], 2);
        assert_eq!(state.context_terms(), &["two", "three"]);
    }

    #[test]
    fn record_turn_appends_both_roles() {
        let mut state = ConversationState::default();
        state.record_turn("question?", "answer.");
        assert_eq!(state.message_count(), 2);
        let recent = state.recent_messages(2);
        assert_eq!(recent[0].role, Role::User);
        assert_eq!(recent[1].role, Role::Assistant);
    }

    #[test]
    fn recent_messages_windows_from_the_tail() {
        let mut state = ConversationState::default();
        state.record_turn("q1", "a1");
        state.record_turn("q2", "a2");
        let recent = state.recent_messages(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "q2");
    }

    #[test]
    fn same_id_returns_same_entry() {
        let store = SessionStore::new(8, 3600);
        let a = store.checkout_at("s1", 100);
        let b = store.checkout_at("s1", 101);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lru_eviction_drops_least_recent() {
        let store = SessionStore::new(2, 3600);
        store.checkout_at("s1", 100);
        store.checkout_at("s2", 200);
        store.checkout_at("s1", 300); // refresh s1
        store.checkout_at("s3", 400); // evicts s2
        let sessions = store.sessions.lock().unwrap();
        assert!(sessions.contains_key("s1"));
        assert!(!sessions.contains_key("s2"));
        assert!(sessions.contains_key("s3"));
    }

    #[test]
    fn ttl_eviction_drops_idle_sessions() {
        let store = SessionStore::new(8, 60);
        store.checkout_at("s1", 100);
        store.checkout_at("s2", 200); // s1 idle 100s > 60s -> gone
        let sessions = store.sessions.lock().unwrap();
        assert!(!sessions.contains_key("s1"));
        assert!(sessions.contains_key("s2"));
    }
}
