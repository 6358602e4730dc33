//! # Corpus QA
//!
//! A local-first question-answering engine over private document
//! collections. Corpus QA segments documents into retrievable chunks,
//! keeps a per-knowledge-base SQLite store (chunk table + FTS5 mirror +
//! embeddings) with incremental re-indexing, ranks candidates with a
//! full-text prune followed by a cosine re-rank, and routes each
//! conversational turn between a context answer, a few-shot generation
//! fallback, and an honest "insufficient information" outcome.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────┐
//! │ Documents │──▶│   Segmenter   │──▶│  SQLite    │
//! │ txt/md/pdf│   │  + Embedder  │   │ FTS5+Vec  │
//! └───────────┘   └──────────────┘   └─────┬─────┘
//!                                          │
//!                  ┌────────────┐    ┌─────▼─────┐
//!                  │  Few-shot   │◀──▶│  Ranker    │
//!                  │  Selector  │    └─────┬─────┘
//!                  └─────┬──────┘          │
//!                        │      ┌──────────▼─────────┐
//!                        └─────▶│ Conversation Router │
//!                               └──────────┬─────────┘
//!                                ┌─────────┴────────┐
//!                                ▼                  ▼
//!                           ┌─────────┐       ┌──────────┐
//!                           │   CLI   │       │   HTTP   │
//!                           │  (cqa)  │       │  (/ask)  │
//!                           └─────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cqa init                        # create knowledge base databases
//! cqa ingest all --rebuild        # segment + embed every document
//! cqa ask "What is Acme?"         # one-shot question
//! cqa search "refund policy"      # retrieval-only debugging
//! cqa serve                       # start the HTTP surface
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`segment`] | Q/A-aware document segmentation |
//! | [`extract`] | Text extraction (txt, markdown, PDF) |
//! | [`store`] | Per-knowledge-base chunk/embedding store |
//! | [`rank`] | Full-text prune + cosine re-rank + direct Q/A shortcut |
//! | [`fewshot`] | Few-shot example selection and prompts |
//! | [`classify`] | Heuristic turn classification |
//! | [`session`] | Conversation state and session store |
//! | [`router`] | Per-turn routing state machine |
//! | [`embedding`] | Embedding collaborator (`embed(text) -> vector`) |
//! | [`generation`] | Generation collaborator (`generate(prompt) -> text`) |
//! | [`ingest`] | Filesystem scan → store build/update |
//! | [`server`] | HTTP surface |
//! | [`db`] | Database connection + schema |

pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod fewshot;
pub mod generation;
pub mod ingest;
pub mod rank;
pub mod router;
pub mod segment;
pub mod server;
pub mod session;
pub mod store;
