use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub fewshot: FewshotConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBaseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one SQLite file per knowledge base.
    pub data_dir: PathBuf,
    /// How incremental updates treat changed files: `append` keeps prior
    /// chunks retrievable alongside replacements, `replace` deletes them.
    #[serde(default)]
    pub update_policy: UpdatePolicy,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    #[default]
    Append,
    Replace,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap_size: usize,
}

fn default_overlap() -> usize {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Full-text candidate cap per knowledge base before vector re-ranking.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: i64,
    /// Hits kept per knowledge base and after the global merge.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Hard floor: hits scoring below this are dropped entirely.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Router filter and direct-answer overlap threshold.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            relevance_threshold: default_relevance_threshold(),
        }
    }
}

fn default_candidate_limit() -> i64 {
    80
}
fn default_top_k() -> usize {
    6
}
fn default_min_similarity() -> f32 {
    0.25
}
fn default_relevance_threshold() -> f32 {
    0.38
}

#[derive(Debug, Deserialize, Clone)]
pub struct FewshotConfig {
    /// Examples selected per knowledge base.
    #[serde(default = "default_per_kb_k")]
    pub per_kb_k: usize,
    /// Generated answers with confidence below this become the
    /// insufficient-information outcome.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for FewshotConfig {
    fn default() -> Self {
        Self {
            per_kb_k: default_per_kb_k(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_per_kb_k() -> usize {
    4
}
fn default_min_confidence() -> f32 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_gen_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_gen_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_gen_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    512
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Cap on accumulated context terms per session.
    #[serde(default = "default_max_context_terms")]
    pub max_context_terms: usize,
    /// Recent messages included in generation-fallback prompts.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// LRU bound on live sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Sessions idle longer than this are discarded.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_context_terms: default_max_context_terms(),
            history_window: default_history_window(),
            max_sessions: default_max_sessions(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_max_context_terms() -> usize {
    12
}
fn default_history_window() -> usize {
    6
}
fn default_max_sessions() -> usize {
    256
}
fn default_ttl_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    pub name: String,
    pub docs_root: PathBuf,
    /// Directory of line-delimited JSON example files; optional.
    #[serde(default)]
    pub examples_root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chunk_size == 0 {
        anyhow::bail!("chunking.max_chunk_size must be > 0");
    }
    if config.chunking.overlap_size >= config.chunking.max_chunk_size {
        anyhow::bail!("chunking.overlap_size must be smaller than max_chunk_size");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_limit < config.retrieval.top_k as i64 {
        anyhow::bail!("retrieval.candidate_limit must be >= retrieval.top_k");
    }
    for (name, value) in [
        ("retrieval.min_similarity", config.retrieval.min_similarity),
        (
            "retrieval.relevance_threshold",
            config.retrieval.relevance_threshold,
        ),
        ("fewshot.min_confidence", config.fewshot.min_confidence),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.model.is_empty() {
        anyhow::bail!("embedding.model must be specified");
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    if config.knowledge_bases.is_empty() {
        anyhow::bail!("At least one [[knowledge_bases]] entry is required");
    }
    let mut seen = std::collections::HashSet::new();
    for kb in &config.knowledge_bases {
        if kb.name.trim().is_empty() {
            anyhow::bail!("knowledge base names must not be empty");
        }
        if !seen.insert(kb.name.clone()) {
            anyhow::bail!("duplicate knowledge base name: '{}'", kb.name);
        }
    }

    if config.session.max_sessions == 0 {
        anyhow::bail!("session.max_sessions must be >= 1");
    }

    Ok(())
}
