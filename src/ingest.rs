//! Ingestion orchestration: filesystem scan → Store build/update.
//!
//! Scans each knowledge base's document tree with include/exclude globs,
//! hashes raw bytes, extracts text, and hands the prepared files to the
//! store. Unreadable and unsupported files are logged and skipped; the
//! batch continues. After chunks land, the few-shot example index is
//! refreshed so queries see a consistent knowledge base.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{Config, KnowledgeBaseConfig, UpdatePolicy};
use crate::embedding::create_embedder;
use crate::extract::extract_file;
use crate::fewshot;
use crate::segment::segment;
use crate::store::{KnowledgeStore, SourceFile};

/// Scan one knowledge base's document tree into prepared source files,
/// sorted by document id for deterministic ordering.
pub fn scan_knowledge_base(kb: &KnowledgeBaseConfig) -> Result<Vec<SourceFile>> {
    if !kb.docs_root.exists() {
        bail!(
            "docs_root for knowledge base '{}' does not exist: {}",
            kb.name,
            kb.docs_root.display()
        );
    }

    let include_set = build_globset(&kb.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(kb.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(&kb.docs_root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&kb.docs_root).unwrap_or(path);
        let doc = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&doc) || !include_set.is_match(&doc) {
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(kb = %kb.name, doc = %doc, error = %e, "unreadable file skipped");
                continue;
            }
        };
        let content_hash = format!("{:x}", Sha256::digest(&bytes));

        let text = match extract_file(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(kb = %kb.name, doc = %doc, error = %e, "extraction failed; file skipped");
                continue;
            }
        };
        if text.trim().is_empty() {
            warn!(kb = %kb.name, doc = %doc, "no extractable text; document yields zero chunks");
        }

        files.push(SourceFile {
            doc,
            text,
            content_hash,
        });
    }

    files.sort_by(|a, b| a.doc.cmp(&b.doc));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Select knowledge bases by name, or all of them.
fn select_kbs<'a>(config: &'a Config, selector: &str) -> Result<Vec<&'a KnowledgeBaseConfig>> {
    if selector == "all" {
        return Ok(config.knowledge_bases.iter().collect());
    }
    match config.knowledge_bases.iter().find(|kb| kb.name == selector) {
        Some(kb) => Ok(vec![kb]),
        None => bail!(
            "Unknown knowledge base: '{}'. Configured: {}",
            selector,
            config
                .knowledge_bases
                .iter()
                .map(|kb| kb.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// CLI entry point for `cqa ingest`.
pub async fn run_ingest(
    config: &Config,
    selector: &str,
    rebuild: bool,
    policy_override: Option<UpdatePolicy>,
    dry_run: bool,
) -> Result<()> {
    let kbs = select_kbs(config, selector)?;
    let policy = policy_override.unwrap_or(config.storage.update_policy);

    if dry_run {
        for kb in kbs {
            let files = scan_knowledge_base(kb)?;
            let chunk_estimate: usize = files
                .iter()
                .map(|f| {
                    segment(
                        &f.text,
                        config.chunking.max_chunk_size,
                        config.chunking.overlap_size,
                    )
                    .len()
                })
                .sum();
            println!("ingest {} (dry-run)", kb.name);
            println!("  files found: {}", files.len());
            println!("  estimated chunks: {}", chunk_estimate);
        }
        return Ok(());
    }

    let embedder = create_embedder(&config.embedding)?;

    for kb in kbs {
        let files = scan_knowledge_base(kb)?;
        let mut store =
            KnowledgeStore::open(&kb.name, &config.storage.data_dir, config.chunking.clone())
                .await?;

        let summary = if rebuild {
            store.rebuild(&files, embedder.as_ref()).await?
        } else {
            store
                .incremental_update(&files, policy, embedder.as_ref())
                .await?
        };

        println!("ingest {}{}", kb.name, if rebuild { " (rebuild)" } else { "" });
        println!("  files found: {}", files.len());
        println!("  processed: {}", summary.files_processed);
        println!("  skipped (unchanged): {}", summary.files_skipped);
        println!("  failed: {}", summary.files_failed);
        println!("  chunks written: {}", summary.chunks_written);

        if let Some(examples_root) = &kb.examples_root {
            let count = fewshot::ensure_index(&store, examples_root, embedder.as_ref()).await?;
            println!("  examples indexed: {}", count);
        }

        store.close().await;
    }

    println!("ok");
    Ok(())
}

/// CLI entry point for `cqa examples rebuild`.
pub async fn run_examples_rebuild(config: &Config, selector: &str) -> Result<()> {
    let kbs = select_kbs(config, selector)?;
    let embedder = create_embedder(&config.embedding)?;

    for kb in kbs {
        let Some(examples_root) = &kb.examples_root else {
            println!("examples {}: no examples_root configured", kb.name);
            continue;
        };
        let store =
            KnowledgeStore::open(&kb.name, &config.storage.data_dir, config.chunking.clone())
                .await?;
        let count = fewshot::rebuild_index(&store, examples_root, embedder.as_ref()).await?;
        println!("examples {}: {} indexed", kb.name, count);
        store.close().await;
    }

    println!("ok");
    Ok(())
}

/// CLI entry point for `cqa stats`.
pub async fn run_stats(config: &Config) -> Result<()> {
    for kb in &config.knowledge_bases {
        let store =
            KnowledgeStore::open(&kb.name, &config.storage.data_dir, config.chunking.clone())
                .await?;
        let docs = store.document_count().await?;
        let chunks = store.chunk_count().await?;
        let examples = store.load_fewshot_examples().await?.len();
        println!("{}", kb.name);
        println!("  documents: {}", docs);
        println!("  chunks: {}", chunks);
        println!("  examples: {}", examples);
        store.close().await;
    }
    Ok(())
}
