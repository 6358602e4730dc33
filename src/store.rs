//! Per-knowledge-base chunk and embedding store.
//!
//! Owns all durable state for one knowledge base: the chunk table, the
//! FTS5 mirror, the file-hash records, and the monotonic chunk id counter.
//! Every chunk insert or delete touches the FTS table in the same
//! transaction, so the index never diverges from the chunk table.
//!
//! Two ingestion operations:
//! - [`KnowledgeStore::rebuild`] — from-scratch build into a temporary
//!   database file, promoted over the live one with an atomic rename.
//!   Failed builds leave the live database untouched.
//! - [`KnowledgeStore::incremental_update`] — hash-skips unchanged files
//!   and re-ingests changed ones under the configured [`UpdatePolicy`],
//!   one transaction per file.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{ChunkingConfig, UpdatePolicy};
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob, Embedder};
use crate::segment::segment;

/// One raw file prepared for ingestion: document identifier (relative
/// path), extracted text, and the content digest of the raw bytes.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub doc: String,
    pub text: String,
    pub content_hash: String,
}

/// A stored chunk with its embedding decoded.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub doc: String,
    pub chunk_id: i64,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Counters reported by build and update operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub chunks_written: u64,
}

pub struct KnowledgeStore {
    name: String,
    db_path: PathBuf,
    chunking: ChunkingConfig,
    pool: SqlitePool,
}

impl KnowledgeStore {
    /// Open (creating if missing) the knowledge base at
    /// `<data_dir>/<name>.sqlite` and run schema migrations.
    pub async fn open(name: &str, data_dir: &Path, chunking: ChunkingConfig) -> Result<Self> {
        let db_path = data_dir.join(format!("{}.sqlite", name));
        let pool = db::connect(&db_path).await?;
        db::run_migrations(&pool).await?;

        Ok(Self {
            name: name.to_string(),
            db_path,
            chunking,
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Build ============

    /// Destroy and recreate the knowledge base from scratch.
    ///
    /// Builds into `<name>.sqlite.tmp` and promotes it with an atomic
    /// rename only after every file has been written, so readers never
    /// observe a partially rebuilt knowledge base. On failure the
    /// temporary artifacts are removed and the live database is left
    /// as it was.
    pub async fn rebuild(
        &mut self,
        files: &[SourceFile],
        embedder: &dyn Embedder,
    ) -> Result<IngestSummary> {
        let tmp_path = self.db_path.with_extension("sqlite.tmp");
        remove_sqlite_files(&tmp_path);

        // Chunk ids stay monotonic across rebuilds: the fresh database
        // continues from the live counter instead of restarting at 1.
        let carry_next_id: Option<i64> =
            sqlx::query_scalar("SELECT next_chunk_id FROM meta WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .unwrap_or(None);

        let tmp_pool = db::connect(&tmp_path).await?;
        db::run_migrations(&tmp_pool).await?;
        if let Some(next_id) = carry_next_id {
            sqlx::query("UPDATE meta SET next_chunk_id = ? WHERE id = 1")
                .bind(next_id)
                .execute(&tmp_pool)
                .await?;
        }

        let mut summary = IngestSummary::default();

        let result = async {
            for file in files {
                let written =
                    ingest_file(&tmp_pool, file, &self.chunking, embedder, UpdatePolicy::Append)
                        .await?;
                summary.files_processed += 1;
                summary.chunks_written += written;
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        tmp_pool.close().await;

        if let Err(e) = result {
            remove_sqlite_files(&tmp_path);
            return Err(e);
        }

        // Swap the finished build into place. The rename atomically
        // replaces the live file; stale WAL sidecars from the old
        // database are dropped first so they cannot be recovered against
        // the new one.
        self.pool.close().await;
        remove_sidecar_files(&self.db_path);
        std::fs::rename(&tmp_path, &self.db_path)?;

        self.pool = db::connect(&self.db_path).await?;
        Ok(summary)
    }

    // ============ Update ============

    /// Re-ingest changed files, skipping those whose stored content hash
    /// matches. Each file is its own transaction: a failure on one file
    /// does not roll back files already committed, and the FTS mirror
    /// stays consistent for everything that was.
    pub async fn incremental_update(
        &self,
        files: &[SourceFile],
        policy: UpdatePolicy,
        embedder: &dyn Embedder,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();

        for file in files {
            let stored: Option<String> =
                sqlx::query_scalar("SELECT content_hash FROM ingested_files WHERE doc = ?")
                    .bind(&file.doc)
                    .fetch_optional(&self.pool)
                    .await?;

            if stored.as_deref() == Some(file.content_hash.as_str()) {
                summary.files_skipped += 1;
                continue;
            }

            match ingest_file(&self.pool, file, &self.chunking, embedder, policy).await {
                Ok(written) => {
                    summary.files_processed += 1;
                    summary.chunks_written += written;
                }
                Err(e) => {
                    warn!(kb = %self.name, doc = %file.doc, error = %e, "file update failed; continuing");
                    summary.files_failed += 1;
                }
            }
        }

        Ok(summary)
    }

    // ============ Query side ============

    /// Full-text candidates for an FTS5 match expression, best rank first.
    pub async fn keyword_candidates(
        &self,
        match_expr: &str,
        limit: i64,
    ) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.doc, c.chunk_id, c.text, c.embedding
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY chunks_fts.rank
            LIMIT ?
            "#,
        )
        .bind(match_expr)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Unranked scan fallback for queries with no full-text overlap.
    pub async fn scan_candidates(&self, limit: i64) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            "SELECT id, doc, chunk_id, text, embedding FROM chunks ORDER BY id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn document_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM ingested_files")
            .fetch_one(&self.pool)
            .await?)
    }

    // ============ Few-shot example index ============

    /// Cache key of the persisted example index: `(model, files_digest)`.
    pub async fn fewshot_cache_key(&self) -> Result<Option<(String, String)>> {
        let row = sqlx::query("SELECT model, files_digest FROM fewshot_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("model"), r.get("files_digest"))))
    }

    /// Replace the example index wholesale and record its cache key.
    pub async fn replace_fewshot_index(
        &self,
        model: &str,
        files_digest: &str,
        examples: &[(String, String, Vec<f32>)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM fewshot_examples")
            .execute(&mut *tx)
            .await?;

        for (idx, (input_text, output_text, embedding)) in examples.iter().enumerate() {
            sqlx::query(
                "INSERT INTO fewshot_examples (id, input_text, output_text, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(idx as i64 + 1)
            .bind(input_text)
            .bind(output_text)
            .bind(vec_to_blob(embedding))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO fewshot_meta (id, model, files_digest) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET model = excluded.model, files_digest = excluded.files_digest
            "#,
        )
        .bind(model)
        .bind(files_digest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Load the cached example index: `(input_text, output_text, embedding)`.
    pub async fn load_fewshot_examples(&self) -> Result<Vec<(String, String, Vec<f32>)>> {
        let rows = sqlx::query(
            "SELECT input_text, output_text, embedding FROM fewshot_examples ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let blob: Vec<u8> = r.get("embedding");
                (r.get("input_text"), r.get("output_text"), blob_to_vec(&blob))
            })
            .collect())
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRow {
    let blob: Vec<u8> = row.get("embedding");
    ChunkRow {
        id: row.get("id"),
        doc: row.get("doc"),
        chunk_id: row.get("chunk_id"),
        text: row.get("text"),
        embedding: blob_to_vec(&blob),
    }
}

/// Segment, embed, and commit one file in a single transaction.
///
/// Returns the number of chunks written. Empty extractions yield zero
/// chunks but still record the file hash so the file is skipped next time.
async fn ingest_file(
    pool: &SqlitePool,
    file: &SourceFile,
    chunking: &ChunkingConfig,
    embedder: &dyn Embedder,
    policy: UpdatePolicy,
) -> Result<u64> {
    let texts = segment(&file.text, chunking.max_chunk_size, chunking.overlap_size);

    // Embedding happens before the transaction opens: a collaborator
    // failure aborts this file without touching the database.
    let vectors = embedder.embed_batch(&texts).await?;

    let mut tx = pool.begin().await?;

    let position_base: i64 = match policy {
        UpdatePolicy::Replace => {
            sqlx::query(
                "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE doc = ?)",
            )
            .bind(&file.doc)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM chunks WHERE doc = ?")
                .bind(&file.doc)
                .execute(&mut *tx)
                .await?;
            0
        }
        UpdatePolicy::Append => {
            // Superseded chunks stay retrievable; new positions continue
            // past the existing ones so (doc, chunk_id) stays unique.
            sqlx::query_scalar("SELECT COALESCE(MAX(chunk_id) + 1, 0) FROM chunks WHERE doc = ?")
                .bind(&file.doc)
                .fetch_one(&mut *tx)
                .await?
        }
    };

    // Reserve a contiguous id range from the monotonic counter.
    let first_id: i64 = sqlx::query_scalar("SELECT next_chunk_id FROM meta WHERE id = 1")
        .fetch_one(&mut *tx)
        .await?;
    sqlx::query("UPDATE meta SET next_chunk_id = ? WHERE id = 1")
        .bind(first_id + texts.len() as i64)
        .execute(&mut *tx)
        .await?;

    for (i, (text, vector)) in texts.iter().zip(vectors.iter()).enumerate() {
        let id = first_id + i as i64;
        sqlx::query(
            "INSERT INTO chunks (id, doc, chunk_id, text, embedding) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&file.doc)
        .bind(position_base + i as i64)
        .bind(text)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, doc, text) VALUES (?, ?, ?)")
            .bind(id)
            .bind(&file.doc)
            .bind(text)
            .execute(&mut *tx)
            .await?;
    }

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO ingested_files (doc, content_hash, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(doc) DO UPDATE SET
            content_hash = excluded.content_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&file.doc)
    .bind(&file.content_hash)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(texts.len() as u64)
}

/// Remove a SQLite database file along with its WAL sidecars.
fn remove_sqlite_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    remove_sidecar_files(path);
}

fn remove_sidecar_files(path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}
