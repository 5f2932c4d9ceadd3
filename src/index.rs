//! Vector index: immutable snapshots, persistence, and atomic swap.
//!
//! A [`VectorIndex`] is built once from a complete set of [`IndexEntry`]s and
//! never mutated afterwards. Search is exact brute force over every entry,
//! so results depend only on the entries and the query, and a persisted
//! index answers every query exactly like the one that was written.
//!
//! [`IndexHandle`] is the shared, swappable reference serving code reads
//! from. Readers clone the current `Arc` and search without holding any
//! lock; a rebuild constructs a new snapshot elsewhere and publishes it with
//! one pointer replacement, so a search sees either the old index or the
//! new one, never a mix.
//!
//! # On-disk layout
//!
//! One SQLite file with two tables:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `index_meta` | format version, embedding model id, dims, metric, entry count, build time |
//! | `entries` | position, chunk/document identity, source label, text, text hash, vector BLOB |
//!
//! Vectors are stored as little-endian `f32` bytes. The file is written
//! under a temporary name and renamed into place.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::RagError;
use crate::models::{IndexEntry, RetrievalResult, ScoredEntry};

/// Bumped whenever the on-disk layout changes.
pub const FORMAT_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    Dot,
    /// Scored as the negated distance so that higher is always closer.
    Euclidean,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
            Metric::Euclidean => "euclidean",
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => dot(a, b),
            Metric::Euclidean => -euclidean_distance(a, b),
        }
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "dot" => Ok(Metric::Dot),
            "euclidean" => Ok(Metric::Euclidean),
            other => bail!("Unknown metric: {}", other),
        }
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-length vector.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let denom = dot(a, a).sqrt() * dot(b, b).sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Encode a vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian `f32` bytes. Trailing bytes that do not form a
/// whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// An immutable, searchable set of embedded chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    model_id: String,
    dims: usize,
    metric: Metric,
    built_at: i64,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Build a fresh index. Every vector must have exactly `dims` components.
    pub fn build(
        model_id: &str,
        dims: usize,
        metric: Metric,
        entries: Vec<IndexEntry>,
    ) -> Result<Self> {
        if model_id.is_empty() {
            bail!("index model id must not be empty");
        }
        if dims == 0 {
            bail!("index dims must be > 0");
        }
        for (position, entry) in entries.iter().enumerate() {
            if entry.vector.len() != dims {
                bail!(
                    "entry {} ({}) has {} dimensions, expected {}",
                    position,
                    entry.chunk_id,
                    entry.vector.len(),
                    dims
                );
            }
        }
        Ok(Self {
            model_id: model_id.to_string(),
            dims,
            metric,
            built_at: chrono::Utc::now().timestamp(),
            entries,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn built_at(&self) -> i64 {
        self.built_at
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.document_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// The `k` entries closest to `query`, best first. Equal scores keep
    /// build order, so identical queries always return identical results.
    pub fn search(&self, query: &[f32], k: usize) -> RetrievalResult {
        if k == 0 || self.entries.is_empty() {
            return RetrievalResult::default();
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let score = self.metric.score(query, &entry.vector);
                (position, if score.is_nan() { f32::NEG_INFINITY } else { score })
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        RetrievalResult {
            hits: scored
                .into_iter()
                .map(|(position, score)| ScoredEntry {
                    position,
                    score,
                    entry: self.entries[position].clone(),
                })
                .collect(),
        }
    }

    /// Write the index to `path`, replacing any existing file only once the
    /// new one is complete.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let tmp = temp_path_for(path);
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }

        let pool = connect(&tmp, false).await?;
        let written = self.write_tables(&pool).await;
        pool.close().await;
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        std::fs::rename(&tmp, path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                tmp.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    async fn write_tables(&self, pool: &SqlitePool) -> Result<()> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE index_meta (
                format_version INTEGER NOT NULL,
                model TEXT NOT NULL,
                dims INTEGER NOT NULL,
                metric TEXT NOT NULL,
                entry_count INTEGER NOT NULL,
                built_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE entries (
                position INTEGER PRIMARY KEY,
                chunk_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                source TEXT NOT NULL,
                text TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                vector BLOB NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO index_meta (format_version, model, dims, metric, entry_count, built_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(FORMAT_VERSION)
        .bind(&self.model_id)
        .bind(self.dims as i64)
        .bind(self.metric.as_str())
        .bind(self.entries.len() as i64)
        .bind(self.built_at)
        .execute(&mut *tx)
        .await?;

        for (position, entry) in self.entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO entries (position, chunk_id, document_id, chunk_index, source, text, text_hash, vector) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(position as i64)
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(entry.chunk_index)
            .bind(&entry.source)
            .bind(&entry.text)
            .bind(&entry.text_hash)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Read an index written by [`persist`](Self::persist).
    ///
    /// A missing, unreadable, or inconsistent file is reported as
    /// [`RagError::IndexUnavailable`].
    pub async fn load(path: &Path) -> Result<Self, RagError> {
        if !path.is_file() {
            return Err(RagError::IndexUnavailable(format!(
                "no index file at {}",
                path.display()
            )));
        }
        Self::read(path).await.map_err(|e| {
            RagError::IndexUnavailable(format!("{}: {:#}", path.display(), e))
        })
    }

    async fn read(path: &Path) -> Result<Self> {
        let pool = connect(path, true).await?;
        let result = Self::read_tables(&pool).await;
        pool.close().await;
        result
    }

    async fn read_tables(pool: &SqlitePool) -> Result<Self> {
        let (format_version, model_id, dims, metric, entry_count, built_at): (
            i64,
            String,
            i64,
            String,
            i64,
            i64,
        ) = sqlx::query_as(
            "SELECT format_version, model, dims, metric, entry_count, built_at FROM index_meta",
        )
        .fetch_one(pool)
        .await
        .context("missing index metadata")?;

        if format_version != FORMAT_VERSION {
            bail!(
                "unsupported index format version {} (expected {})",
                format_version,
                FORMAT_VERSION
            );
        }
        if dims <= 0 {
            bail!("invalid dims {}", dims);
        }
        let dims = dims as usize;
        let metric: Metric = metric.parse()?;

        let rows: Vec<(i64, String, String, i64, String, String, String, Vec<u8>)> =
            sqlx::query_as(
                "SELECT position, chunk_id, document_id, chunk_index, source, text, text_hash, vector FROM entries ORDER BY position",
            )
            .fetch_all(pool)
            .await
            .context("failed to read entries")?;

        if rows.len() as i64 != entry_count {
            bail!(
                "index is truncated: metadata records {} entries, found {}",
                entry_count,
                rows.len()
            );
        }

        let mut entries = Vec::with_capacity(rows.len());
        for (expected, row) in rows.into_iter().enumerate() {
            let (position, chunk_id, document_id, chunk_index, source, text, text_hash, blob) = row;
            if position != expected as i64 {
                bail!("entry positions are not contiguous at {}", expected);
            }
            if blob.len() != dims * 4 {
                bail!(
                    "entry {} has a {}-byte vector, expected {}",
                    position,
                    blob.len(),
                    dims * 4
                );
            }
            entries.push(IndexEntry {
                chunk_id,
                document_id,
                chunk_index,
                source,
                text,
                text_hash,
                vector: blob_to_vec(&blob),
            });
        }

        Ok(Self {
            model_id,
            dims,
            metric,
            built_at,
            entries,
        })
    }
}

/// Sibling path the index is written to before being renamed into place.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "index".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

async fn connect(path: &Path, read_only: bool) -> Result<SqlitePool> {
    let mut options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(!read_only)
        .read_only(read_only);
    if !read_only {
        // Rollback journal keeps the artifact a single self-contained file.
        options = options.journal_mode(SqliteJournalMode::Delete);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open index database {}", path.display()))?;

    Ok(pool)
}

enum Slot {
    Ready(Arc<VectorIndex>),
    Unavailable(String),
}

/// Shared reference to the active index.
pub struct IndexHandle {
    slot: RwLock<Slot>,
}

impl IndexHandle {
    pub fn new(index: VectorIndex) -> Self {
        Self {
            slot: RwLock::new(Slot::Ready(Arc::new(index))),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            slot: RwLock::new(Slot::Unavailable(reason.into())),
        }
    }

    /// Load the persisted index at `path`. Never fails: a missing or corrupt
    /// file yields a handle that reports the index as unavailable.
    pub async fn open(path: &Path) -> Self {
        match VectorIndex::load(path).await {
            Ok(index) => {
                tracing::info!(
                    path = %path.display(),
                    entries = index.len(),
                    model = index.model_id(),
                    "Loaded index"
                );
                Self::new(index)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Index unavailable");
                Self::unavailable(e.to_string())
            }
        }
    }

    /// The index in force right now. The returned snapshot stays valid even
    /// if another index is published while it is in use.
    pub fn snapshot(&self) -> Result<Arc<VectorIndex>, RagError> {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            Slot::Ready(index) => Ok(Arc::clone(index)),
            Slot::Unavailable(reason) => Err(RagError::IndexUnavailable(reason.clone())),
        }
    }

    pub fn is_available(&self) -> bool {
        self.snapshot().is_ok()
    }

    /// Make `index` the active index.
    pub fn publish(&self, index: VectorIndex) {
        let next = Arc::new(index);
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        *slot = Slot::Ready(next);
    }

    /// Load the index at `path` off to the side and publish it. On failure
    /// the current index, if any, stays active.
    pub async fn reload(&self, path: &Path) -> Result<(), RagError> {
        let index = VectorIndex::load(path).await?;
        tracing::info!(
            path = %path.display(),
            entries = index.len(),
            model = index.model_id(),
            "Swapping in reloaded index"
        );
        self.publish(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: id.to_string(),
            document_id: format!("doc-{}", id),
            chunk_index: 0,
            source: format!("{}.md", id),
            text: format!("text of {}", id),
            text_hash: "h".to_string(),
            vector,
        }
    }

    fn sample_index() -> VectorIndex {
        VectorIndex::build(
            "test-model",
            2,
            Metric::Cosine,
            vec![
                entry("east", vec![1.0, 0.0]),
                entry("north", vec![0.0, 1.0]),
                entry("northeast", vec![1.0, 1.0]),
                entry("west", vec![-1.0, 0.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_blob_codec_is_exact() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001, f32::MIN_POSITIVE];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), v.len() * 4);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn test_build_rejects_mixed_dimensions() {
        let err = VectorIndex::build(
            "m",
            2,
            Metric::Cosine,
            vec![entry("a", vec![1.0, 0.0]), entry("b", vec![1.0, 0.0, 0.0])],
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let index = sample_index();
        let result = index.search(&[1.0, 0.1], 3);
        let ids: Vec<&str> = result.hits.iter().map(|h| h.entry.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["east", "northeast", "north"]);
        for pair in result.hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_search_returns_at_most_k() {
        let index = sample_index();
        assert_eq!(index.search(&[1.0, 0.0], 2).len(), 2);
        assert_eq!(index.search(&[1.0, 0.0], 10).len(), 4);
        assert!(index.search(&[1.0, 0.0], 0).is_empty());
    }

    #[test]
    fn test_ties_keep_build_order() {
        let index = VectorIndex::build(
            "m",
            2,
            Metric::Cosine,
            vec![
                entry("first", vec![1.0, 0.0]),
                entry("second", vec![2.0, 0.0]),
                entry("third", vec![3.0, 0.0]),
            ],
        )
        .unwrap();
        for _ in 0..3 {
            let result = index.search(&[1.0, 0.0], 3);
            let positions: Vec<usize> = result.hits.iter().map(|h| h.position).collect();
            assert_eq!(positions, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_euclidean_scores_closer_higher() {
        let index = VectorIndex::build(
            "m",
            2,
            Metric::Euclidean,
            vec![entry("far", vec![10.0, 10.0]), entry("near", vec![1.0, 1.0])],
        )
        .unwrap();
        let result = index.search(&[0.0, 0.0], 2);
        assert_eq!(result.hits[0].entry.chunk_id, "near");
    }

    #[test]
    fn test_empty_index_search() {
        let index = VectorIndex::build("m", 3, Metric::Cosine, Vec::new()).unwrap();
        assert!(index.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }

    #[tokio::test]
    async fn test_persist_load_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("index.sqlite");
        let index = sample_index();
        index.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap();
        assert_eq!(loaded, index);
        for probe in [[1.0, 0.0], [0.3, 0.9], [-1.0, -1.0]] {
            assert_eq!(loaded.search(&probe, 3), index.search(&probe, 3));
        }
        assert!(!temp_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_persist_overwrites_previous_index() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        sample_index().persist(&path).await.unwrap();

        let smaller =
            VectorIndex::build("other-model", 2, Metric::Dot, vec![entry("only", vec![0.5, 0.5])])
                .unwrap();
        smaller.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.model_id(), "other-model");
        assert_eq!(loaded.metric(), Metric::Dot);
    }

    #[tokio::test]
    async fn test_missing_index_is_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = VectorIndex::load(&tmp.path().join("absent.sqlite"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn test_corrupt_index_is_unavailable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("index.sqlite");
        std::fs::write(&path, b"this is not a database").unwrap();
        let err = VectorIndex::load(&path).await.unwrap_err();
        assert!(matches!(err, RagError::IndexUnavailable(_)));

        let handle = IndexHandle::open(&path).await;
        assert!(!handle.is_available());
    }

    #[test]
    fn test_snapshot_survives_publish() {
        let handle = IndexHandle::new(sample_index());
        let before = handle.snapshot().unwrap();

        let replacement =
            VectorIndex::build("m2", 2, Metric::Cosine, vec![entry("new", vec![0.0, 1.0])]).unwrap();
        handle.publish(replacement);

        assert_eq!(before.len(), 4);
        assert_eq!(handle.snapshot().unwrap().len(), 1);
        assert_eq!(handle.snapshot().unwrap().model_id(), "m2");
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_index() {
        let tmp = tempfile::TempDir::new().unwrap();
        let handle = IndexHandle::new(sample_index());
        let err = handle
            .reload(&tmp.path().join("missing.sqlite"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
        assert_eq!(handle.snapshot().unwrap().len(), 4);
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let handle = Arc::new(IndexHandle::new(sample_index()));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snap = handle.snapshot().unwrap();
                        let n = snap.len();
                        assert!(n == 4 || n == 1);
                        assert_eq!(snap.search(&[1.0, 0.0], 10).len(), n);
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            handle.publish(
                VectorIndex::build("m", 2, Metric::Cosine, vec![entry("x", vec![1.0, 0.0])])
                    .unwrap(),
            );
            handle.publish(sample_index());
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
