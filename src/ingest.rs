//! Document ingestion and the index build.
//!
//! Coordinates the offline flow: discovery → extraction → chunking →
//! embedding → index build → persist. One bad document never stops the
//! build; it is skipped and recorded as an [`IngestionWarning`]. The build
//! outcome is summarized in a [`BuildReport`] whose [`BuildStatus`] maps to
//! the process exit code.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{chunk_text, ChunkPolicy};
use crate::config::{Config, DocumentsConfig};
use crate::embedding::EmbeddingService;
use crate::error::IngestionWarning;
use crate::extract::extract_document;
use crate::index::{Metric, VectorIndex};
use crate::models::{Chunk, Document, IndexEntry};

/// A file selected for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the document root, `/`-separated.
    pub relative: String,
}

/// Walk the document root and return matching files in path order.
///
/// Unreadable directory entries and oversized files become warnings.
pub fn discover(config: &DocumentsConfig) -> Result<(Vec<SourceFile>, Vec<IngestionWarning>)> {
    let root = &config.root;
    if !root.is_dir() {
        bail!("Document root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    let mut warnings = Vec::new();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                warnings.push(IngestionWarning {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > config.max_file_bytes {
            tracing::warn!(path = %path.display(), size, "Skipping oversized document");
            warnings.push(IngestionWarning {
                path: path.to_path_buf(),
                reason: format!(
                    "file is {} bytes, limit is {}",
                    size, config.max_file_bytes
                ),
            });
            continue;
        }

        files.push(SourceFile {
            path: path.to_path_buf(),
            relative,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok((files, warnings))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Read and extract one file. Document ids are stable across builds for an
/// unchanged relative path.
pub fn load_document(file: &SourceFile) -> Result<Document, IngestionWarning> {
    let warn = |reason: String| IngestionWarning {
        path: file.path.clone(),
        reason,
    };
    let bytes = std::fs::read(&file.path).map_err(|e| warn(e.to_string()))?;
    let (format, text) = extract_document(&file.path, &bytes).map_err(|e| warn(e.to_string()))?;

    Ok(Document {
        id: document_id(&file.relative),
        source: file.relative.clone(),
        path: file.path.clone(),
        content_type: format.content_type().to_string(),
        text,
    })
}

pub fn document_id(relative: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, relative.as_bytes()).to_string()
}

/// Documents that were loaded, and the problems with those that were not.
#[derive(Debug, Default)]
pub struct Ingested {
    pub found: usize,
    pub documents: Vec<Document>,
    pub warnings: Vec<IngestionWarning>,
}

/// Discover and extract every document under the root.
pub fn ingest(config: &DocumentsConfig) -> Result<Ingested> {
    let (files, mut warnings) = discover(config)?;
    let found = files.len() + warnings.len();
    let mut documents = Vec::with_capacity(files.len());

    for file in &files {
        match load_document(file) {
            Ok(document) => {
                if document.text.trim().is_empty() {
                    tracing::info!(path = %file.path.display(), "Document has no extractable text");
                }
                documents.push(document);
            }
            Err(warning) => {
                tracing::warn!(path = %warning.path.display(), error = %warning.reason, "Skipping document");
                warnings.push(warning);
            }
        }
    }

    Ok(Ingested {
        found,
        documents,
        warnings,
    })
}

/// Chunk every document, pairing each chunk with its document's source label.
pub fn chunk_documents(documents: &[Document], policy: &ChunkPolicy) -> Vec<(String, Chunk)> {
    documents
        .iter()
        .flat_map(|doc| {
            chunk_text(&doc.id, &doc.text, policy)
                .into_iter()
                .map(move |chunk| (doc.source.clone(), chunk))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    /// Built, but some documents or chunks were skipped.
    Partial,
    Failed,
}

impl BuildStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::Failed => 1,
            BuildStatus::Partial => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Success => "ok",
            BuildStatus::Partial => "partial",
            BuildStatus::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub documents_found: usize,
    pub documents_indexed: usize,
    pub chunks: usize,
    pub entries: usize,
    pub truncated: usize,
    pub model_id: String,
    pub warnings: Vec<IngestionWarning>,
}

impl BuildReport {
    fn classify(&mut self) {
        self.status = if self.documents_found > 0 && self.documents_indexed == 0 {
            BuildStatus::Failed
        } else if !self.warnings.is_empty() {
            BuildStatus::Partial
        } else {
            BuildStatus::Success
        };
    }
}

/// Build a fresh index in memory from the configured document root.
pub async fn build_index(
    config: &Config,
    embedder: &EmbeddingService,
) -> Result<(VectorIndex, BuildReport)> {
    let metric: Metric = config.index.metric.parse()?;
    let ingested = ingest(&config.documents)?;
    let policy = ChunkPolicy::from(&config.chunking);
    let chunks = chunk_documents(&ingested.documents, &policy);

    let texts: Vec<String> = chunks.iter().map(|(_, c)| c.text.clone()).collect();
    let embedded = embedder.embed_batch(&texts).await;

    let mut warnings = ingested.warnings;
    let mut entries = Vec::with_capacity(chunks.len());
    let mut truncated = 0;
    let mut failed_docs: Vec<&str> = Vec::new();

    for ((source, chunk), result) in chunks.iter().zip(embedded) {
        match result {
            Ok(e) => {
                if e.truncated {
                    truncated += 1;
                }
                entries.push(IndexEntry::from_chunk(chunk, source, e.vector));
            }
            Err(e) => {
                let path = config.documents.root.join(source);
                tracing::warn!(
                    path = %path.display(),
                    chunk = chunk.chunk_index,
                    error = %e,
                    "Skipping chunk that failed to embed"
                );
                warnings.push(IngestionWarning {
                    path,
                    reason: format!("chunk {}: {}", chunk.chunk_index, e),
                });
                if !failed_docs.contains(&chunk.document_id.as_str()) {
                    failed_docs.push(&chunk.document_id);
                }
            }
        }
    }

    let documents_indexed = ingested
        .documents
        .iter()
        .filter(|d| !failed_docs.contains(&d.id.as_str()))
        .count();

    let index = VectorIndex::build(embedder.model_id(), embedder.dims(), metric, entries)?;

    let mut report = BuildReport {
        status: BuildStatus::Success,
        documents_found: ingested.found,
        documents_indexed,
        chunks: chunks.len(),
        entries: index.len(),
        truncated,
        model_id: embedder.model_id().to_string(),
        warnings,
    };
    report.classify();

    Ok((index, report))
}

/// Build the index and write it to `config.index.path`. A failed build
/// leaves any existing index file untouched.
pub async fn run_build(config: &Config, embedder: &EmbeddingService) -> Result<BuildReport> {
    let (index, report) = build_index(config, embedder).await?;
    if report.status == BuildStatus::Failed {
        tracing::error!(
            found = report.documents_found,
            "No documents could be indexed; keeping the previous index"
        );
        return Ok(report);
    }

    index.persist(&config.index.path).await?;
    tracing::info!(
        path = %config.index.path.display(),
        entries = index.len(),
        model = index.model_id(),
        "Index written"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::embedding::HashEmbedder;
    use tempfile::TempDir;

    fn config_for(root: &Path, index: &Path) -> Config {
        parse_config(&format!(
            r#"
[documents]
root = "{}"

[chunking]
max_chars = 200
overlap_chars = 40
min_chars = 5

[index]
path = "{}"
"#,
            root.display(),
            index.display()
        ))
        .unwrap()
    }

    fn embedder(config: &Config) -> EmbeddingService {
        EmbeddingService::new(Box::new(HashEmbedder::new(64)), &config.embedding)
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("b.md"), "# B").unwrap();
        std::fs::write(root.join("a.txt"), "A").unwrap();
        std::fs::write(root.join("sub/c.md"), "C").unwrap();
        std::fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(root.join(".git/notes.md"), "ignored").unwrap();

        let config = config_for(root, &root.join("index.sqlite"));
        let (files, warnings) = discover(&config.documents).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.md", "sub/c.md"]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = config_for(&tmp.path().join("nope"), &tmp.path().join("i.sqlite"));
        assert!(discover(&config.documents).is_err());
    }

    #[test]
    fn test_oversized_file_is_warned() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("big.txt"), "x".repeat(100)).unwrap();
        let mut config = config_for(tmp.path(), &tmp.path().join("i.sqlite"));
        config.documents.max_file_bytes = 10;
        let (files, warnings) = discover(&config.documents).unwrap();
        assert!(files.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_unreadable_document_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("good.md"), "A perfectly good document body.").unwrap();
        std::fs::write(tmp.path().join("broken.pdf"), b"definitely not a pdf").unwrap();
        let config = config_for(tmp.path(), &tmp.path().join("i.sqlite"));

        let ingested = ingest(&config.documents).unwrap();
        assert_eq!(ingested.found, 2);
        assert_eq!(ingested.documents.len(), 1);
        assert_eq!(ingested.documents[0].source, "good.md");
        assert_eq!(ingested.warnings.len(), 1);
        assert!(ingested.warnings[0].path.ends_with("broken.pdf"));
    }

    #[test]
    fn test_document_ids_stable() {
        assert_eq!(document_id("notes/a.md"), document_id("notes/a.md"));
        assert_ne!(document_id("notes/a.md"), document_id("notes/b.md"));
    }

    #[tokio::test]
    async fn test_rebuild_is_reproducible() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        let body = (0..30)
            .map(|i| format!("Sentence {} about deterministic chunking.", i))
            .collect::<Vec<_>>()
            .join(" ");
        std::fs::write(docs.join("long.md"), &body).unwrap();
        std::fs::write(docs.join("blank.txt"), "   \n").unwrap();

        let config = config_for(&docs, &tmp.path().join("i.sqlite"));
        let embedder = embedder(&config);
        let (first, report) = build_index(&config, &embedder).await.unwrap();
        let (second, _) = build_index(&config, &embedder).await.unwrap();

        assert_eq!(report.status, BuildStatus::Success);
        assert_eq!(report.documents_found, 2);
        assert!(report.entries > 1);
        assert_eq!(first.entries(), second.entries());
    }

    #[tokio::test]
    async fn test_partial_build_status() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("good.md"), "Paris is the capital of France.").unwrap();
        std::fs::write(docs.join("bad.pdf"), b"garbage").unwrap();

        let index_path = tmp.path().join("i.sqlite");
        let config = config_for(&docs, &index_path);
        let report = run_build(&config, &embedder(&config)).await.unwrap();
        assert_eq!(report.status, BuildStatus::Partial);
        assert_eq!(report.status.exit_code(), 2);
        assert_eq!(report.entries, 1);
        assert!(index_path.exists());
    }

    #[tokio::test]
    async fn test_all_documents_failing_is_failure() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("bad.pdf"), b"garbage").unwrap();

        let index_path = tmp.path().join("i.sqlite");
        let config = config_for(&docs, &index_path);
        let report = run_build(&config, &embedder(&config)).await.unwrap();
        assert_eq!(report.status, BuildStatus::Failed);
        assert_eq!(report.status.exit_code(), 1);
        assert!(!index_path.exists());
    }
}
