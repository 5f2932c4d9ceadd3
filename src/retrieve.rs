//! Retriever: query text in, ranked index entries out.
//!
//! Every call takes one snapshot of the active index and uses it for the
//! whole request, so a concurrent swap never changes results mid-query.

use std::sync::Arc;

use crate::embedding::EmbeddingService;
use crate::error::RagError;
use crate::index::IndexHandle;
use crate::models::RetrievalResult;

pub struct Retriever {
    embedder: Arc<EmbeddingService>,
    index: Arc<IndexHandle>,
}

impl Retriever {
    pub fn new(embedder: Arc<EmbeddingService>, index: Arc<IndexHandle>) -> Self {
        Self { embedder, index }
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    /// Embed `query` and return the `k` closest entries.
    ///
    /// An index with zero entries yields an empty result. An index built
    /// with a different embedding model is reported as
    /// [`RagError::ModelMismatch`] before the query is embedded.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResult, RagError> {
        let index = self.index.snapshot()?;

        if index.model_id() != self.embedder.model_id() || index.dims() != self.embedder.dims() {
            return Err(RagError::ModelMismatch {
                index_model: format!("{} ({} dims)", index.model_id(), index.dims()),
                active_model: format!(
                    "{} ({} dims)",
                    self.embedder.model_id(),
                    self.embedder.dims()
                ),
            });
        }

        if index.is_empty() || k == 0 {
            return Ok(RetrievalResult::default());
        }

        let embedded = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| RagError::Embedding(e.to_string()))?;

        let result = index.search(&embedded.vector, k);
        tracing::debug!(k, hits = result.len(), "Retrieved context");
        Ok(result)
    }
}
