//! Core data models.
//!
//! Documents, chunks and index entries are produced by an offline build and
//! only ever replaced wholesale by the next build. Messages and
//! conversations live for one chat session.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A source document after text extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Deterministic id derived from the source label.
    pub id: String,
    /// Path relative to the document root; used to tag retrieved text.
    pub source: String,
    pub path: PathBuf,
    /// Detected format (e.g. `"application/pdf"`).
    pub content_type: String,
    pub text: String,
}

/// A contiguous span of one document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub hash: String,
    /// Byte offset of the chunk start within the document text.
    pub start: usize,
    /// Bytes shared with the previous chunk of the same document.
    pub overlap: usize,
}

/// One persisted record of the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub source: String,
    pub text: String,
    pub text_hash: String,
    pub vector: Vec<f32>,
}

impl IndexEntry {
    pub fn from_chunk(chunk: &Chunk, source: &str, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            source: source.to_string(),
            text: chunk.text.clone(),
            text_hash: chunk.hash.clone(),
            vector,
        }
    }
}

/// An index entry paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    /// Position of the entry within the index build it came from.
    pub position: usize,
    pub score: f32,
    pub entry: IndexEntry,
}

/// Hits ranked by descending score, at most `k` long.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredEntry>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Append-only message log for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record a completed exchange. The user message always precedes the answer.
    pub fn push_exchange(&mut self, user: Message, assistant: Message) {
        self.messages.push(user);
        self.messages.push(assistant);
    }
}
