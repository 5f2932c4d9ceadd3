//! # docqa
//!
//! Question answering over a private document collection by
//! retrieval-augmented generation.
//!
//! Documents are extracted, chunked, embedded and written to a persisted
//! vector index by an offline build. At query time the question is embedded
//! with the same model, the nearest chunks are retrieved, and a bounded
//! prompt is assembled for an external generation service.
//!
//! ## Architecture
//!
//! ```text
//!  offline build                              query path
//! ┌──────────┐  ┌─────────┐  ┌──────────┐    ┌───────────┐  ┌──────────┐  ┌───────────┐
//! │  ingest  │─▶│embedding│─▶│  index   │◀───│ retrieve  │─▶│  prompt  │─▶│ generate  │
//! │ extract  │  │ service │  │ (SQLite) │    └───────────┘  └──────────┘  └───────────┘
//! │  chunk   │  └─────────┘  └──────────┘          ▲              chat orchestrator │
//! └──────────┘                                     └────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and chat error contract |
//! | [`models`] | Core data types |
//! | [`extract`] | Format-sniffed text extraction |
//! | [`chunk`] | Overlapping text chunker |
//! | [`ingest`] | Document discovery and index build |
//! | [`embedding`] | Embedding service and backends |
//! | [`index`] | Vector index, persistence, atomic swap |
//! | [`retrieve`] | Top-k retrieval |
//! | [`prompt`] | Bounded prompt assembly |
//! | [`generate`] | Answer generation with retries |
//! | [`chat`] | Per-turn orchestration |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod models;
pub mod prompt;
pub mod retrieve;
