//! factgate — a knowledge core with provenance gating.
//!
//! Facts enter through [`ingest`], wait in a verification queue until a
//! reviewer approves or rejects them ([`verify`]), and are retrieved with a
//! hybrid keyword + vector engine ([`search`]). Facts extracted during chat
//! sessions carry a session association and follow their own end-of-session
//! lifecycle ([`session`]).
//!
//! Storage is pluggable behind the [`store::FactStore`] trait, with SQLite
//! (FTS5 + brute-force cosine over stored embeddings) as the durable
//! backend and an in-memory store for tests. Embedding and answer synthesis
//! go through the [`provider::ModelProvider`] trait; everything works
//! without a provider, minus the vector channel and RAG.

pub mod config;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod provider;
pub mod search;
pub mod server;
pub mod session;
pub mod store;
pub mod verify;

pub use error::{Error, Result};
