//! wisp: local-first streaming conversation engine.
//!
//! The engine behind a chat client for a generative-AI API. It drives
//! long-lived, cancelable streaming request/response cycles, mirrors
//! conversation state between memory and an embedded SQLite database,
//! and maintains content-addressed caches of derived artifacts
//! (synthesized speech segments, embedding vectors) keyed by message
//! identity.
//!
//! # Architecture
//!
//! Leaf-first:
//! - **store**: the durable SQLite authority of record (sessions, app
//!   metadata, audio blobs, vector index)
//! - **session**: the in-memory session of record, its single mutation
//!   primitive, and debounced write-through persistence
//! - **provider**: the opaque streaming-completion boundary (one
//!   OpenAI-compatible SSE adapter included)
//! - **memory**: embedding vectors and cosine-similarity exemplar
//!   retrieval
//! - **audio**: the speech-segment cache with watermark discipline and
//!   at-most-one-fetch synthesis
//! - **engine**: the streaming response state machine, regeneration,
//!   and deletion cascades
//!
//! Orchestration is single-threaded cooperative on the tokio event
//! loop; CPU-heavy work belongs in `spawn_blocking` and background
//! side effects are fire-and-forget tasks that never block a turn.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod provider;
pub mod session;
pub mod store;

/// Install the default tracing subscriber, honoring `RUST_LOG`.
///
/// Call once from the embedding application; repeated calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub use config::EngineConfig;
pub use engine::{LiveStream, ResponseEngine};
pub use error::{EngineError, ProviderFailure, Result};
pub use session::{Message, Role, Session, SessionController, SessionSettings};
pub use store::{ChatStore, StoreError};
