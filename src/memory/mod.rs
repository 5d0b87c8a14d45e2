//! Vector memory: embeddings, similarity search, exemplar retrieval.

pub mod embedder;
pub mod index;
pub mod types;

pub use embedder::{SharedEmbedder, TextEmbedder, embed_turn_pair};
pub use index::{SearchFilter, VectorIndex, build_exemplars, cosine_similarity};
pub use types::{Exemplar, MetadataPatch, ScoredVector, VectorEntry, VectorMetadata};
