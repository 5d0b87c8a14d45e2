//! Text embedding boundary and turn-pair embedding.
//!
//! The embedding backend is an opaque capability behind [`TextEmbedder`].
//! After a turn completes, the user message and model reply are embedded
//! in the background and written to the vector index with provenance
//! metadata; the model entry records the user text that prompted it so
//! retrieval can surface complete exemplars.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::index::VectorIndex;
use super::types::{VectorEntry, VectorMetadata};
use crate::error::Result;
use crate::session::types::{Message, MessageId, Role, now_epoch_secs};

/// Opaque embedding backend.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Embed one text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Whether a message's content is worth embedding.
pub fn eligible(text: &str, min_chars: usize) -> bool {
    text.trim().chars().count() >= min_chars
}

/// Embed a completed user+model turn pair and store both vectors.
///
/// Skips ineligible (too short) messages. Returns the ids that were
/// embedded so the caller can flag them on the session.
pub async fn embed_turn_pair(
    embedder: &dyn TextEmbedder,
    index: &VectorIndex,
    session_id: &str,
    session_title: &str,
    partner_role: Option<&str>,
    user_message: &Message,
    model_message: &Message,
    min_chars: usize,
) -> Result<Vec<MessageId>> {
    let mut entries = Vec::new();
    let mut embedded_ids = Vec::new();

    if eligible(&user_message.content, min_chars) {
        let vector = embedder.embed(&user_message.content).await?;
        entries.push(VectorEntry {
            id: user_message.id.clone(),
            text: user_message.content.clone(),
            vector,
            timestamp: now_epoch_secs(),
            metadata: VectorMetadata {
                role: Role::User,
                session_id: session_id.to_owned(),
                session_title: session_title.to_owned(),
                preceding_user_text: None,
                partner_role: partner_role.map(str::to_owned),
            },
        });
        embedded_ids.push(user_message.id.clone());
    }

    if eligible(&model_message.content, min_chars) {
        let vector = embedder.embed(&model_message.content).await?;
        entries.push(VectorEntry {
            id: model_message.id.clone(),
            text: model_message.content.clone(),
            vector,
            timestamp: now_epoch_secs(),
            metadata: VectorMetadata {
                role: Role::Model,
                session_id: session_id.to_owned(),
                session_title: session_title.to_owned(),
                preceding_user_text: Some(user_message.content.clone()),
                partner_role: partner_role.map(str::to_owned),
            },
        });
        embedded_ids.push(model_message.id.clone());
    }

    if !entries.is_empty() {
        index.store_vectors_batch(&entries)?;
        debug!(
            session = session_id,
            count = entries.len(),
            "embedded turn pair"
        );
    }
    Ok(embedded_ids)
}

/// A shared, clonable embedder handle.
pub type SharedEmbedder = Arc<dyn TextEmbedder>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChatStore;

    /// Deterministic toy embedder: character-class histogram.
    struct HistogramEmbedder;

    #[async_trait]
    impl TextEmbedder for HistogramEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vector = vec![0.0f32; 4];
            for ch in text.chars() {
                let bucket = match ch {
                    'a'..='m' => 0,
                    'n'..='z' => 1,
                    '0'..='9' => 2,
                    _ => 3,
                };
                vector[bucket] += 1.0;
            }
            Ok(vector)
        }
    }

    fn index() -> VectorIndex {
        VectorIndex::new(Arc::new(ChatStore::open_in_memory().expect("store")))
    }

    #[test]
    fn eligibility_threshold() {
        assert!(eligible("long enough message", 12));
        assert!(!eligible("short", 12));
        assert!(!eligible("            ", 1));
    }

    #[tokio::test]
    async fn embeds_both_halves_of_an_eligible_pair() {
        let idx = index();
        let user = Message::user("please describe the harbor at dusk");
        let model = Message::model("lanterns swing over the quiet water");

        let embedded = embed_turn_pair(
            &HistogramEmbedder,
            &idx,
            "chat_1",
            "Harbor talk",
            Some("Narrator"),
            &user,
            &model,
            10,
        )
        .await
        .expect("embed");

        assert_eq!(embedded, vec![user.id.clone(), model.id.clone()]);
        let stored = idx
            .get_vectors(&[model.id.clone()])
            .expect("get")
            .pop()
            .expect("present");
        assert_eq!(stored.metadata.role, Role::Model);
        assert_eq!(
            stored.metadata.preceding_user_text.as_deref(),
            Some("please describe the harbor at dusk")
        );
        assert_eq!(stored.metadata.partner_role.as_deref(), Some("Narrator"));
    }

    #[tokio::test]
    async fn short_messages_are_skipped() {
        let idx = index();
        let user = Message::user("hi");
        let model = Message::model("a considerably longer reply that clears the bar");

        let embedded = embed_turn_pair(
            &HistogramEmbedder,
            &idx,
            "chat_1",
            "Chat",
            None,
            &user,
            &model,
            10,
        )
        .await
        .expect("embed");

        assert_eq!(embedded, vec![model.id.clone()]);
        assert!(idx.get_vectors(&[user.id.clone()]).expect("get").is_empty());
    }
}
