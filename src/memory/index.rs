//! Vector memory index.
//!
//! Maps message ids to embedding vectors with provenance metadata and
//! answers similarity queries. Search is an explicit full scan with
//! cosine similarity; the index is local and small, so no approximate
//! structure is warranted.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::types::{Exemplar, MetadataPatch, ScoredVector, VectorEntry};
use crate::config::MemoryPolicy;
use crate::error::Result;
use crate::session::types::{MessageId, Role, SessionId};
use crate::store::ChatStore;

/// Cosine similarity between two vectors.
///
/// Pure `dot(a, b) / (||a|| * ||b||)`: NaN if either vector is all-zero.
/// Callers must treat NaN as "not relevant" rather than propagate it.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have equal length");
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (norm_a * norm_b)
}

/// Candidate filter for similarity search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict hits to these sessions; `None` admits every session.
    pub allowed_sessions: Option<HashSet<SessionId>>,
    /// Restrict hits to model replies. Memory search surfaces past
    /// assistant replies as style exemplars, so this is the common case.
    pub model_replies_only: bool,
}

/// Store-backed vector memory index.
pub struct VectorIndex {
    store: Arc<ChatStore>,
}

impl VectorIndex {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self { store }
    }

    pub fn store_vector(&self, entry: &VectorEntry) -> Result<()> {
        self.store.put_vector(entry)?;
        Ok(())
    }

    pub fn store_vectors_batch(&self, entries: &[VectorEntry]) -> Result<()> {
        self.store.put_vectors(entries)?;
        Ok(())
    }

    pub fn get_all_vectors(&self) -> Result<Vec<VectorEntry>> {
        Ok(self.store.all_vectors()?)
    }

    pub fn get_vectors(&self, ids: &[MessageId]) -> Result<Vec<VectorEntry>> {
        Ok(self.store.get_vectors(ids)?)
    }

    pub fn delete_vector(&self, id: &str) -> Result<()> {
        self.store.delete_vector(id)?;
        Ok(())
    }

    pub fn delete_vectors(&self, ids: &[MessageId]) -> Result<()> {
        self.store.delete_vectors(ids)?;
        Ok(())
    }

    /// Patch provenance metadata across a whole session (e.g. title
    /// rename, partner-role relabeling).
    pub fn update_session_metadata(
        &self,
        session_id: &str,
        patch: &MetadataPatch,
    ) -> Result<usize> {
        Ok(self.store.patch_session_vector_metadata(session_id, patch)?)
    }

    /// Similarity search over all candidates.
    ///
    /// Filters, scores with cosine similarity (skipping NaN scores),
    /// sorts descending, applies the relevance threshold, and caps the
    /// result count.
    pub fn search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        policy: &MemoryPolicy,
    ) -> Result<Vec<ScoredVector>> {
        let candidates = self.store.all_vectors()?;
        let mut hits: Vec<ScoredVector> = candidates
            .into_iter()
            .filter(|entry| {
                if filter.model_replies_only && entry.metadata.role != Role::Model {
                    return false;
                }
                match &filter.allowed_sessions {
                    Some(allowed) => allowed.contains(&entry.metadata.session_id),
                    None => true,
                }
            })
            .filter_map(|entry| {
                if entry.vector.len() != query.len() {
                    return None;
                }
                let score = cosine_similarity(query, &entry.vector);
                // An all-zero vector scores NaN: not relevant.
                if !score.is_finite() || score < policy.min_relevance {
                    return None;
                }
                Some(ScoredVector { entry, score })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(policy.max_exemplars);
        debug!(hits = hits.len(), "vector search complete");
        Ok(hits)
    }

    /// Search and format the hits as exemplar records for prompt injection.
    pub fn search_exemplars(
        &self,
        query: &[f32],
        filter: &SearchFilter,
        policy: &MemoryPolicy,
    ) -> Result<Vec<Exemplar>> {
        Ok(build_exemplars(&self.search(query, filter, policy)?))
    }
}

/// Format scored hits as `{context, user_query, companion_reply}` records.
///
/// Hits without a recorded preceding user text fall back to an empty
/// query rather than being dropped; the reply is still a style exemplar.
pub fn build_exemplars(hits: &[ScoredVector]) -> Vec<Exemplar> {
    hits.iter()
        .map(|hit| Exemplar {
            context: hit.entry.metadata.session_title.clone(),
            user_query: hit
                .entry
                .metadata
                .preceding_user_text
                .clone()
                .unwrap_or_default(),
            companion_reply: hit.entry.text.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::VectorMetadata;

    fn index() -> VectorIndex {
        VectorIndex::new(Arc::new(ChatStore::open_in_memory().expect("store")))
    }

    fn entry(id: &str, session: &str, role: Role, vector: Vec<f32>) -> VectorEntry {
        VectorEntry {
            id: id.into(),
            text: format!("reply {id}"),
            vector,
            timestamp: 1,
            metadata: VectorMetadata {
                role,
                session_id: session.into(),
                session_title: format!("Session {session}"),
                preceding_user_text: Some(format!("question before {id}")),
                partner_role: None,
            },
        }
    }

    fn policy() -> MemoryPolicy {
        MemoryPolicy {
            min_relevance: 0.5,
            max_exemplars: 3,
            ..MemoryPolicy::default()
        }
    }

    #[test]
    fn cosine_identical_is_one() {
        let a = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_is_nan() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_nan());
    }

    #[test]
    fn search_ranks_by_similarity() {
        let idx = index();
        idx.store_vectors_batch(&[
            entry("msg_far", "chat_1", Role::Model, vec![0.1, 1.0, 0.0]),
            entry("msg_near", "chat_1", Role::Model, vec![1.0, 0.05, 0.0]),
        ])
        .expect("store");

        let hits = idx
            .search(&[1.0, 0.0, 0.0], &SearchFilter::default(), &policy())
            .expect("search");
        assert_eq!(hits.len(), 1, "far entry is below the threshold");
        assert_eq!(hits[0].entry.id, "msg_near");
        assert!(hits[0].score > 0.9);
    }

    #[test]
    fn search_filters_by_role_and_session() {
        let idx = index();
        idx.store_vectors_batch(&[
            entry("msg_user", "chat_1", Role::User, vec![1.0, 0.0]),
            entry("msg_model", "chat_1", Role::Model, vec![1.0, 0.0]),
            entry("msg_other", "chat_2", Role::Model, vec![1.0, 0.0]),
        ])
        .expect("store");

        let filter = SearchFilter {
            allowed_sessions: Some(std::iter::once("chat_1".to_owned()).collect()),
            model_replies_only: true,
        };
        let hits = idx.search(&[1.0, 0.0], &filter, &policy()).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, "msg_model");
    }

    #[test]
    fn search_skips_zero_vectors() {
        let idx = index();
        idx.store_vector(&entry("msg_zero", "chat_1", Role::Model, vec![0.0, 0.0]))
            .expect("store");
        let hits = idx
            .search(&[1.0, 0.0], &SearchFilter::default(), &policy())
            .expect("search");
        assert!(hits.is_empty());
    }

    #[test]
    fn search_skips_dimension_mismatch() {
        let idx = index();
        idx.store_vector(&entry("msg_short", "chat_1", Role::Model, vec![1.0]))
            .expect("store");
        let hits = idx
            .search(&[1.0, 0.0], &SearchFilter::default(), &policy())
            .expect("search");
        assert!(hits.is_empty());
    }

    #[test]
    fn search_caps_result_count() {
        let idx = index();
        let entries: Vec<VectorEntry> = (0..6)
            .map(|i| entry(&format!("msg_{i}"), "chat_1", Role::Model, vec![1.0, 0.0]))
            .collect();
        idx.store_vectors_batch(&entries).expect("store");

        let hits = idx
            .search(&[1.0, 0.0], &SearchFilter::default(), &policy())
            .expect("search");
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn exemplar_formatting() {
        let idx = index();
        idx.store_vector(&entry("msg_1", "chat_1", Role::Model, vec![1.0, 0.0]))
            .expect("store");

        let exemplars = idx
            .search_exemplars(&[1.0, 0.0], &SearchFilter::default(), &policy())
            .expect("search");
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].context, "Session chat_1");
        assert_eq!(exemplars[0].user_query, "question before msg_1");
        assert_eq!(exemplars[0].companion_reply, "reply msg_1");
    }

    #[test]
    fn exemplar_query_search_scenario() {
        // Two embedded messages: m1 (user), m2 (model, preceded by m1).
        // Querying with m2's own vector yields exactly the m1/m2 exemplar.
        let idx = index();
        let mut user_entry = entry("m1", "chat_1", Role::User, vec![0.2, 0.9]);
        user_entry.text = "what is the weather".into();
        let mut model_entry = entry("m2", "chat_1", Role::Model, vec![0.9, 0.1]);
        model_entry.text = "sunny and mild".into();
        model_entry.metadata.preceding_user_text = Some("what is the weather".into());
        idx.store_vectors_batch(&[user_entry, model_entry])
            .expect("store");

        let filter = SearchFilter {
            allowed_sessions: None,
            model_replies_only: true,
        };
        let exemplars = idx
            .search_exemplars(&[0.9, 0.1], &filter, &policy())
            .expect("search");
        assert_eq!(exemplars.len(), 1);
        assert_eq!(exemplars[0].user_query, "what is the weather");
        assert_eq!(exemplars[0].companion_reply, "sunny and mild");
    }

    #[test]
    fn metadata_update_delegates_to_store() {
        let idx = index();
        idx.store_vector(&entry("msg_1", "chat_1", Role::Model, vec![1.0]))
            .expect("store");
        let patched = idx
            .update_session_metadata(
                "chat_1",
                &MetadataPatch {
                    session_title: Some("Renamed".into()),
                    partner_role: None,
                },
            )
            .expect("patch");
        assert_eq!(patched, 1);
        let entry = &idx.get_vectors(&["msg_1".into()]).expect("get")[0];
        assert_eq!(entry.metadata.session_title, "Renamed");
    }
}
