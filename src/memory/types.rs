//! Data types for the vector memory index.

use serde::{Deserialize, Serialize};

use crate::session::types::{MessageId, Role, SessionId};

/// Provenance attached to a stored vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub role: Role,
    pub session_id: SessionId,
    pub session_title: String,
    /// For model replies: the user text that prompted them. Drives the
    /// `user_query` half of a retrieved exemplar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preceding_user_text: Option<String>,
    /// Persona name active when the reply was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_role: Option<String>,
}

/// One embedded message: `{id = messageId, text, vector, timestamp, metadata}`.
///
/// Created once per eligible message; never mutated except metadata
/// patches; deleted when its owning message is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: MessageId,
    pub text: String,
    pub vector: Vec<f32>,
    pub timestamp: u64,
    pub metadata: VectorMetadata,
}

/// Fields applied across a whole session's vectors by a metadata patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub session_title: Option<String>,
    pub partner_role: Option<String>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.session_title.is_none() && self.partner_role.is_none()
    }

    pub fn apply(&self, metadata: &mut VectorMetadata) {
        if let Some(title) = &self.session_title {
            metadata.session_title = title.clone();
        }
        if let Some(role) = &self.partner_role {
            metadata.partner_role = Some(role.clone());
        }
    }
}

/// A search hit with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredVector {
    pub entry: VectorEntry,
    pub score: f32,
}

/// A past user/model turn pair surfaced by similarity search to steer
/// response style, formatted for prompt injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exemplar {
    /// Where the pair came from (session title).
    pub context: String,
    pub user_query: String,
    pub companion_reply: String,
}
