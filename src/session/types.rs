//! Core conversation data model.
//!
//! A [`Session`] is one conversation: an append-ordered list of
//! [`Message`]s plus per-session [`SessionSettings`]. The durable store
//! persists sessions as documents; the in-memory copy owned by the
//! session controller is a cache of record that is reconciled back to
//! disk after every mutation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = String;

/// Unique message identifier. Caller-generated, unique across the whole
/// store; the UUID payload carries enough entropy to avoid collision.
pub type MessageId = String;

/// Default content of an empty memory profile.
pub const EMPTY_MEMORY: &str = "{}";

/// Generate a fresh session id.
pub fn new_session_id() -> SessionId {
    format!("chat_{}", Uuid::new_v4().simple())
}

/// Generate a fresh message id.
pub fn new_message_id() -> MessageId {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Returns the current Unix epoch in seconds.
pub fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The speaker of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human participant.
    User,
    /// The assistant.
    Model,
    /// A failed generation, shown inline where the answer would have been.
    Error,
    /// Injected markers (time notes, reminders). Never sent as turns.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Error => "error",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary or remote-reference payload attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: AttachmentData,
}

/// Attachment payload location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentData {
    /// Base64-encoded bytes carried inline.
    Inline { base64: String },
    /// A reference to provider-side storage (uploaded media).
    Remote { uri: String },
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Hidden reasoning text, merged from provider thought deltas and
    /// hidden-tag spans extracted at reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    /// Watermark: asserts that exactly this many audio blobs exist in the
    /// audio cache under keys `{id}_part_{i}` for `i in [0, count)`. Every
    /// mutator that touches content or deletes the message must delete the
    /// stale blobs and clear this in the same logical operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_audio_segments: Option<u32>,
    /// Whether this message has an entry in the vector index.
    #[serde(default)]
    pub embedded: bool,
    /// While `true`, content is partial and must not be treated as final
    /// for caching, embedding, or export.
    #[serde(default)]
    pub is_streaming: bool,
    /// Unix epoch seconds.
    pub timestamp: u64,
    /// Generation seed recorded for reproducibility, not cryptography.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub favorite: bool,
}

impl Message {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            thoughts: None,
            cached_audio_segments: None,
            embedded: false,
            is_streaming: false,
            timestamp: now_epoch_secs(),
            seed: None,
            favorite: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::base(Role::Model, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    /// An empty, streaming placeholder inserted before a generation
    /// request begins and reconciled in place on terminal stream events.
    pub fn placeholder() -> Self {
        let mut message = Self::base(Role::Model, "");
        message.is_streaming = true;
        message
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Who wrote a memory snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// The model, via a memory tool call during a turn.
    Model,
    /// A direct user edit.
    User,
    /// The periodic background summarizer.
    Summarizer,
}

/// One entry in a session's append-only memory history, captured each
/// time the structured profile memory changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub content: String,
    pub timestamp: u64,
    pub source: SnapshotSource,
    /// The message this change is attributed to: the anchor used to roll
    /// memory state back consistently when messages are deleted.
    pub related_message_id: MessageId,
}

/// An alternate AI persona available within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub persona: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// A summary of an archived stretch of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub title: String,
    pub summary: String,
    /// Last message covered by this chapter.
    pub up_to_message_id: MessageId,
    pub created_at: u64,
}

/// Per-session generation settings and memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub model: String,
    /// Persona / system instruction composed into every request.
    pub system_instruction: String,
    /// Explicit seed override; `None` draws a fresh seed per request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Whether the memory profile and memory tool are active.
    pub memory_enabled: bool,
    /// Whether past-reply exemplars are retrieved and injected.
    pub exemplar_search_enabled: bool,
    /// Whether completed replies are auto-played as speech.
    pub auto_play_audio: bool,
    /// The free-form profile blob ("memory box"). Always equals the content
    /// of the newest surviving entry in `memory_history`.
    pub memory_box_content: String,
    /// Append-only history of memory changes.
    pub memory_history: Vec<MemorySnapshot>,
    /// Monotonically-advancing archive pointer: last archived message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_archived_message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_archived_at: Option<u64>,
    /// Alternate personas.
    pub characters: Vec<Character>,
    /// Archived-chapter summaries.
    pub chapters: Vec<ChapterSummary>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_instruction: String::new(),
            seed: None,
            memory_enabled: true,
            exemplar_search_enabled: true,
            auto_play_audio: false,
            memory_box_content: EMPTY_MEMORY.to_owned(),
            memory_history: Vec::new(),
            last_archived_message_id: None,
            last_archived_at: None,
            characters: Vec::new(),
            chapters: Vec::new(),
        }
    }
}

/// One conversation.
///
/// `messages` is append-ordered by turn; while a response is in flight,
/// the streaming placeholder for that turn is the last element (for new
/// turns) or sits in place of the message being regenerated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub settings: SessionSettings,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Session {
    pub fn new(title: impl Into<String>, settings: SessionSettings) -> Self {
        let now = now_epoch_secs();
        Self {
            id: new_session_id(),
            title: title.into(),
            messages: Vec::new(),
            settings,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump the last-updated timestamp.
    pub fn touch(&mut self) {
        self.updated_at = now_epoch_secs();
    }

    pub fn message_index(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    pub fn find_message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn find_message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// The lightweight listing view of this session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            model: self.settings.model.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Lightweight representation of a conversation for list views. Every
/// conversation other than the active one is held only in this form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub model: String,
    pub message_count: usize,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SessionSummary {
    /// A degraded, message-less session built from this summary, used when
    /// the full fetch fails so navigation is never blocked.
    pub fn into_degraded_session(self) -> Session {
        Session {
            id: self.id,
            title: self.title,
            messages: Vec::new(),
            settings: SessionSettings {
                model: self.model,
                ..SessionSettings::default()
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
