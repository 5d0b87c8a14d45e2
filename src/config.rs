//! Configuration types for the conversation engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Durable persistence behavior.
    pub persistence: PersistenceConfig,
    /// Live streaming display behavior.
    pub stream: StreamConfig,
    /// Memory, embedding, and retrieval policy.
    pub memory: MemoryPolicy,
    /// System-instruction context injection.
    pub prompt: PromptConfig,
    /// Remote media processing polls.
    pub poll: PollPolicy,
}

/// Durable persistence behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Trailing debounce for message-array writes, in milliseconds.
    ///
    /// Rapid successive stream updates within this window coalesce into a
    /// single disk write carrying the latest snapshot.
    pub debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { debounce_ms: 1_000 }
    }
}

/// Live streaming display behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Minimum interval between live-text updates, in milliseconds.
    pub throttle_ms: u64,
    /// Tag name whose enclosed content is hidden from the live view and
    /// folded into the message's thoughts (e.g. `think` for `<think>...</think>`).
    /// `None` disables hidden-tag filtering.
    pub hidden_tag: Option<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 120,
            hidden_tag: Some("think".to_owned()),
        }
    }
}

/// Memory, embedding, and retrieval policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicy {
    /// Summarize the memory profile every N messages. Background,
    /// best-effort; never blocks turn completion.
    pub summarize_every: usize,
    /// Archive a conversation chapter every N messages.
    pub archive_every: usize,
    /// Minimum content length (chars) for a message to be embedded.
    pub min_embed_chars: usize,
    /// Minimum cosine similarity for a search hit to count as relevant.
    pub min_relevance: f32,
    /// Maximum number of exemplars surfaced per search.
    pub max_exemplars: usize,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            summarize_every: 20,
            archive_every: 60,
            min_embed_chars: 12,
            min_relevance: 0.35,
            max_exemplars: 3,
        }
    }
}

/// System-instruction context injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Append a time-since-last-turn note when the gap exceeds this many seconds.
    pub time_gap_note_secs: u64,
    /// Re-inject the persona reminder every N conversation turns.
    pub reminder_every: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            time_gap_note_secs: 3 * 3_600,
            reminder_every: 10,
        }
    }
}

/// Bounded polling for remote media processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Maximum number of state checks before giving up.
    pub max_attempts: u32,
    /// Fixed delay between checks, in milliseconds.
    pub backoff_ms: u64,
    /// Hard ceiling on the total wait, in seconds.
    pub timeout_secs: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            backoff_ms: 2_000,
            timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text. Missing fields take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Load a configuration file, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// The default database directory (`<data_dir>/wisp`).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wisp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.persistence.debounce_ms, 1_000);
        assert_eq!(config.memory.summarize_every, 20);
        assert_eq!(config.stream.hidden_tag.as_deref(), Some("think"));
        assert!(config.memory.min_relevance > 0.0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [stream]
            throttle_ms = 50
            "#,
        )
        .expect("parse");
        assert_eq!(config.stream.throttle_ms, 50);
        // Untouched sections keep their defaults.
        assert_eq!(config.persistence.debounce_ms, 1_000);
        assert_eq!(config.poll.max_attempts, 15);
    }

    #[test]
    fn hidden_tag_can_be_disabled() {
        let config = EngineConfig::from_toml_str(
            r#"
            [stream]
            hidden_tag = "reasoning"
            "#,
        )
        .expect("parse");
        assert_eq!(config.stream.hidden_tag.as_deref(), Some("reasoning"));
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = EngineConfig::from_toml_str("not [valid");
        assert!(matches!(err, Err(EngineError::Config(_))));
    }

    #[test]
    fn toml_round_trip() {
        let config = EngineConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed = EngineConfig::from_toml_str(&text).expect("parse");
        assert_eq!(parsed.memory.summarize_every, config.memory.summarize_every);
        assert_eq!(parsed.stream.throttle_ms, config.stream.throttle_ms);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let config = EngineConfig::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.persistence.debounce_ms, 1_000);
    }
}
