//! Memory profile snapshots and rollback.
//!
//! Every change to a session's structured profile memory appends a
//! [`MemorySnapshot`] anchored to the message that caused it. When
//! messages are deleted, the rollback procedure keeps the active content
//! consistent: it must always equal the newest snapshot whose anchor
//! message still exists.

use std::collections::HashSet;

use tracing::debug;

use crate::session::types::{
    EMPTY_MEMORY, MemorySnapshot, MessageId, Session, SnapshotSource, now_epoch_secs,
};

/// Set the memory profile content and record the snapshot that made it so.
pub fn record_snapshot(
    session: &mut Session,
    content: impl Into<String>,
    source: SnapshotSource,
    related_message_id: impl Into<MessageId>,
) {
    let content = content.into();
    session.settings.memory_box_content = content.clone();
    session.settings.memory_history.push(MemorySnapshot {
        content,
        timestamp: now_epoch_secs(),
        source,
        related_message_id: related_message_id.into(),
    });
}

/// Roll the memory profile back after message deletion.
///
/// Snapshots anchored to a deleted message are removed; the active
/// content becomes the newest surviving snapshot's content, or the empty
/// profile if none survive.
pub fn rollback_after_deletion(session: &mut Session, deleted: &HashSet<MessageId>) {
    let before = session.settings.memory_history.len();
    session
        .settings
        .memory_history
        .retain(|snapshot| !deleted.contains(&snapshot.related_message_id));

    let removed = before - session.settings.memory_history.len();
    if removed == 0 {
        return;
    }

    session.settings.memory_box_content = session
        .settings
        .memory_history
        .last()
        .map(|snapshot| snapshot.content.clone())
        .unwrap_or_else(|| EMPTY_MEMORY.to_owned());
    debug!(
        session = %session.id,
        removed,
        "rolled back memory snapshots after deletion"
    );
}

/// Whether the periodic background summarization should fire.
///
/// Fires on an exact modulo of the message count. The cadence is policy,
/// not a correctness invariant; it is configurable.
pub fn should_summarize(message_count: usize, every: usize) -> bool {
    every > 0 && message_count > 0 && message_count % every == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::SessionSettings;

    fn session_with_snapshots(anchors: &[&str]) -> Session {
        let mut session = Session::new("Chat", SessionSettings::default());
        for (i, anchor) in anchors.iter().enumerate() {
            record_snapshot(
                &mut session,
                format!("{{\"v\":{i}}}"),
                SnapshotSource::Model,
                *anchor,
            );
        }
        session
    }

    fn deleted(ids: &[&str]) -> HashSet<MessageId> {
        ids.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn record_snapshot_sets_active_content() {
        let mut session = Session::new("Chat", SessionSettings::default());
        record_snapshot(&mut session, "{\"name\":\"Ada\"}", SnapshotSource::User, "m1");
        assert_eq!(session.settings.memory_box_content, "{\"name\":\"Ada\"}");
        assert_eq!(session.settings.memory_history.len(), 1);
    }

    #[test]
    fn rollback_keeps_content_when_anchor_survives() {
        let mut session = session_with_snapshots(&["m1", "m2", "m3"]);
        rollback_after_deletion(&mut session, &deleted(&["m2"]));
        // Newest surviving anchor is m3; active content unchanged.
        assert_eq!(session.settings.memory_box_content, "{\"v\":2}");
        assert_eq!(session.settings.memory_history.len(), 2);
    }

    #[test]
    fn rollback_reverts_to_newest_survivor() {
        let mut session = session_with_snapshots(&["m1", "m2", "m3"]);
        rollback_after_deletion(&mut session, &deleted(&["m3"]));
        assert_eq!(session.settings.memory_box_content, "{\"v\":1}");
    }

    #[test]
    fn rollback_to_empty_when_nothing_survives() {
        let mut session = session_with_snapshots(&["m1", "m2"]);
        rollback_after_deletion(&mut session, &deleted(&["m1", "m2"]));
        assert_eq!(session.settings.memory_box_content, EMPTY_MEMORY);
        assert!(session.settings.memory_history.is_empty());
    }

    #[test]
    fn rollback_is_noop_for_unrelated_deletion() {
        let mut session = session_with_snapshots(&["m1"]);
        rollback_after_deletion(&mut session, &deleted(&["other"]));
        assert_eq!(session.settings.memory_box_content, "{\"v\":0}");
        assert_eq!(session.settings.memory_history.len(), 1);
    }

    #[test]
    fn rollback_sequences_compose() {
        // Delete in two steps; invariant holds after each.
        let mut session = session_with_snapshots(&["m1", "m2", "m3", "m4"]);
        rollback_after_deletion(&mut session, &deleted(&["m4", "m2"]));
        assert_eq!(session.settings.memory_box_content, "{\"v\":2}");
        rollback_after_deletion(&mut session, &deleted(&["m3"]));
        assert_eq!(session.settings.memory_box_content, "{\"v\":0}");
    }

    #[test]
    fn summarize_cadence_is_exact_modulo() {
        assert!(should_summarize(20, 20));
        assert!(should_summarize(40, 20));
        assert!(!should_summarize(21, 20));
        assert!(!should_summarize(0, 20));
        assert!(!should_summarize(20, 0));
    }
}
