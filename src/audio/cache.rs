//! Audio artifact cache.
//!
//! Maps `(message_id, part_index)` to a synthesized-speech blob. Blobs
//! live in the durable store; a small in-memory layer fronts repeated
//! reads during a listening session. The per-message segment-count
//! watermark stored on the [`Message`](crate::session::types::Message) is
//! a *claim* that parts `0..N-1` all exist: any code path invalidating
//! that claim must delete the blobs through this cache in the same
//! logical operation, blobs first, so a non-zero watermark is never
//! observable without backing blobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::store::ChatStore;

/// Key of one audio segment: `"{message_id}_part_{index}"`.
pub fn segment_key(message_id: &str, part: u32) -> String {
    format!("{message_id}_part_{part}")
}

/// Durable blob cache with an in-memory hot layer.
pub struct AudioCache {
    store: Arc<ChatStore>,
    hot: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl AudioCache {
    pub fn new(store: Arc<ChatStore>) -> Self {
        Self {
            store,
            hot: Mutex::new(HashMap::new()),
        }
    }

    /// Look up one segment: hot layer first, then the durable store
    /// (promoting on hit). `None` is a full miss.
    pub fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(found) = self.lock_hot().get(key) {
            return Ok(Some(Arc::clone(found)));
        }
        match self.store.get_audio(key)? {
            Some(bytes) => {
                let shared = Arc::new(bytes);
                self.lock_hot().insert(key.to_owned(), Arc::clone(&shared));
                Ok(Some(shared))
            }
            None => Ok(None),
        }
    }

    /// Write one segment. Durable first, then the hot layer, so a crash
    /// between the two never leaves memory claiming what disk lacks.
    pub fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.store.put_audio(key, &bytes)?;
        self.lock_hot().insert(key.to_owned(), Arc::new(bytes));
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.store.delete_audio(key)?;
        self.lock_hot().remove(key);
        Ok(())
    }

    /// Delete every `_part_0..count-1` blob for a message. The caller
    /// clears the message's watermark in the same logical operation.
    pub fn delete_for_message(&self, message_id: &str, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let keys: Vec<String> = (0..count).map(|i| segment_key(message_id, i)).collect();
        self.store.bulk_delete_audio(&keys)?;
        let mut hot = self.lock_hot();
        for key in &keys {
            hot.remove(key);
        }
        debug!(message = message_id, segments = count, "audio cache cleared");
        Ok(())
    }

    /// Parts claimed by a watermark that are actually missing.
    ///
    /// A non-empty result is a cache inconsistency; callers self-heal by
    /// re-synthesizing the missing parts (treating them as misses).
    pub fn missing_parts(&self, message_id: &str, count: u32) -> Result<Vec<u32>> {
        let mut missing = Vec::new();
        for part in 0..count {
            if self.get(&segment_key(message_id, part))?.is_none() {
                missing.push(part);
            }
        }
        Ok(missing)
    }

    /// Drop the in-memory layer (the durable blobs stay).
    pub fn clear_hot(&self) {
        self.lock_hot().clear();
    }

    fn lock_hot(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Vec<u8>>>> {
        self.hot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
