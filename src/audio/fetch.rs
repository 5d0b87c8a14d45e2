//! Speech synthesis fetch pipeline.
//!
//! Lookup-before-fetch: a segment request checks the cache (memory, then
//! durable store) and only calls the synthesis provider on a full miss.
//! In-flight requests are tracked per segment and per base message in two
//! separate sets; a duplicate request for an outstanding key is rejected,
//! never double-fired. Cancellation tokens are independent per segment
//! (cancelling one does not cancel siblings) except for an all-parts
//! fetch, which owns a single token for the whole batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{AudioCache, segment_key};
use crate::error::{EngineError, Result};

/// Opaque TTS boundary.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize speech for one text segment. Implementations should
    /// observe `cancel` to abort long provider calls.
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;
}

/// Outcome of a segment fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Served from cache without a provider call.
    Cached(Arc<Vec<u8>>),
    /// Synthesized (and cached) by this call.
    Synthesized(Arc<Vec<u8>>),
    /// Another fetch for the same key is outstanding; nothing was fired.
    Duplicate,
    /// The fetch was cancelled before completion.
    Cancelled,
}

/// Splits reply text into synthesis segments at sentence boundaries,
/// packing sentences up to `max_chars` per segment.
pub fn split_into_segments(text: &str, max_chars: usize) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(text) {
        if !current.is_empty() && current.chars().count() + sentence.chars().count() > max_chars {
            segments.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.trim().is_empty() {
        segments.push(current);
    }
    segments
}

fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Tracks and drives speech synthesis with at-most-one-fetch semantics.
pub struct AudioFetcher {
    cache: Arc<AudioCache>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    /// In-flight single segments, keyed by segment key.
    segments: Mutex<HashMap<String, CancellationToken>>,
    /// In-flight whole-message batches, keyed by message id.
    messages: Mutex<HashMap<String, CancellationToken>>,
}

impl AudioFetcher {
    pub fn new(cache: Arc<AudioCache>, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            cache,
            synthesizer,
            segments: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    /// Fetch (or synthesize) one segment of a message.
    pub async fn fetch_segment(
        &self,
        message_id: &str,
        part: u32,
        text: &str,
    ) -> Result<FetchOutcome> {
        let key = segment_key(message_id, part);
        if let Some(found) = self.cache.get(&key)? {
            return Ok(FetchOutcome::Cached(found));
        }

        let token = CancellationToken::new();
        {
            let mut segments = lock(&self.segments);
            if segments.contains_key(&key) {
                debug!(%key, "rejecting duplicate segment fetch");
                return Ok(FetchOutcome::Duplicate);
            }
            segments.insert(key.clone(), token.clone());
        }

        let outcome = self.synthesize_into_cache(&key, text, &token).await;
        lock(&self.segments).remove(&key);
        outcome
    }

    /// Fetch (or synthesize) every part of a message under one batch
    /// token. Parts already cached are returned without provider calls.
    pub async fn fetch_all_parts(
        &self,
        message_id: &str,
        parts: &[String],
    ) -> Result<Vec<FetchOutcome>> {
        let token = CancellationToken::new();
        {
            let mut messages = lock(&self.messages);
            if messages.contains_key(message_id) {
                debug!(message = message_id, "rejecting duplicate batch fetch");
                return Ok(vec![FetchOutcome::Duplicate; parts.len()]);
            }
            messages.insert(message_id.to_owned(), token.clone());
        }

        let mut outcomes = Vec::with_capacity(parts.len());
        for (part, text) in parts.iter().enumerate() {
            if token.is_cancelled() {
                outcomes.push(FetchOutcome::Cancelled);
                continue;
            }
            let key = segment_key(message_id, part as u32);
            let outcome = match self.cache.get(&key) {
                Ok(Some(found)) => Ok(FetchOutcome::Cached(found)),
                Ok(None) => self.synthesize_into_cache(&key, text, &token).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    lock(&self.messages).remove(message_id);
                    return Err(e);
                }
            }
        }

        lock(&self.messages).remove(message_id);
        Ok(outcomes)
    }

    /// Cancel one in-flight segment. Siblings are unaffected.
    pub fn cancel_segment(&self, message_id: &str, part: u32) {
        if let Some(token) = lock(&self.segments).get(&segment_key(message_id, part)) {
            token.cancel();
        }
    }

    /// Cancel an in-flight all-parts batch for a message.
    pub fn cancel_message(&self, message_id: &str) {
        if let Some(token) = lock(&self.messages).get(message_id) {
            token.cancel();
        }
    }

    async fn synthesize_into_cache(
        &self,
        key: &str,
        text: &str,
        token: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let synthesized = tokio::select! {
            () = token.cancelled() => {
                debug!(%key, "segment fetch cancelled");
                return Ok(FetchOutcome::Cancelled);
            }
            result = self.synthesizer.synthesize(text, token) => result,
        };

        match synthesized {
            Ok(bytes) => {
                let shared = Arc::new(bytes);
                self.cache.put(key, shared.as_ref().clone())?;
                Ok(FetchOutcome::Synthesized(shared))
            }
            Err(e) => {
                warn!(%key, error = %e, "synthesis failed");
                Err(EngineError::Synthesis(format!("{key}: {e}")))
            }
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChatStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSynth {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingSynth {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for CountingSynth {
        async fn synthesize(&self, text: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(text.as_bytes().to_vec())
        }
    }

    fn fetcher(synth: Arc<CountingSynth>) -> Arc<AudioFetcher> {
        let store = Arc::new(ChatStore::open_in_memory().expect("store"));
        Arc::new(AudioFetcher::new(Arc::new(AudioCache::new(store)), synth))
    }

    #[tokio::test]
    async fn miss_synthesizes_then_hit_serves_cache() {
        let synth = CountingSynth::new(Duration::ZERO);
        let fetcher = fetcher(Arc::clone(&synth));

        let first = fetcher.fetch_segment("msg_a", 0, "hello").await.expect("fetch");
        assert!(matches!(first, FetchOutcome::Synthesized(_)));

        let second = fetcher.fetch_segment("msg_a", 0, "hello").await.expect("fetch");
        assert!(matches!(second, FetchOutcome::Cached(_)));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_fires_exactly_one_synthesis() {
        let synth = CountingSynth::new(Duration::from_millis(50));
        let fetcher = fetcher(Arc::clone(&synth));

        let a = Arc::clone(&fetcher);
        let b = Arc::clone(&fetcher);
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.fetch_segment("msg_a", 0, "hi").await }),
            tokio::spawn(async move { b.fetch_segment("msg_a", 0, "hi").await }),
        );
        let outcomes = [
            first.expect("join").expect("fetch"),
            second.expect("join").expect("fetch"),
        ];

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(
            outcomes
                .iter()
                .any(|o| matches!(o, FetchOutcome::Synthesized(_)))
        );
        assert!(outcomes.iter().any(|o| *o == FetchOutcome::Duplicate));
    }

    #[tokio::test]
    async fn sibling_segments_fetch_independently() {
        let synth = CountingSynth::new(Duration::ZERO);
        let fetcher = fetcher(Arc::clone(&synth));

        fetcher.fetch_segment("msg_a", 0, "one").await.expect("fetch");
        fetcher.fetch_segment("msg_a", 1, "two").await.expect("fetch");
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_segment_leaves_siblings_alone() {
        let synth = CountingSynth::new(Duration::from_millis(100));
        let fetcher = fetcher(Arc::clone(&synth));

        let a = Arc::clone(&fetcher);
        let slow = tokio::spawn(async move { a.fetch_segment("msg_a", 0, "slow").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        fetcher.cancel_segment("msg_a", 0);

        let cancelled = slow.await.expect("join").expect("fetch");
        assert_eq!(cancelled, FetchOutcome::Cancelled);

        // Sibling still synthesizes normally.
        let sibling = fetcher.fetch_segment("msg_a", 1, "fine").await.expect("fetch");
        assert!(matches!(sibling, FetchOutcome::Synthesized(_)));
    }

    #[tokio::test]
    async fn batch_fetch_skips_cached_parts() {
        let synth = CountingSynth::new(Duration::ZERO);
        let fetcher = fetcher(Arc::clone(&synth));

        fetcher.fetch_segment("msg_a", 0, "part zero").await.expect("seed");
        let outcomes = fetcher
            .fetch_all_parts("msg_a", &["part zero".into(), "part one".into()])
            .await
            .expect("batch");

        assert!(matches!(outcomes[0], FetchOutcome::Cached(_)));
        assert!(matches!(outcomes[1], FetchOutcome::Synthesized(_)));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_batches_for_one_message_reject_duplicate() {
        let synth = CountingSynth::new(Duration::from_millis(50));
        let fetcher = fetcher(Arc::clone(&synth));

        let a = Arc::clone(&fetcher);
        let b = Arc::clone(&fetcher);
        let parts = vec!["only part".to_owned()];
        let parts2 = parts.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.fetch_all_parts("msg_a", &parts).await }),
            tokio::spawn(async move { b.fetch_all_parts("msg_a", &parts2).await }),
        );
        let first = first.expect("join").expect("batch");
        let second = second.expect("join").expect("batch");

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        let duplicates = [&first, &second]
            .iter()
            .filter(|o| o[0] == FetchOutcome::Duplicate)
            .count();
        assert_eq!(duplicates, 1);
    }

    #[test]
    fn segment_splitting_packs_sentences() {
        let segments = split_into_segments("One. Two. Three!", 12);
        assert_eq!(segments, vec!["One. Two.", "Three!"]);
    }

    #[test]
    fn segment_splitting_handles_empty_text() {
        assert!(split_into_segments("", 100).is_empty());
        assert!(split_into_segments("   \n ", 100).is_empty());
    }

    #[test]
    fn segment_splitting_keeps_long_sentence_whole() {
        let segments = split_into_segments("an unbroken clause with no terminator", 10);
        assert_eq!(segments.len(), 1);
    }
}
