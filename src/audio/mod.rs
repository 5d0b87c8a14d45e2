//! Synthesized-speech artifacts: blob cache, fetch pipeline, playback slot.

pub mod cache;
pub mod fetch;
pub mod playback;

pub use cache::{AudioCache, segment_key};
pub use fetch::{AudioFetcher, FetchOutcome, SpeechSynthesizer, split_into_segments};
pub use playback::PlaybackSlot;
