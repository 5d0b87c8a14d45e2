//! Streaming response engine.
//!
//! Drives one outbound generation request through its lifecycle:
//! build the provider payload, consume the incremental stream (writing
//! only to the transient live-stream slot), and on the terminal event
//! perform one atomic reconciliation of the placeholder message through
//! the session controller. Cancellation preserves partial answers;
//! failures convert the placeholder into an inline error-role message.
//! Side effects after completion (speech synthesis, embedding, memory
//! maintenance) are fire-and-forget and never block the turn.

pub mod accumulator;
pub mod hidden_tag;
pub mod lifecycle;
pub mod prompt;
pub mod regen;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioCache, AudioFetcher, PlaybackSlot, SpeechSynthesizer, split_into_segments};
use crate::config::EngineConfig;
use crate::error::{EngineError, ProviderFailure, Result};
use crate::memory::embedder::SharedEmbedder;
use crate::memory::index::{SearchFilter, VectorIndex};
use crate::memory::types::Exemplar;
use crate::provider::{CompletionProvider, CompletionRequest, FinishReason, StreamEvent};
use crate::session::controller::{EditOutcome, SessionController};
use crate::session::memory_box::{record_snapshot, should_summarize};
use crate::session::types::{
    Attachment, ChapterSummary, Message, MessageId, Role, Session, SessionId, SnapshotSource,
    now_epoch_secs,
};

use accumulator::{FinishedTurn, TurnAccumulator};
use hidden_tag::{HiddenTagStream, split_hidden};
use lifecycle::{RequestRegistry, RequestTicket};
use prompt::{build_request, choose_seed, detect_favorite};

/// Character budget per synthesized speech segment.
const TTS_SEGMENT_MAX_CHARS: usize = 240;

/// Shown when a stream ends without either a success or an error path
/// having produced anything.
const UNEXPECTED_END_MESSAGE: &str = "processing failed unexpectedly";

/// The transient live-stream slot: the only value mutated at
/// delta frequency, so high-frequency updates never force message-list
/// re-derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStream {
    pub session_id: Option<SessionId>,
    pub message_id: Option<MessageId>,
    pub text: String,
}

/// Orchestrates streaming generation requests.
pub struct ResponseEngine {
    provider: Arc<dyn CompletionProvider>,
    sessions: Arc<SessionController>,
    audio_cache: Arc<AudioCache>,
    fetcher: Option<Arc<AudioFetcher>>,
    playback: Arc<PlaybackSlot>,
    index: Arc<VectorIndex>,
    embedder: Option<SharedEmbedder>,
    requests: RequestRegistry,
    live: watch::Sender<LiveStream>,
    config: EngineConfig,
}

impl ResponseEngine {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        sessions: Arc<SessionController>,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::clone(sessions.store());
        let (live, _) = watch::channel(LiveStream::default());
        Self {
            provider,
            audio_cache: Arc::new(AudioCache::new(Arc::clone(&store))),
            fetcher: None,
            playback: Arc::new(PlaybackSlot::new()),
            index: Arc::new(VectorIndex::new(store)),
            embedder: None,
            requests: RequestRegistry::new(),
            live,
            sessions,
            config,
        }
    }

    /// Attach a speech synthesizer, enabling the audio pipeline.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.fetcher = Some(Arc::new(AudioFetcher::new(
            Arc::clone(&self.audio_cache),
            synthesizer,
        )));
        self
    }

    /// Attach an embedding backend, enabling memory retrieval.
    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    pub fn audio_cache(&self) -> &Arc<AudioCache> {
        &self.audio_cache
    }

    pub fn audio_fetcher(&self) -> Option<&Arc<AudioFetcher>> {
        self.fetcher.as_ref()
    }

    pub fn playback(&self) -> &Arc<PlaybackSlot> {
        &self.playback
    }

    pub fn vector_index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Subscribe to the transient live-stream slot.
    pub fn subscribe_live(&self) -> watch::Receiver<LiveStream> {
        self.live.subscribe()
    }

    /// Cancel the outstanding generation for a session, if any.
    pub fn cancel_response(&self, session_id: &str) -> bool {
        self.requests.cancel(session_id)
    }

    /// The placeholder id of a session's in-flight request, if any.
    pub fn pending_message(&self, session_id: &str) -> Option<MessageId> {
        self.requests.pending_placeholder(session_id)
    }

    /// Send a user message in the active conversation and stream the
    /// reply. Resolves once the turn reaches a terminal state; callers
    /// that want a non-blocking send spawn this future.
    pub async fn send_user_message(
        &self,
        text: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<MessageId> {
        let session_id = self
            .sessions
            .active_session_id()
            .ok_or_else(|| EngineError::NotFound("no active session".into()))?;

        let user = Message::user(text).with_attachments(attachments);
        let placeholder = Message::placeholder();
        let placeholder_id = placeholder.id.clone();

        let mutated = self.sessions.update_current_session(|mut session| {
            session.messages.push(user.clone());
            session.messages.push(placeholder.clone());
            Some(session)
        });
        if !mutated {
            return Err(EngineError::NotFound(format!("session {session_id}")));
        }
        if let Some(messages) = self.sessions.with_active(|s| s.messages.clone()) {
            self.sessions.schedule_persist(&session_id, messages);
        }

        let history_end = self
            .sessions
            .with_active(|s| s.messages.len().saturating_sub(1))
            .unwrap_or(0);
        self.run_generation(&session_id, &placeholder_id, history_end, None)
            .await?;
        Ok(placeholder_id)
    }

    /// Drive one generation request to a terminal state.
    ///
    /// `history_end` bounds the provider's view of the conversation
    /// (exclusive); `snapshot` carries the pre-regeneration original for
    /// the empty-abort restore path.
    pub(crate) async fn run_generation(
        &self,
        session_id: &str,
        placeholder_id: &str,
        history_end: usize,
        snapshot: Option<Message>,
    ) -> Result<()> {
        let ticket = self
            .requests
            .begin(session_id, placeholder_id, snapshot);

        let result = self.drive(&ticket, history_end).await;

        // Completion guard, run on every terminal path: if neither the
        // success nor the error handler fired, the stream ended in a
        // state the engine does not understand.
        if !ticket.was_handled() {
            self.fail_turn(&ticket, ProviderFailure::Unknown, UNEXPECTED_END_MESSAGE);
        }
        self.clear_live(&ticket);
        self.requests.finish(&ticket);
        result
    }

    async fn drive(&self, ticket: &RequestTicket, history_end: usize) -> Result<()> {
        // BUILDING_REQUEST: snapshot the session, retrieve exemplars,
        // decide the seed, assemble the payload.
        let Some(session) = self.capture_session(&ticket.session_id) else {
            return Err(EngineError::NotFound(format!(
                "session {}",
                ticket.session_id
            )));
        };

        let exemplars = self.retrieve_exemplars(&session, history_end).await;
        let seed = choose_seed(session.settings.seed);
        let request = build_request(&session, history_end, &exemplars, &self.config.prompt, seed);

        if ticket.was_cancelled() {
            self.abort_turn(ticket, &FinishedTurn::empty());
            return Ok(());
        }

        // STREAMING.
        let mut stream = match self.provider.stream(&request).await {
            Ok(stream) => stream,
            Err(EngineError::Provider { kind, message }) => {
                warn!(session = %ticket.session_id, error = %message, "request failed");
                self.fail_turn(ticket, kind, &message);
                return Ok(());
            }
            Err(e) => {
                warn!(session = %ticket.session_id, error = %e, "request failed");
                self.fail_turn(ticket, ProviderFailure::Unknown, &e.to_string());
                return Ok(());
            }
        };

        let mut acc = TurnAccumulator::new();
        let mut live_filter = HiddenTagStream::new(self.config.stream.hidden_tag.as_deref());
        let throttle = Duration::from_millis(self.config.stream.throttle_ms);
        let mut last_publish: Option<Instant> = None;

        loop {
            tokio::select! {
                () = ticket.cancel.cancelled() => break,
                next = stream.next() => {
                    let Some(event) = next else { break };
                    if let StreamEvent::TextDelta { text } = &event {
                        live_filter.push(text);
                        let now = Instant::now();
                        let due = last_publish
                            .is_none_or(|at| now.duration_since(at) >= throttle);
                        if due {
                            self.publish_live(ticket, live_filter.visible());
                            last_publish = Some(now);
                        }
                    }
                    let failed = matches!(event, StreamEvent::Failed { .. });
                    acc.push(event);
                    if failed {
                        break;
                    }
                }
            }
        }

        let turn = acc.finish();

        // Terminal dispatch. The cancelled flag is consulted before any
        // shared state is touched, so a late-arriving stream end cannot
        // resurrect content the user already discarded.
        if ticket.was_cancelled() {
            self.abort_turn(ticket, &turn);
            return Ok(());
        }
        if let Some((kind, message)) = &turn.failure {
            self.fail_turn(ticket, *kind, message);
            return Ok(());
        }
        if !turn.saw_any_event {
            // Leave unhandled; the completion guard converts this to the
            // "processing failed unexpectedly" error.
            return Ok(());
        }
        self.complete_turn(ticket, turn, seed);
        Ok(())
    }

    /// RECONCILING: one atomic reconciliation of the placeholder.
    fn complete_turn(&self, ticket: &RequestTicket, turn: FinishedTurn, seed: u64) {
        // Stream-time filtering is a rendering optimization; the
        // authoritative pass happens here, on the final text.
        let tag = self.config.stream.hidden_tag.clone().unwrap_or_default();
        let (visible, extracted) = split_hidden(&tag, &turn.text);
        let (content, favorite) = detect_favorite(visible.trim());

        let mut thoughts = turn.thoughts.clone();
        if !extracted.trim().is_empty() {
            if !thoughts.is_empty() {
                thoughts.push('\n');
            }
            thoughts.push_str(extracted.trim());
        }

        if content.is_empty() && turn.finish == Some(FinishReason::ContentFilter) {
            self.fail_turn(ticket, ProviderFailure::SafetyBlocked, "provider safety block");
            return;
        }
        if !ticket.claim_terminal() {
            return;
        }

        let placeholder_id = ticket.placeholder_id.clone();
        let memory_update = turn.memory_update.clone();
        let thoughts_field = (!thoughts.is_empty()).then_some(thoughts);
        let mut reconciled_pair: Option<(Option<Message>, Message)> = None;
        let mut message_count = 0;

        let edit = self.sessions.edit_session(&ticket.session_id, |session| {
            let Some(index) = session.message_index(&placeholder_id) else {
                return;
            };
            {
                let message = &mut session.messages[index];
                message.content = content.clone();
                message.thoughts = thoughts_field.clone();
                message.is_streaming = false;
                message.timestamp = now_epoch_secs();
                message.seed = Some(seed);
                message.favorite = favorite;
            }
            if let Some(update) = &memory_update {
                record_snapshot(
                    session,
                    update.clone(),
                    SnapshotSource::Model,
                    placeholder_id.clone(),
                );
            }
            let preceding_user = session.messages[..index]
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .cloned();
            reconciled_pair = Some((preceding_user, session.messages[index].clone()));
            message_count = session.messages.len();
        });

        match edit {
            Ok(EditOutcome::Active) => {
                if let Err(e) = self.sessions.persist_active_now() {
                    warn!(session = %ticket.session_id, error = %e, "persist after completion failed");
                }
            }
            Ok(EditOutcome::Background) => {
                debug!(session = %ticket.session_id, "completed for a background session");
            }
            Ok(EditOutcome::Missing) => {
                info!(session = %ticket.session_id, "session vanished before reconciliation");
                return;
            }
            Err(e) => {
                warn!(session = %ticket.session_id, error = %e, "reconciliation write failed");
            }
        }

        if let Some((preceding_user, model_message)) = reconciled_pair {
            self.spawn_side_effects(ticket, preceding_user, model_message, message_count);
        }
    }

    /// ABORTED: keep partial content, restore the regeneration original,
    /// or drop a brand-new empty placeholder.
    fn abort_turn(&self, ticket: &RequestTicket, turn: &FinishedTurn) {
        if !ticket.claim_terminal() {
            return;
        }
        let tag = self.config.stream.hidden_tag.clone().unwrap_or_default();
        let (visible, _) = split_hidden(&tag, &turn.text);
        let partial = visible.trim().to_owned();
        let snapshot = self.requests.take_snapshot(ticket);
        let placeholder_id = ticket.placeholder_id.clone();

        let edit = self.sessions.edit_session(&ticket.session_id, |session| {
            let Some(index) = session.message_index(&placeholder_id) else {
                return;
            };
            if !partial.is_empty() {
                // Partial answers are preserved, not discarded.
                let message = &mut session.messages[index];
                message.content = partial.clone();
                message.is_streaming = false;
                message.timestamp = now_epoch_secs();
            } else if let Some(original) = snapshot.clone() {
                // Empty regeneration: restore the original verbatim.
                session.messages[index] = original;
            } else {
                // Empty new turn: remove the placeholder entirely.
                session.messages.remove(index);
            }
        });

        match edit {
            Ok(EditOutcome::Active) => {
                if let Err(e) = self.sessions.persist_active_now() {
                    warn!(session = %ticket.session_id, error = %e, "persist after abort failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session = %ticket.session_id, error = %e, "abort reconciliation failed");
            }
        }
        info!(session = %ticket.session_id, kept_partial = !partial.is_empty(), "generation aborted");
    }

    /// ERRORED: convert the placeholder in place to an error-role
    /// message with the classified, user-facing text.
    fn fail_turn(&self, ticket: &RequestTicket, kind: ProviderFailure, detail: &str) {
        if !ticket.claim_terminal() {
            return;
        }
        warn!(session = %ticket.session_id, %kind, detail, "generation failed");
        let placeholder_id = ticket.placeholder_id.clone();
        let content = kind.user_message().to_owned();

        let edit = self.sessions.edit_session(&ticket.session_id, |session| {
            if let Some(message) = session.find_message_mut(&placeholder_id) {
                message.role = Role::Error;
                message.content = content.clone();
                message.thoughts = None;
                message.is_streaming = false;
                message.timestamp = now_epoch_secs();
            }
        });

        match edit {
            Ok(EditOutcome::Active) => {
                if let Err(e) = self.sessions.persist_active_now() {
                    warn!(session = %ticket.session_id, error = %e, "persist after failure failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session = %ticket.session_id, error = %e, "error reconciliation failed");
            }
        }
    }

    /// Reset a message's audio cache: blobs first, then the watermark in
    /// the same logical operation.
    pub fn reset_audio_cache(&self, message_id: &str) -> Result<()> {
        let Some(session_id) = self.sessions.active_session_id() else {
            return Err(EngineError::NotFound("no active session".into()));
        };
        let count = self
            .sessions
            .with_active(|s| {
                s.find_message(message_id)
                    .and_then(|m| m.cached_audio_segments)
            })
            .flatten()
            .unwrap_or(0);

        self.playback.stop_if_owned_by([message_id]);
        self.audio_cache.delete_for_message(message_id, count)?;

        self.sessions.update_current_session(|mut session| {
            let message = session.find_message_mut(message_id)?;
            message.cached_audio_segments = None;
            Some(session)
        });
        self.sessions.persist_active_now()?;
        debug!(session = %session_id, message = message_id, "audio cache reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// The session as this request should see it: the live copy if still
    /// active, otherwise the durable one.
    fn capture_session(&self, session_id: &str) -> Option<Session> {
        let active = self
            .sessions
            .active_snapshot()
            .filter(|s| s.id == session_id);
        match active {
            Some(session) => Some(session),
            None => self.sessions.store().get_session(session_id).ok().flatten(),
        }
    }

    /// Best-effort exemplar retrieval; failures degrade to none.
    async fn retrieve_exemplars(&self, session: &Session, history_end: usize) -> Vec<Exemplar> {
        if !session.settings.exemplar_search_enabled {
            return Vec::new();
        }
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };
        let Some(query_text) = session.messages[..history_end.min(session.messages.len())]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
        else {
            return Vec::new();
        };

        let query = match embedder.embed(&query_text).await {
            Ok(query) => query,
            Err(e) => {
                warn!(error = %e, "exemplar query embedding failed");
                return Vec::new();
            }
        };
        let filter = SearchFilter {
            allowed_sessions: None,
            model_replies_only: true,
        };
        match self.index.search_exemplars(&query, &filter, &self.config.memory) {
            Ok(exemplars) => exemplars,
            Err(e) => {
                warn!(error = %e, "exemplar search failed");
                Vec::new()
            }
        }
    }

    fn publish_live(&self, ticket: &RequestTicket, text: &str) {
        self.live.send_replace(LiveStream {
            session_id: Some(ticket.session_id.clone()),
            message_id: Some(ticket.placeholder_id.clone()),
            text: text.to_owned(),
        });
    }

    fn clear_live(&self, ticket: &RequestTicket) {
        self.live.send_if_modified(|live| {
            if live.message_id.as_deref() == Some(ticket.placeholder_id.as_str()) {
                *live = LiveStream::default();
                true
            } else {
                false
            }
        });
    }

    /// Post-completion side effects: auto-play synthesis, turn-pair
    /// embedding, periodic memory summarization and chapter archival.
    /// All fire-and-forget.
    fn spawn_side_effects(
        &self,
        ticket: &RequestTicket,
        preceding_user: Option<Message>,
        model_message: Message,
        message_count: usize,
    ) {
        let session_id = ticket.session_id.clone();
        let Some(session) = self.capture_session(&session_id) else {
            return;
        };
        let settings = session.settings.clone();

        if settings.auto_play_audio
            && let Some(fetcher) = &self.fetcher
            && !model_message.content.is_empty()
        {
            let fetcher = Arc::clone(fetcher);
            let playback = Arc::clone(&self.playback);
            let sessions = Arc::clone(&self.sessions);
            let message = model_message.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                auto_play_reply(fetcher, playback, sessions, session_id, message).await;
            });
        }

        if settings.memory_enabled
            && let (Some(embedder), Some(user)) = (&self.embedder, preceding_user)
        {
            let embedder = Arc::clone(embedder);
            let index = Arc::clone(&self.index);
            let sessions = Arc::clone(&self.sessions);
            let min_chars = self.config.memory.min_embed_chars;
            let session_id = session_id.clone();
            let title = session.title.clone();
            let model_message = model_message.clone();
            tokio::spawn(async move {
                embed_completed_pair(
                    embedder,
                    index,
                    sessions,
                    session_id,
                    title,
                    user,
                    model_message,
                    min_chars,
                )
                .await;
            });
        }

        if settings.memory_enabled
            && should_summarize(message_count, self.config.memory.summarize_every)
        {
            let provider = Arc::clone(&self.provider);
            let sessions = Arc::clone(&self.sessions);
            let session_id = session_id.clone();
            let anchor = model_message.id.clone();
            tokio::spawn(async move {
                summarize_memory(provider, sessions, session_id, anchor).await;
            });
        }

        if should_summarize(message_count, self.config.memory.archive_every) {
            let provider = Arc::clone(&self.provider);
            let sessions = Arc::clone(&self.sessions);
            let anchor = model_message.id.clone();
            tokio::spawn(async move {
                archive_chapter(provider, sessions, session_id, anchor).await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Background side-effect tasks
// ---------------------------------------------------------------------------

/// Synthesize and start playback of a completed reply, then stamp the
/// watermark (blobs are durable before the claim is made).
async fn auto_play_reply(
    fetcher: Arc<AudioFetcher>,
    playback: Arc<PlaybackSlot>,
    sessions: Arc<SessionController>,
    session_id: SessionId,
    message: Message,
) {
    let parts = split_into_segments(&message.content, TTS_SEGMENT_MAX_CHARS);
    if parts.is_empty() {
        return;
    }
    // A watermark claiming blobs that are gone is a cache inconsistency;
    // self-heal by treating the claim as a miss and re-synthesizing.
    if let Some(count) = message.cached_audio_segments
        && let Ok(missing) = fetcher.cache().missing_parts(&message.id, count)
        && !missing.is_empty()
    {
        let inconsistency = EngineError::CacheInconsistency(format!(
            "message {} claims {count} segments but parts {missing:?} are absent",
            message.id
        ));
        warn!(error = %inconsistency, "re-synthesizing missing audio");
    }
    match fetcher.fetch_all_parts(&message.id, &parts).await {
        Ok(outcomes) => {
            let complete = outcomes.iter().all(|o| {
                matches!(
                    o,
                    crate::audio::FetchOutcome::Cached(_)
                        | crate::audio::FetchOutcome::Synthesized(_)
                )
            });
            if !complete {
                return;
            }
            let count = parts.len() as u32;
            let message_id = message.id.clone();
            let edit = sessions.edit_session(&session_id, |session| {
                if let Some(found) = session.find_message_mut(&message_id) {
                    found.cached_audio_segments = Some(count);
                }
            });
            match edit {
                Ok(EditOutcome::Active) => {
                    if let Some(messages) = sessions
                        .with_active(|s| s.messages.clone())
                        .filter(|_| sessions.is_active(&session_id))
                    {
                        sessions.schedule_persist(&session_id, messages);
                    }
                    playback.begin(&message_id, 0);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to stamp audio watermark"),
            }
        }
        Err(e) => warn!(message = %message.id, error = %e, "auto-play synthesis failed"),
    }
}

/// Embed the completed user+model pair and flag the messages.
#[allow(clippy::too_many_arguments)]
async fn embed_completed_pair(
    embedder: SharedEmbedder,
    index: Arc<VectorIndex>,
    sessions: Arc<SessionController>,
    session_id: SessionId,
    session_title: String,
    user: Message,
    model: Message,
    min_chars: usize,
) {
    match crate::memory::embedder::embed_turn_pair(
        embedder.as_ref(),
        &index,
        &session_id,
        &session_title,
        None,
        &user,
        &model,
        min_chars,
    )
    .await
    {
        Ok(embedded) if !embedded.is_empty() => {
            let result = sessions.edit_session(&session_id, |session| {
                for id in &embedded {
                    if let Some(message) = session.find_message_mut(id) {
                        message.embedded = true;
                    }
                }
            });
            if let (Ok(EditOutcome::Active), Some(messages)) = (
                result,
                sessions.with_active(|s| s.messages.clone()),
            ) {
                sessions.schedule_persist(&session_id, messages);
            }
        }
        Ok(_) => {}
        Err(e) => warn!(session = %session_id, error = %e, "turn-pair embedding failed"),
    }
}

/// Ask the model to refresh the memory profile from recent turns.
/// Background, best-effort: failures log and vanish.
async fn summarize_memory(
    provider: Arc<dyn CompletionProvider>,
    sessions: Arc<SessionController>,
    session_id: SessionId,
    anchor: MessageId,
) {
    let Some(session) = session_for_maintenance(&sessions, &session_id) else {
        return;
    };
    let request = maintenance_request(
        &session,
        "Update this profile of the user from the conversation. Reply with \
         only the updated profile as compact JSON.",
        Some(&session.settings.memory_box_content),
    );

    match collect_response_text(provider.as_ref(), &request).await {
        Ok(profile) if !profile.trim().is_empty() => {
            let profile = profile.trim().to_owned();
            let result = sessions.edit_session(&session_id, |session| {
                record_snapshot(session, profile.clone(), SnapshotSource::Summarizer, anchor.clone());
            });
            match result {
                Ok(EditOutcome::Active) => {
                    if let Err(e) = sessions.persist_active_now() {
                        warn!(error = %e, "persisting summarized memory failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "recording summarized memory failed"),
            }
            debug!(session = %session_id, "memory profile summarized");
        }
        Ok(_) => {}
        Err(e) => warn!(session = %session_id, error = %e, "memory summarization failed"),
    }
}

/// Summarize the stretch since the archive pointer into a chapter and
/// advance the pointer.
async fn archive_chapter(
    provider: Arc<dyn CompletionProvider>,
    sessions: Arc<SessionController>,
    session_id: SessionId,
    anchor: MessageId,
) {
    let Some(session) = session_for_maintenance(&sessions, &session_id) else {
        return;
    };
    // Only the messages after the last archived one need summarizing.
    let start = session
        .settings
        .last_archived_message_id
        .as_deref()
        .and_then(|id| session.message_index(id).map(|i| i + 1))
        .unwrap_or(0);
    if start >= session.messages.len() {
        return;
    }

    let span = Session {
        messages: session.messages[start..].to_vec(),
        ..session.clone()
    };
    let request = maintenance_request(
        &span,
        "Summarize this stretch of conversation in two or three sentences, \
         then a short title on its own first line.",
        None,
    );

    match collect_response_text(provider.as_ref(), &request).await {
        Ok(text) if !text.trim().is_empty() => {
            let mut lines = text.trim().lines();
            let title = lines.next().unwrap_or("Chapter").trim().to_owned();
            let summary = lines.collect::<Vec<_>>().join("\n").trim().to_owned();
            let chapter = ChapterSummary {
                title,
                summary,
                up_to_message_id: anchor.clone(),
                created_at: now_epoch_secs(),
            };
            let result = sessions.edit_session(&session_id, |session| {
                session.settings.chapters.push(chapter.clone());
                session.settings.last_archived_message_id = Some(anchor.clone());
                session.settings.last_archived_at = Some(now_epoch_secs());
            });
            match result {
                Ok(EditOutcome::Active) => {
                    if let Err(e) = sessions.persist_active_now() {
                        warn!(error = %e, "persisting chapter archive failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "recording chapter archive failed"),
            }
            debug!(session = %session_id, "chapter archived");
        }
        Ok(_) => {}
        Err(e) => warn!(session = %session_id, error = %e, "chapter archival failed"),
    }
}

fn session_for_maintenance(
    sessions: &Arc<SessionController>,
    session_id: &str,
) -> Option<Session> {
    sessions
        .active_snapshot()
        .filter(|s| s.id == session_id)
        .or_else(|| sessions.store().get_session(session_id).ok().flatten())
}

/// A non-conversational request over the recent history.
fn maintenance_request(
    session: &Session,
    instruction: &str,
    current_profile: Option<&str>,
) -> CompletionRequest {
    let mut system = instruction.to_owned();
    if let Some(profile) = current_profile {
        system.push_str("\n\nCurrent profile:\n");
        system.push_str(profile);
    }
    CompletionRequest {
        model: session.settings.model.clone(),
        system_instruction: Some(system),
        turns: prompt::map_history(&session.messages),
        seed: None,
        temperature: None,
        tools: Vec::new(),
    }
}

/// Consume a provider stream into its accumulated text.
async fn collect_response_text(
    provider: &dyn CompletionProvider,
    request: &CompletionRequest,
) -> Result<String> {
    let mut stream = provider.stream(request).await?;
    let mut acc = TurnAccumulator::new();
    while let Some(event) = stream.next().await {
        acc.push(event);
    }
    let turn = acc.finish();
    if let Some((kind, message)) = turn.failure {
        return Err(EngineError::provider(kind, message));
    }
    Ok(turn.text)
}

impl FinishedTurn {
    /// An empty terminal view, used when cancellation lands before the
    /// stream opens.
    fn empty() -> Self {
        Self {
            text: String::new(),
            thoughts: String::new(),
            memory_update: None,
            finish: None,
            failure: None,
            saw_any_event: false,
        }
    }
}
