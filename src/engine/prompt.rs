//! Generation request assembly.
//!
//! Maps conversation history into provider turns and composes the
//! system instruction from the persona plus injected context: the memory
//! profile, retrieved exemplars, a time-since-last-turn note, and a
//! periodic reminder. The generation seed is decided here, once per
//! request, and recorded on the eventual message for reproducibility.

use rand::Rng;

use crate::config::PromptConfig;
use crate::memory::types::Exemplar;
use crate::provider::{CompletionRequest, ProviderTurn, ToolDeclaration};
use crate::session::types::{Message, Role, Session, now_epoch_secs};

use super::accumulator::MEMORY_TOOL_NAME;

/// Literal sentinel the model embeds to mark a reply it considers a
/// highlight; translated to the favorite flag at reconciliation.
///
/// This is a compatibility convention, not a robust protocol: if the
/// marker ever appears in legitimate content it will be stripped and the
/// message starred.
pub const FAVORITE_MARKER: &str = "[[favorite]]";

/// Persona reminder re-injected on a fixed cadence.
const REMINDER_TEXT: &str =
    "Reminder: stay consistent with your persona and the conversation so far.";

/// Decide the generation seed: the explicit override, or a fresh draw.
pub fn choose_seed(override_seed: Option<u64>) -> u64 {
    override_seed.unwrap_or_else(|| rand::thread_rng().r#gen())
}

/// The memory tool offered to the model when memory is enabled.
pub fn memory_tool_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: MEMORY_TOOL_NAME.to_owned(),
        description: "Replace the stored profile of the user with updated content. \
                      Call whenever you learn something durable about them."
            .to_owned(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The complete updated profile as a JSON string."
                }
            },
            "required": ["content"]
        }),
    }
}

/// Map conversation history into the provider's turn format.
///
/// User and model turns carry over; error turns, injected system
/// markers, and still-streaming placeholders are not part of the
/// provider's view.
pub fn map_history(messages: &[Message]) -> Vec<ProviderTurn> {
    messages
        .iter()
        .filter(|m| !m.is_streaming)
        .filter_map(|m| match m.role {
            Role::User => Some(ProviderTurn {
                role: crate::provider::TurnRole::User,
                text: m.content.clone(),
                attachments: m.attachments.clone(),
            }),
            Role::Model => {
                if m.content.is_empty() {
                    None
                } else {
                    Some(ProviderTurn::assistant(m.content.clone()))
                }
            }
            Role::Error | Role::System => None,
        })
        .collect()
}

/// Build the full request for one generation.
///
/// `history_end` bounds the messages considered (exclusive); regeneration
/// truncates history at the preceding user turn.
pub fn build_request(
    session: &Session,
    history_end: usize,
    exemplars: &[Exemplar],
    config: &PromptConfig,
    seed: u64,
) -> CompletionRequest {
    let history = &session.messages[..history_end.min(session.messages.len())];
    let turns = map_history(history);
    let turn_count = turns.len();

    let system_instruction = compose_system_instruction(
        session,
        exemplars,
        turn_count,
        last_turn_timestamp(history),
        config,
    );

    let mut tools = Vec::new();
    if session.settings.memory_enabled {
        tools.push(memory_tool_declaration());
    }

    CompletionRequest {
        model: session.settings.model.clone(),
        system_instruction,
        turns,
        seed: Some(seed),
        temperature: None,
        tools,
    }
}

/// Compose persona + injected context into one system instruction.
fn compose_system_instruction(
    session: &Session,
    exemplars: &[Exemplar],
    turn_count: usize,
    last_turn_at: Option<u64>,
    config: &PromptConfig,
) -> Option<String> {
    let settings = &session.settings;
    let mut sections: Vec<String> = Vec::new();

    if !settings.system_instruction.trim().is_empty() {
        sections.push(settings.system_instruction.trim().to_owned());
    }

    if !settings.characters.is_empty() {
        let mut block = String::from("Characters you may speak as:");
        for character in &settings.characters {
            block.push_str(&format!("\n- {}: {}", character.name, character.persona));
        }
        sections.push(block);
    }

    if settings.memory_enabled && !is_empty_profile(&settings.memory_box_content) {
        sections.push(format!(
            "What you remember about the user (keep current via the {MEMORY_TOOL_NAME} tool):\n{}",
            settings.memory_box_content
        ));
    }

    if !exemplars.is_empty() {
        let mut block = String::from("Past exchanges, for tone and style only:");
        for exemplar in exemplars {
            block.push_str(&format!(
                "\n[{}] User: {} | You: {}",
                exemplar.context, exemplar.user_query, exemplar.companion_reply
            ));
        }
        sections.push(block);
    }

    sections.push(format!("(Today is {}.)", current_date()));
    if let Some(last) = last_turn_at {
        let gap = now_epoch_secs().saturating_sub(last);
        if gap >= config.time_gap_note_secs {
            sections.push(format!(
                "(It has been about {} since the previous exchange.)",
                humanize_gap(gap)
            ));
        }
    }

    if config.reminder_every > 0 && turn_count > 0 && turn_count % config.reminder_every == 0 {
        sections.push(REMINDER_TEXT.to_owned());
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Timestamp of the most recent real turn in the history slice.
fn last_turn_timestamp(messages: &[Message]) -> Option<u64> {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User | Role::Model) && !m.is_streaming)
        .map(|m| m.timestamp)
}

fn is_empty_profile(content: &str) -> bool {
    let trimmed = content.trim();
    trimmed.is_empty() || trimmed == crate::session::types::EMPTY_MEMORY
}

/// Human-readable current date for the system instruction.
fn current_date() -> String {
    chrono::Local::now().format("%A, %e %B %Y").to_string()
}

fn humanize_gap(secs: u64) -> String {
    match secs {
        0..=119 => format!("{secs} seconds"),
        120..=7_199 => format!("{} minutes", secs / 60),
        7_200..=172_799 => format!("{} hours", secs / 3_600),
        _ => format!("{} days", secs / 86_400),
    }
}

/// Detect and strip the favorite marker from final text.
///
/// Returns the cleaned text and whether the marker was present.
pub fn detect_favorite(text: &str) -> (String, bool) {
    if !text.contains(FAVORITE_MARKER) {
        return (text.to_owned(), false);
    }
    let cleaned = text.replace(FAVORITE_MARKER, "");
    (cleaned.trim().to_owned(), true)
}
