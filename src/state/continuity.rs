//! Continuity across a persona switch.
//!
//! The outgoing persona hands the incoming one a [`ContinuityPatch`]: a
//! handful of fields describing where the conversation stands. The dialogue
//! history itself is never rewritten. There is no rollback: a wrong switch
//! is only corrected by feedback shaping later decisions.

use serde::{Deserialize, Serialize};

use super::{ConversationState, TurnRole};
use crate::persona::{ModelOverrides, Persona, RagOverride};

/// Turns quoted in the continuity summary.
const SUMMARY_TURNS: usize = 3;
/// Characters kept per quoted turn.
const SUMMARY_TURN_CHARS: usize = 50;
/// Characters kept of the open topic.
const TOPIC_CHARS: usize = 120;

const INITIAL_SUMMARY: &str = "initial conversation";

/// Minimal context carried from the outgoing persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityPatch {
    pub previous_persona_id: String,
    /// What the user is currently talking about.
    pub open_topic: Option<String>,
    /// Most recent user question not yet answered by the new persona.
    pub last_unresolved_request: Option<String>,
    pub last_intent: Option<String>,
    /// Short quote of the last turns, or "initial conversation".
    pub summary: String,
}

impl ContinuityPatch {
    /// A patch is empty when it carries nothing but the previous persona id.
    pub fn is_empty(&self) -> bool {
        self.open_topic.is_none()
            && self.last_unresolved_request.is_none()
            && self.last_intent.is_none()
            && self.summary.is_empty()
    }
}

/// What the caller merges into the incoming persona's system context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemContextDelta {
    pub persona_id: String,
    pub personality: String,
    #[serde(flatten)]
    pub model: ModelOverrides,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag: Option<RagOverride>,
    /// Continuity note appended to the system prompt.
    pub system_note: String,
    pub continuity: ContinuityPatch,
}

/// Captures and applies continuity patches.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateManager;

impl StateManager {
    pub fn new() -> Self {
        Self
    }

    /// Summarize the outgoing persona's working context.
    ///
    /// `message` is the message that caused the switch and `current_intent`
    /// its classified intent.
    pub fn capture_continuity(
        &self,
        state: &ConversationState,
        message: &str,
        current_intent: Option<&str>,
    ) -> ContinuityPatch {
        let message = message.trim();
        let open_topic = (!message.is_empty()).then(|| truncate(message, TOPIC_CHARS));

        let last_unresolved_request = std::iter::once(message)
            .chain(
                state
                    .recent_turns
                    .iter()
                    .rev()
                    .filter(|t| t.role == TurnRole::User)
                    .map(|t| t.content.trim()),
            )
            .find(|text| is_question(text))
            .map(|text| truncate(text, TOPIC_CHARS));

        let last_intent = current_intent
            .map(str::to_string)
            .or_else(|| state.last_intent.clone());

        ContinuityPatch {
            previous_persona_id: state.active_persona_id.clone(),
            open_topic,
            last_unresolved_request,
            last_intent,
            summary: summarize(state),
        }
    }

    /// Merge the patch into the incoming persona's system context.
    pub fn apply(&self, new_persona: &Persona, patch: ContinuityPatch) -> SystemContextDelta {
        let mut note = format!("Continuing a conversation previously handled as '{}'.", patch.previous_persona_id);
        if let Some(topic) = &patch.open_topic {
            note.push_str(&format!(" Open topic: {}.", topic));
        }
        if let Some(request) = &patch.last_unresolved_request {
            note.push_str(&format!(" Pending request: {}", request));
        }
        if let Some(intent) = &patch.last_intent {
            note.push_str(&format!(" Detected intent: {}.", intent));
        }
        note.push_str(&format!(" Recent context: {}", patch.summary));

        SystemContextDelta {
            persona_id: new_persona.id.clone(),
            personality: new_persona.personality.clone(),
            model: new_persona.model.clone(),
            tools: new_persona.tools.clone(),
            rag: new_persona.rag.clone(),
            system_note: note,
            continuity: patch,
        }
    }
}

fn is_question(text: &str) -> bool {
    text.contains('?') || text.contains('¿')
}

fn summarize(state: &ConversationState) -> String {
    let turns = &state.recent_turns;
    if turns.len() <= 2 {
        return INITIAL_SUMMARY.to_string();
    }
    turns[turns.len() - SUMMARY_TURNS..]
        .iter()
        .map(|t| {
            let who = match t.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            };
            format!("{}: {}", who, truncate(t.content.trim(), SUMMARY_TURN_CHARS))
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Truncate on a char boundary, marking the cut with `...`.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Turn;

    #[test]
    fn test_initial_conversation_summary() {
        let mut state = ConversationState::new("c1", "general");
        state.recent_turns = vec![Turn::user("hola")];
        let patch = StateManager::new().capture_continuity(&state, "quiero comprar una laptop", Some("purchase_inquiry"));
        assert_eq!(patch.previous_persona_id, "general");
        assert_eq!(patch.summary, "initial conversation");
        assert_eq!(patch.open_topic.as_deref(), Some("quiero comprar una laptop"));
        assert_eq!(patch.last_intent.as_deref(), Some("purchase_inquiry"));
        assert!(patch.last_unresolved_request.is_none());
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_summary_quotes_last_three_turns_truncated() {
        let mut state = ConversationState::new("c1", "general");
        state.recent_turns = vec![
            Turn::user("primero"),
            Turn::assistant("hola"),
            Turn::user("¿tienen laptops gamer?"),
            Turn::assistant(&"x".repeat(80)),
        ];
        let patch = StateManager::new().capture_continuity(&state, "quiero comprar", None);
        let parts: Vec<&str> = patch.summary.split(" | ").collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "assistant: hola");
        assert!(parts[2].ends_with("..."));
        assert_eq!(parts[2].len(), "assistant: ".len() + 50 + 3);
        assert_eq!(
            patch.last_unresolved_request.as_deref(),
            Some("¿tienen laptops gamer?")
        );
    }

    #[test]
    fn test_falls_back_to_stored_intent() {
        let mut state = ConversationState::new("c1", "general");
        state.last_intent = Some("support_request".into());
        let patch = StateManager::new().capture_continuity(&state, "hola", None);
        assert_eq!(patch.last_intent.as_deref(), Some("support_request"));
    }

    #[test]
    fn test_apply_carries_persona_view() {
        let persona = Persona::new("sales", "Sales specialist").with_capability("sales");
        let state = ConversationState::new("c1", "general");
        let manager = StateManager::new();
        let patch = manager.capture_continuity(&state, "¿cuánto cuesta?", Some("purchase_inquiry"));
        let delta = manager.apply(&persona, patch);
        assert_eq!(delta.persona_id, "sales");
        assert_eq!(delta.personality, "Sales specialist");
        assert!(delta.system_note.contains("'general'"));
        assert!(delta.system_note.contains("¿cuánto cuesta?"));
        assert_eq!(delta.continuity.previous_persona_id, "general");
    }
}
