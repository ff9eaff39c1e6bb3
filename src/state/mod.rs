//! Per-conversation morphing state and the conversation context seam.
//!
//! [`ConversationState`] is what the coordinator persists between messages:
//! the active persona, the bounded ring of recent switches, and the decision
//! awaiting implicit feedback. Dialogue turns are only ever borrowed from the
//! host through [`ConversationContext`]; they are never persisted here.

pub mod continuity;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::experiment::VariantRef;
use crate::triggers::{Signal, TriggerLayer};

pub use continuity::{ContinuityPatch, StateManager, SystemContextDelta};

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One dialogue turn, as exposed by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// One committed switch in the anti-loop ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchEntry {
    pub persona_id: String,
    pub at: DateTime<Utc>,
}

/// A committed switch waiting for the user's next message to judge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFeedback {
    pub persona_id: String,
    pub layer: TriggerLayer,
    /// Signals that caused the switch.
    pub signals: Vec<Signal>,
    /// The message that caused the switch.
    pub trigger_message: String,
    pub confidence: f64,
    /// Experiment variants the conversation was assigned when it switched.
    #[serde(default)]
    pub experiments: Vec<VariantRef>,
    pub switched_at: DateTime<Utc>,
}

/// Persisted morphing state of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub active_persona_id: String,
    /// Recent switches, oldest first. Never longer than the configured size.
    #[serde(default)]
    pub switches: VecDeque<SwitchEntry>,
    #[serde(default)]
    pub last_switch_at: Option<DateTime<Utc>>,
    /// Intent of the last message seen.
    #[serde(default)]
    pub last_intent: Option<String>,
    /// Per-conversation kill switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pending_feedback: Option<PendingFeedback>,
    /// Bumped on every save; the higher of two copies is the newer.
    #[serde(default)]
    pub version: u64,
    /// Last K turns, filled from the context accessor on every evaluation.
    #[serde(skip)]
    pub recent_turns: Vec<Turn>,
}

fn default_true() -> bool {
    true
}

impl ConversationState {
    /// Fresh state on the given persona.
    pub fn new(conversation_id: impl Into<String>, persona_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            active_persona_id: persona_id.into(),
            switches: VecDeque::new(),
            last_switch_at: None,
            last_intent: None,
            enabled: true,
            pending_feedback: None,
            version: 0,
            recent_turns: Vec::new(),
        }
    }

    /// Make `persona_id` active and append it to the ring, evicting the oldest
    /// entries beyond `capacity`.
    pub fn record_switch(&mut self, persona_id: &str, at: DateTime<Utc>, capacity: usize) {
        self.active_persona_id = persona_id.to_string();
        self.last_switch_at = Some(at);
        self.switches.push_back(SwitchEntry {
            persona_id: persona_id.to_string(),
            at,
        });
        while self.switches.len() > capacity {
            self.switches.pop_front();
        }
    }

    /// The `n` most recent ring entries, oldest first.
    pub fn last_switches(&self, n: usize) -> impl Iterator<Item = &SwitchEntry> {
        let skip = self.switches.len().saturating_sub(n);
        self.switches.iter().skip(skip)
    }
}

/// Host-side access to a conversation.
///
/// The engine reads recent turns and writes the context delta produced by a
/// switch; it never touches the dialogue history otherwise.
pub trait ConversationContext: Send + Sync {
    fn conversation_id(&self) -> &str;

    /// Up to `limit` most recent turns, oldest first, excluding the message
    /// being evaluated.
    fn recent_turns(&self, limit: usize) -> Vec<Turn>;

    /// Merge the delta into the context used for the next model call.
    fn merge_context(&self, delta: &SystemContextDelta);
}

/// In-process [`ConversationContext`], used by the console and tests.
#[derive(Debug, Default)]
pub struct InMemoryConversation {
    id: String,
    turns: RwLock<Vec<Turn>>,
    merged: RwLock<Vec<SystemContextDelta>>,
}

impl InMemoryConversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: RwLock::new(Vec::new()),
            merged: RwLock::new(Vec::new()),
        }
    }

    pub fn push_turn(&self, turn: Turn) {
        self.turns.write().push(turn);
    }

    /// The most recently merged delta.
    pub fn last_delta(&self) -> Option<SystemContextDelta> {
        self.merged.read().last().cloned()
    }

    /// Number of deltas merged so far.
    pub fn merge_count(&self) -> usize {
        self.merged.read().len()
    }
}

impl ConversationContext for InMemoryConversation {
    fn conversation_id(&self) -> &str {
        &self.id
    }

    fn recent_turns(&self, limit: usize) -> Vec<Turn> {
        let turns = self.turns.read();
        let skip = turns.len().saturating_sub(limit);
        turns[skip..].to_vec()
    }

    fn merge_context(&self, delta: &SystemContextDelta) {
        self.merged.write().push(delta.clone());
    }
}
