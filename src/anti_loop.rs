//! Anti-loop protection: bounds how often a conversation switches persona.
//!
//! Two rules, checked against the conversation's switch ring:
//!
//! - **repeats**: counting the proposed switch itself, a persona may appear
//!   at most `max_repeats` times in any `window` consecutive switches.
//! - **cooldown**: no switch within `cooldown_secs` of the previous one.
//!
//! The guard only decides; the coordinator appends to the ring after commit.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::state::ConversationState;

/// Switch-frequency policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiLoopPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_repeats")]
    pub max_repeats: usize,
    /// Number of most recent switches inspected.
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default)]
    pub cooldown_secs: u64,
    /// Ring capacity (M).
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_max_repeats() -> usize {
    2
}
fn default_window() -> usize {
    3
}
fn default_history_size() -> usize {
    5
}

impl Default for AntiLoopPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_repeats: default_max_repeats(),
            window: default_window(),
            cooldown_secs: 0,
            history_size: default_history_size(),
        }
    }
}

impl AntiLoopPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_repeats == 0 {
            return Err(ConfigError::InvalidPolicy("anti_loop.max_repeats must be at least 1".into()));
        }
        if self.window == 0 {
            return Err(ConfigError::InvalidPolicy("anti_loop.window must be at least 1".into()));
        }
        if self.history_size < self.window {
            return Err(ConfigError::InvalidPolicy(format!(
                "anti_loop.history_size ({}) must be >= window ({})",
                self.history_size, self.window
            )));
        }
        Ok(())
    }
}

/// Why a switch was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    TooManyRepeats {
        persona_id: String,
        seen: usize,
        max_repeats: usize,
        window: usize,
    },
    Cooldown {
        elapsed_secs: i64,
        cooldown_secs: u64,
    },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::TooManyRepeats {
                persona_id,
                seen,
                max_repeats,
                window,
            } => write!(
                f,
                "'{}' already switched to {} time(s) in the last {} switches (max {})",
                persona_id, seen, window, max_repeats
            ),
            DenyReason::Cooldown {
                elapsed_secs,
                cooldown_secs,
            } => write!(
                f,
                "cooldown: {}s since last switch, {}s required",
                elapsed_secs, cooldown_secs
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allow,
    Deny(DenyReason),
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardVerdict::Allow)
    }
}

/// Stateless checker over a conversation's ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct AntiLoopGuard;

impl AntiLoopGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn check(
        &self,
        state: &ConversationState,
        candidate: &str,
        policy: &AntiLoopPolicy,
        now: DateTime<Utc>,
    ) -> GuardVerdict {
        if !policy.enabled {
            return GuardVerdict::Allow;
        }

        // the proposed switch would be the newest entry of its window
        let seen = state
            .last_switches(policy.window.saturating_sub(1))
            .filter(|s| s.persona_id == candidate)
            .count();
        if seen >= policy.max_repeats {
            return GuardVerdict::Deny(DenyReason::TooManyRepeats {
                persona_id: candidate.to_string(),
                seen,
                max_repeats: policy.max_repeats,
                window: policy.window,
            });
        }

        if let (Some(last), true) = (state.last_switch_at, policy.cooldown_secs > 0) {
            let elapsed = now.signed_duration_since(last);
            // a cooldown too long for chrono never expires
            let within = i64::try_from(policy.cooldown_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .map_or(true, |cooldown| elapsed < cooldown);
            if within {
                return GuardVerdict::Deny(DenyReason::Cooldown {
                    elapsed_secs: elapsed.num_seconds(),
                    cooldown_secs: policy.cooldown_secs,
                });
            }
        }

        GuardVerdict::Allow
    }
}
