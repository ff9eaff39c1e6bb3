//! # Morphing
//!
//! Live persona morphing for conversational assistants.
//!
//! For every incoming user message the engine decides whether the
//! assistant's active persona should change, which persona to switch to,
//! whether the switch is safe, and how to present it. It learns from the
//! user's implicit reaction to each switch and runs live experiments over
//! its own parameters.
//!
//! ```text
//! message → MorphingCoordinator
//!             → TriggerIndex (instant) | GradualAnalyzer (scored)
//!             → AntiLoopGuard
//!             → StateManager + TransitionPlanner
//!             → MorphDecision
//! next message → FeedbackLearner → adjustments → GradualAnalyzer
//! ```
//!
//! Persistence goes through the [`store::KvStore`] seam; [`store::InMemoryStore`]
//! is the in-process backend.

pub mod anti_loop;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod experiment;
pub mod feedback;
pub mod persona;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transition;
pub mod triggers;

pub use anti_loop::{AntiLoopGuard, AntiLoopPolicy, DenyReason, GuardVerdict};
pub use config::MorphingConfig;
pub use coordinator::{DecisionRecord, MorphDecision, MorphingCoordinator, NoChangeReason};
pub use error::{ConfigError, MorphError, StoreError};
pub use experiment::{ExperimentController, ExperimentDefinition, TunableParameter};
pub use feedback::{FeedbackLearner, FeedbackOutcome, FeedbackRecord, LearningSummary, PatternScore};
pub use persona::{Persona, PersonaRegistry};
pub use state::{ConversationContext, ConversationState, InMemoryConversation, StateManager, Turn};
pub use store::{InMemoryStore, KvStore, LocalCache};
pub use telemetry::MorphMetrics;
pub use transition::{TransitionPlanner, TransitionStyle};
pub use triggers::{GradualAnalyzer, Signal, TriggerEvaluation, TriggerIndex, TriggerLayer};
