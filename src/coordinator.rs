//! Morphing coordinator: one decision per incoming message.
//!
//! ```text
//! MessageReceived(text)
//!   1. disabled (global or conversation)          → NoChange
//!   2. instant phrase hit                         → candidate, confidence 1.0
//!   3. else best gradual candidate                → candidate | NoChange
//!   4. candidate == active persona                → NoChange
//!   5. anti-loop guard denies                     → NoChange (reason logged)
//!   6. continuity + transition plan, commit       → SwitchTo
//! ```
//!
//! Evaluation and commit are single-flight per conversation id; different
//! conversations run in parallel. Store trouble never fails a message: each
//! dependent feature falls back to its stateless default and the worst
//! outcome is "do not switch".
//!
//! State is versioned. A bounded local copy of each conversation's last
//! saved state is kept, and when a store write fails that copy is newer than
//! the store's, so it wins on the next load until a write goes through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::anti_loop::{AntiLoopGuard, AntiLoopPolicy, GuardVerdict};
use crate::config::{MorphingConfig, MorphingSettings};
use crate::error::{ConfigError, MorphError};
use crate::experiment::{EffectiveParameters, ExperimentController, ExperimentOutcome};
use crate::feedback::{FeedbackLearner, FeedbackOutcome, LearningSummary};
use crate::persona::{Persona, PersonaRegistry};
use crate::state::{ConversationContext, ConversationState, PendingFeedback, StateManager, SystemContextDelta};
use crate::store::{GuardedStore, KvStore, LocalCache};
use crate::telemetry::MorphMetrics;
use crate::transition::{TransitionPlan, TransitionPlanner};
use crate::triggers::{
    GradualAnalyzer, GradualLayerConfig, InstantLayerConfig, Signal, TriggerEvaluation, TriggerIndex, TriggerLayer,
};

// ============================================================================
// Decisions
// ============================================================================

/// Why a message did not switch persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoChangeReason {
    Disabled,
    NoCandidate,
    AlreadyActive,
    /// Refused by anti-loop protection; details are only logged.
    Blocked,
    InvalidReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MorphDecision {
    NoChange {
        active_persona_id: String,
        reason: NoChangeReason,
    },
    SwitchTo {
        persona_id: String,
        previous_persona_id: String,
        layer: TriggerLayer,
        confidence: f64,
        signals: Vec<Signal>,
        plan: TransitionPlan,
    },
}

/// Caller-facing record used to steer the next model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub switched: bool,
    pub active_persona_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_patch: Option<SystemContextDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<String>,
}

impl MorphDecision {
    pub fn is_switch(&self) -> bool {
        matches!(self, MorphDecision::SwitchTo { .. })
    }

    pub fn active_persona_id(&self) -> &str {
        match self {
            MorphDecision::NoChange { active_persona_id, .. } => active_persona_id,
            MorphDecision::SwitchTo { persona_id, .. } => persona_id,
        }
    }

    pub fn to_record(&self) -> DecisionRecord {
        match self {
            MorphDecision::NoChange { active_persona_id, .. } => DecisionRecord {
                switched: false,
                active_persona_id: active_persona_id.clone(),
                context_patch: None,
                announcement: None,
            },
            MorphDecision::SwitchTo { persona_id, plan, .. } => DecisionRecord {
                switched: true,
                active_persona_id: persona_id.clone(),
                context_patch: Some(plan.context_patch.clone()),
                announcement: plan.announcement.clone(),
            },
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct MorphingCoordinator {
    enabled: AtomicBool,
    settings: MorphingSettings,
    instant_layer: InstantLayerConfig,
    gradual_layer: GradualLayerConfig,
    anti_loop: AntiLoopPolicy,
    registry: Arc<PersonaRegistry>,
    index: TriggerIndex,
    analyzer: GradualAnalyzer,
    guard: AntiLoopGuard,
    state_manager: StateManager,
    planner: TransitionPlanner,
    feedback: FeedbackLearner,
    experiments: ExperimentController,
    store: GuardedStore,
    metrics: Arc<MorphMetrics>,
    /// Single-flight lock per conversation; removed once nobody holds it.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Last saved state per conversation, bounded.
    local: LocalCache<ConversationState>,
}

/// One conversation's critical section. Dropping it releases the lock and
/// forgets the lock entry when no other task is waiting on it.
struct ConversationSlot<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    conversation_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl MorphingCoordinator {
    /// Validate the config and build every component.
    pub fn new(config: MorphingConfig, store: Arc<dyn KvStore>, metrics: Arc<MorphMetrics>) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(config.build_registry()?);
        let store = GuardedStore::new(store, &config.store, metrics.clone());

        let index = TriggerIndex::new(&registry)?;
        let analyzer = GradualAnalyzer::new(registry.clone(), &config.gradual_layer);
        let planner = TransitionPlanner::new(config.settings.announcement_template.clone(), registry.iter())?;
        let feedback = FeedbackLearner::new(store.clone(), config.feedback.clone(), metrics.clone());
        let experiments = ExperimentController::new(config.experiments.clone(), store.clone())?;
        let local = LocalCache::new(store.local_cache_size());

        log::info!(
            "Morphing coordinator ready: {} personas, {} instant phrases, {} experiments, enabled={}",
            registry.len(),
            index.len(),
            experiments.experiments().len(),
            config.enabled
        );

        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            settings: config.settings,
            instant_layer: config.instant_layer,
            gradual_layer: config.gradual_layer,
            anti_loop: config.anti_loop,
            registry,
            index,
            analyzer,
            guard: AntiLoopGuard::new(),
            state_manager: StateManager::new(),
            planner,
            feedback,
            experiments,
            store,
            metrics,
            locks: DashMap::new(),
            local,
        })
    }

    pub fn registry(&self) -> &PersonaRegistry {
        &self.registry
    }

    pub fn feedback(&self) -> &FeedbackLearner {
        &self.feedback
    }

    pub fn experiments(&self) -> &ExperimentController {
        &self.experiments
    }

    pub fn metrics(&self) -> &Arc<MorphMetrics> {
        &self.metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Global kill switch.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Decide, and on a switch commit, for one incoming user message.
    ///
    /// The previous switch, if any, is first judged against this message.
    pub async fn process_message(&self, ctx: &dyn ConversationContext, text: &str) -> MorphDecision {
        let conversation_id = ctx.conversation_id().to_string();
        let _slot = self.acquire(&conversation_id).await;

        self.metrics.record_message();
        let mut state = self.load_state(&conversation_id).await;

        if !self.is_enabled() || !state.enabled {
            self.metrics.record_no_change();
            return MorphDecision::NoChange {
                active_persona_id: state.active_persona_id,
                reason: NoChangeReason::Disabled,
            };
        }

        if let Some(pending) = state.pending_feedback.take() {
            self.judge_previous_switch(&conversation_id, &pending, text).await;
        }

        state.recent_turns = ctx.recent_turns(self.settings.history_turns);
        let intent = self.analyzer.classify(text).intent;
        let params = self.effective_parameters(&conversation_id).await;
        let now = Utc::now();

        let decision = match self.select(&state, text, &params, now).await {
            Ok(candidate) => {
                let decision = self.plan_switch(&state, text, &intent, &candidate);
                if let Some(plan) = decision_plan(&decision) {
                    state.record_switch(&candidate.persona_id, now, self.anti_loop.history_size);
                    state.pending_feedback = Some(PendingFeedback {
                        persona_id: candidate.persona_id.clone(),
                        layer: candidate.layer,
                        signals: candidate.signals.clone(),
                        trigger_message: text.to_string(),
                        confidence: candidate.confidence,
                        experiments: params.assignments.clone(),
                        switched_at: now,
                    });
                    ctx.merge_context(&plan.context_patch);
                    self.metrics.record_switch(&candidate.persona_id, candidate.layer);
                    for assignment in &params.assignments {
                        self.experiments
                            .record_outcome(&assignment.experiment_id, assignment.variant, ExperimentOutcome::Attempt)
                            .await;
                    }
                    log::info!(
                        "Conversation {} switched to '{}' ({})",
                        conversation_id,
                        candidate.persona_id,
                        plan.reason
                    );
                } else {
                    self.metrics.record_no_change();
                }
                decision
            }
            Err(reason) => {
                self.metrics.record_no_change();
                MorphDecision::NoChange {
                    active_persona_id: state.active_persona_id.clone(),
                    reason,
                }
            }
        };

        state.last_intent = Some(intent);
        self.save_state(&mut state).await;
        decision
    }

    /// What [`process_message`](Self::process_message) would decide, without
    /// judging feedback or committing anything.
    pub async fn evaluate(&self, ctx: &dyn ConversationContext, text: &str) -> MorphDecision {
        let conversation_id = ctx.conversation_id().to_string();
        let _slot = self.acquire(&conversation_id).await;

        let mut state = self.load_state(&conversation_id).await;
        if !self.is_enabled() || !state.enabled {
            return MorphDecision::NoChange {
                active_persona_id: state.active_persona_id,
                reason: NoChangeReason::Disabled,
            };
        }
        state.recent_turns = ctx.recent_turns(self.settings.history_turns);
        let intent = self.analyzer.classify(text).intent;
        let params = self.effective_parameters(&conversation_id).await;

        match self.select(&state, text, &params, Utc::now()).await {
            Ok(candidate) => self.plan_switch(&state, text, &intent, &candidate),
            Err(reason) => MorphDecision::NoChange {
                active_persona_id: state.active_persona_id.clone(),
                reason,
            },
        }
    }

    /// Feedback stats for every persona plus the top failing and succeeding
    /// trigger patterns.
    pub async fn learning_summary(&self) -> LearningSummary {
        self.feedback.learning_summary(self.registry.ids()).await
    }

    /// Current persona of a conversation.
    pub async fn active_persona(&self, conversation_id: &str) -> String {
        self.load_state(conversation_id).await.active_persona_id
    }

    /// Enable or disable morphing for one conversation.
    pub async fn set_conversation_enabled(&self, conversation_id: &str, enabled: bool) {
        let _slot = self.acquire(conversation_id).await;
        let mut state = self.load_state(conversation_id).await;
        state.enabled = enabled;
        self.save_state(&mut state).await;
        log::info!("Morphing {} for conversation {}", if enabled { "enabled" } else { "disabled" }, conversation_id);
    }

    /// Back to the default persona with an empty switch history. Cached
    /// state and experiment assignments for the conversation are dropped;
    /// stored assignments are kept.
    pub async fn reset_conversation(&self, conversation_id: &str) {
        let _slot = self.acquire(conversation_id).await;
        let previous = self.load_state(conversation_id).await;
        let mut state = ConversationState::new(conversation_id, self.registry.default_id());
        state.version = previous.version;
        if self.save_state(&mut state).await {
            self.local.remove(conversation_id);
        }
        self.experiments.forget_subject(conversation_id);
        log::info!("Conversation {} reset to '{}'", conversation_id, self.registry.default_id());
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    /// Steps 2–5: find the candidate and check it may be switched to.
    async fn select(
        &self,
        state: &ConversationState,
        text: &str,
        params: &EffectiveParameters,
        now: DateTime<Utc>,
    ) -> Result<TriggerEvaluation, NoChangeReason> {
        let candidate = self.find_candidate(state, text, params).await?;

        if !self.registry.contains(&candidate.persona_id) {
            let err = MorphError::InvalidPersonaReference(candidate.persona_id.clone());
            log::error!("Invariant violated in conversation {}: {}", state.conversation_id, err);
            self.metrics.record_invalid_reference();
            return Err(NoChangeReason::InvalidReference);
        }

        if candidate.persona_id == state.active_persona_id {
            log::debug!("'{}' already active in {}", candidate.persona_id, state.conversation_id);
            return Err(NoChangeReason::AlreadyActive);
        }

        let policy = AntiLoopPolicy {
            max_repeats: params.max_repeats,
            cooldown_secs: params.cooldown_secs,
            ..self.anti_loop.clone()
        };
        if let GuardVerdict::Deny(reason) = self.guard.check(state, &candidate.persona_id, &policy, now) {
            log::info!(
                "Anti-loop blocked switch '{}' -> '{}' in {}: {}",
                state.active_persona_id,
                candidate.persona_id,
                state.conversation_id,
                reason
            );
            self.metrics.record_anti_loop_block();
            return Err(NoChangeReason::Blocked);
        }

        Ok(candidate)
    }

    async fn find_candidate(
        &self,
        state: &ConversationState,
        text: &str,
        params: &EffectiveParameters,
    ) -> Result<TriggerEvaluation, NoChangeReason> {
        if self.instant_layer.enabled {
            if let Some(hit) = self.index.best_match(text) {
                log::debug!("Instant trigger '{}' -> '{}'", hit.phrase, hit.persona_id);
                return Ok(TriggerEvaluation::instant(&hit));
            }
        }

        if self.gradual_layer.enabled {
            let candidates = self
                .analyzer
                .score(
                    text,
                    state,
                    &state.active_persona_id,
                    params.confidence_threshold,
                    &self.feedback,
                )
                .await;
            if let Some(best) = candidates.into_iter().next() {
                log::debug!("Gradual candidate {}", best.reason());
                return Ok(best);
            }
        }

        Err(NoChangeReason::NoCandidate)
    }

    /// Step 6 without the commit.
    fn plan_switch(
        &self,
        state: &ConversationState,
        text: &str,
        intent: &str,
        candidate: &TriggerEvaluation,
    ) -> MorphDecision {
        let (Some(old), Some(new)) = (
            self.persona(&state.active_persona_id),
            self.persona(&candidate.persona_id),
        ) else {
            return MorphDecision::NoChange {
                active_persona_id: state.active_persona_id.clone(),
                reason: NoChangeReason::InvalidReference,
            };
        };

        let patch = self.state_manager.capture_continuity(state, text, Some(intent));
        let delta = self.state_manager.apply(new, patch);
        let plan = self
            .planner
            .plan(old, new, self.settings.transition_style, candidate.reason(), delta);

        MorphDecision::SwitchTo {
            persona_id: candidate.persona_id.clone(),
            previous_persona_id: state.active_persona_id.clone(),
            layer: candidate.layer,
            confidence: candidate.confidence,
            signals: candidate.signals.clone(),
            plan,
        }
    }

    async fn judge_previous_switch(&self, conversation_id: &str, pending: &PendingFeedback, text: &str) {
        let outcome = self.feedback.inspect(conversation_id, pending, text).await;
        let experiment_outcome = match outcome {
            FeedbackOutcome::Positive => ExperimentOutcome::Positive,
            FeedbackOutcome::Negative => ExperimentOutcome::Negative,
            FeedbackOutcome::Neutral => return,
        };
        for assignment in &pending.experiments {
            self.experiments
                .record_outcome(&assignment.experiment_id, assignment.variant, experiment_outcome)
                .await;
        }
    }

    async fn effective_parameters(&self, conversation_id: &str) -> EffectiveParameters {
        let base = EffectiveParameters::base(
            self.gradual_layer.confidence_threshold,
            self.anti_loop.max_repeats,
            self.anti_loop.cooldown_secs,
        );
        self.experiments.effective_parameters(conversation_id, base).await
    }

    fn persona(&self, id: &str) -> Option<&Persona> {
        let persona = self.registry.get(id);
        if persona.is_none() {
            log::error!("{}", MorphError::InvalidPersonaReference(id.to_string()));
            self.metrics.record_invalid_reference();
        }
        persona
    }

    // ------------------------------------------------------------------------
    // State persistence
    // ------------------------------------------------------------------------

    async fn acquire(&self, conversation_id: &str) -> ConversationSlot<'_> {
        let lock = self.locks.entry(conversation_id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        ConversationSlot {
            locks: &self.locks,
            conversation_id: conversation_id.to_string(),
            guard: Some(guard),
        }
    }

    async fn load_state(&self, conversation_id: &str) -> ConversationState {
        let key = self.store.keys().conversation(conversation_id);
        let local = self.local.get(conversation_id);
        let loaded = match self.store.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str::<ConversationState>(&json) {
                Ok(stored) => Some(match local {
                    // the last write never reached the store
                    Some(newer) if newer.version > stored.version => {
                        log::warn!(
                            "Conversation {}: stored state v{} is behind local v{}, using local",
                            conversation_id,
                            stored.version,
                            newer.version
                        );
                        newer
                    }
                    _ => stored,
                }),
                Err(e) => {
                    log::warn!("Unreadable state for conversation {}: {}", conversation_id, e);
                    local
                }
            },
            Ok(None) => local,
            // store down: keep the persona, forget the switch history
            Err(_) => local.map(|mut state| {
                state.switches.clear();
                state.last_switch_at = None;
                state
            }),
        };

        let mut state =
            loaded.unwrap_or_else(|| ConversationState::new(conversation_id, self.registry.default_id()));
        state.conversation_id = conversation_id.to_string();
        if !self.registry.contains(&state.active_persona_id) {
            log::error!(
                "Conversation {}: {}; resetting to default",
                conversation_id,
                MorphError::InvalidPersonaReference(state.active_persona_id.clone())
            );
            self.metrics.record_invalid_reference();
            state.active_persona_id = self.registry.default_id().to_string();
            state.pending_feedback = None;
        }
        state
    }

    /// Bump the version and write through; `true` if the store took it.
    async fn save_state(&self, state: &mut ConversationState) -> bool {
        state.version += 1;
        self.local.insert(state.conversation_id.clone(), state.clone());
        match serde_json::to_string(state) {
            Ok(json) => {
                let key = self.store.keys().conversation(&state.conversation_id);
                self.store.set(&key, &json).await.is_ok()
            }
            Err(e) => {
                log::error!("Failed to encode state for {}: {}", state.conversation_id, e);
                false
            }
        }
    }
}

fn decision_plan(decision: &MorphDecision) -> Option<&TransitionPlan> {
    match decision {
        MorphDecision::SwitchTo { plan, .. } => Some(plan),
        MorphDecision::NoChange { .. } => None,
    }
}
