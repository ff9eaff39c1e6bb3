//! Morphing metrics sink.
//!
//! An explicitly constructed counter set, shared as `Arc<MorphMetrics>` by
//! the coordinator, the guarded store and the feedback learner. Nothing here
//! is global: each engine owns its sink, and tests reset or replace it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::feedback::FeedbackOutcome;
use crate::triggers::TriggerLayer;

/// Live counters.
#[derive(Debug, Default)]
pub struct MorphMetrics {
    messages: AtomicU64,
    switches: AtomicU64,
    instant_switches: AtomicU64,
    gradual_switches: AtomicU64,
    no_change: AtomicU64,
    anti_loop_blocks: AtomicU64,
    store_fallbacks: AtomicU64,
    invalid_references: AtomicU64,
    feedback_positive: AtomicU64,
    feedback_negative: AtomicU64,
    feedback_neutral: AtomicU64,
    /// persona id → committed switches into it
    persona_usage: DashMap<String, u64>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages: u64,
    pub switches: u64,
    pub instant_switches: u64,
    pub gradual_switches: u64,
    pub no_change: u64,
    pub anti_loop_blocks: u64,
    pub store_fallbacks: u64,
    pub invalid_references: u64,
    pub feedback_positive: u64,
    pub feedback_negative: u64,
    pub feedback_neutral: u64,
    pub persona_usage: Vec<(String, u64)>,
}

impl MorphMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self, persona_id: &str, layer: TriggerLayer) {
        self.switches.fetch_add(1, Ordering::Relaxed);
        match layer {
            TriggerLayer::Instant => self.instant_switches.fetch_add(1, Ordering::Relaxed),
            TriggerLayer::Gradual => self.gradual_switches.fetch_add(1, Ordering::Relaxed),
        };
        *self.persona_usage.entry(persona_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_no_change(&self) {
        self.no_change.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anti_loop_block(&self) {
        self.anti_loop_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_fallback(&self) {
        self.store_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_reference(&self) {
        self.invalid_references.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feedback(&self, outcome: FeedbackOutcome) {
        let counter = match outcome {
            FeedbackOutcome::Positive => &self.feedback_positive,
            FeedbackOutcome::Negative => &self.feedback_negative,
            FeedbackOutcome::Neutral => &self.feedback_neutral,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut persona_usage: Vec<(String, u64)> = self
            .persona_usage
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        persona_usage.sort();

        MetricsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            instant_switches: self.instant_switches.load(Ordering::Relaxed),
            gradual_switches: self.gradual_switches.load(Ordering::Relaxed),
            no_change: self.no_change.load(Ordering::Relaxed),
            anti_loop_blocks: self.anti_loop_blocks.load(Ordering::Relaxed),
            store_fallbacks: self.store_fallbacks.load(Ordering::Relaxed),
            invalid_references: self.invalid_references.load(Ordering::Relaxed),
            feedback_positive: self.feedback_positive.load(Ordering::Relaxed),
            feedback_negative: self.feedback_negative.load(Ordering::Relaxed),
            feedback_neutral: self.feedback_neutral.load(Ordering::Relaxed),
            persona_usage,
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.messages,
            &self.switches,
            &self.instant_switches,
            &self.gradual_switches,
            &self.no_change,
            &self.anti_loop_blocks,
            &self.store_fallbacks,
            &self.invalid_references,
            &self.feedback_positive,
            &self.feedback_negative,
            &self.feedback_neutral,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.persona_usage.clear();
    }
}
