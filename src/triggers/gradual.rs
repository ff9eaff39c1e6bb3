//! Gradual analyzer: multi-signal scoring on the slow path.
//!
//! Each persona with a `gradual_triggers` block is scored against the
//! message:
//!
//! | signal      | default weight | condition                                         |
//! |-------------|----------------|---------------------------------------------------|
//! | keyword     | 2 per match    | keyword occurs in the message                     |
//! | intent      | 3              | classified intent is one of the persona's intents |
//! | emotion     | 2              | a detected emotion is one of the persona's        |
//! | continuity  | 2              | a matched keyword also occurs in the recent turns |
//!
//! Learned adjustments for each contributing `(persona, signal)` pair are
//! added to the raw score, which is then normalized by `max_score` and
//! clamped to `[0, 1]`.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::signals::{default_emotion_rules, default_intent_rules, EmotionDetector, IntentClassifier, PhraseRule};
use super::{Signal, TriggerEvaluation, TriggerLayer};
use crate::error::ConfigError;
use crate::persona::{Persona, PersonaRegistry};
use crate::state::{ConversationState, TurnRole};

/// Comparison slack for threshold checks on normalized floats.
const EPSILON: f64 = 1e-9;

/// Per-signal weights, in raw-score points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_keyword_weight")]
    pub keyword: f64,
    #[serde(default = "default_intent_weight")]
    pub intent: f64,
    #[serde(default = "default_emotion_weight")]
    pub emotion: f64,
    #[serde(default = "default_continuity_weight")]
    pub continuity: f64,
}

fn default_keyword_weight() -> f64 {
    2.0
}
fn default_intent_weight() -> f64 {
    3.0
}
fn default_emotion_weight() -> f64 {
    2.0
}
fn default_continuity_weight() -> f64 {
    2.0
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            keyword: default_keyword_weight(),
            intent: default_intent_weight(),
            emotion: default_emotion_weight(),
            continuity: default_continuity_weight(),
        }
    }
}

/// Gradual layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradualLayerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base global confidence threshold; experiments may override it.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Normalization ceiling.
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    #[serde(default)]
    pub weights: ScoreWeights,
    #[serde(default = "default_intent_rules")]
    pub intent_rules: Vec<PhraseRule>,
    #[serde(default = "default_emotion_rules")]
    pub emotion_rules: Vec<PhraseRule>,
}

fn default_true() -> bool {
    true
}
fn default_confidence_threshold() -> f64 {
    0.4
}
fn default_max_score() -> f64 {
    10.0
}

impl Default for GradualLayerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            max_score: default_max_score(),
            weights: ScoreWeights::default(),
            intent_rules: default_intent_rules(),
            emotion_rules: default_emotion_rules(),
        }
    }
}

impl GradualLayerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::InvalidPolicy(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.max_score > 0.0) {
            return Err(ConfigError::InvalidPolicy(format!(
                "max_score must be positive, got {}",
                self.max_score
            )));
        }
        let w = &self.weights;
        if [w.keyword, w.intent, w.emotion, w.continuity].iter().any(|v| *v < 0.0) {
            return Err(ConfigError::InvalidPolicy("score weights must be non-negative".into()));
        }
        Ok(())
    }
}

/// Source of learned per-(persona, signal) score deltas.
#[async_trait]
pub trait AdjustmentSource: Send + Sync {
    /// Delta in raw-score points; `0.0` when nothing was learned or the
    /// backing store is unavailable.
    async fn adjustment(&self, persona_id: &str, signal: &Signal) -> f64;
}

/// Adjustment source that never adjusts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAdjustments;

#[async_trait]
impl AdjustmentSource for NoAdjustments {
    async fn adjustment(&self, _persona_id: &str, _signal: &Signal) -> f64 {
        0.0
    }
}

/// Message-level signals, computed once per message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSignals {
    pub intent: String,
    pub emotions: Vec<String>,
}

/// Multi-signal scorer.
#[derive(Debug, Clone)]
pub struct GradualAnalyzer {
    registry: Arc<PersonaRegistry>,
    intents: IntentClassifier,
    emotions: EmotionDetector,
    weights: ScoreWeights,
    max_score: f64,
}

impl GradualAnalyzer {
    pub fn new(registry: Arc<PersonaRegistry>, config: &GradualLayerConfig) -> Self {
        Self {
            registry,
            intents: IntentClassifier::new(&config.intent_rules),
            emotions: EmotionDetector::new(&config.emotion_rules),
            weights: config.weights.clone(),
            max_score: config.max_score,
        }
    }

    /// Intent and emotions of a message.
    pub fn classify(&self, text: &str) -> MessageSignals {
        MessageSignals {
            intent: self.intents.classify(text),
            emotions: self.emotions.detect(text),
        }
    }

    /// Confidence floor derived from a persona's `min_score`.
    pub fn persona_threshold(&self, persona: &Persona) -> Option<f64> {
        persona
            .min_score()
            .map(|min| (f64::from(min) / self.max_score).clamp(0.0, 1.0))
    }

    /// Score every persona except `exclude_persona_id`.
    ///
    /// Returns the qualifying candidates, highest confidence first, ties in
    /// declaration order. A candidate qualifies when its confidence reaches
    /// both its own `min_score` floor and `threshold`.
    pub async fn score<A>(
        &self,
        text: &str,
        state: &ConversationState,
        exclude_persona_id: &str,
        threshold: f64,
        adjustments: &A,
    ) -> Vec<TriggerEvaluation>
    where
        A: AdjustmentSource + ?Sized,
    {
        let text_lower = text.to_lowercase();
        let message = self.classify(text);
        let history = recent_history(state, &text_lower);

        let mut candidates = Vec::new();
        for persona in self.registry.others(exclude_persona_id) {
            let Some(persona_floor) = self.persona_threshold(persona) else {
                continue;
            };
            let (base, signals) = self.raw_signals(persona, &text_lower, &message, &history);
            if signals.is_empty() {
                continue;
            }

            let mut raw_score = base;
            for signal in &signals {
                raw_score += adjustments.adjustment(&persona.id, signal).await;
            }
            let confidence = (raw_score / self.max_score).clamp(0.0, 1.0);

            if confidence + EPSILON >= persona_floor && confidence + EPSILON >= threshold {
                candidates.push(TriggerEvaluation {
                    persona_id: persona.id.clone(),
                    layer: TriggerLayer::Gradual,
                    raw_score,
                    confidence,
                    signals,
                });
            } else {
                log::trace!(
                    "Persona '{}' below threshold: confidence {:.3}, floor {:.3}, global {:.3}",
                    persona.id,
                    confidence,
                    persona_floor,
                    threshold
                );
            }
        }

        // stable: equal confidences keep declaration order
        candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
        candidates
    }

    /// Unadjusted score and contributing signals for one persona.
    fn raw_signals(
        &self,
        persona: &Persona,
        text_lower: &str,
        message: &MessageSignals,
        history: &[String],
    ) -> (f64, Vec<Signal>) {
        let Some(gradual) = &persona.gradual_triggers else {
            return (0.0, Vec::new());
        };

        let mut score = 0.0;
        let mut signals = Vec::new();

        let matched: Vec<&String> = gradual
            .keywords
            .iter()
            .filter(|kw| text_lower.contains(kw.as_str()))
            .collect();
        for kw in &matched {
            score += self.weights.keyword;
            signals.push(Signal::Keyword((*kw).clone()));
        }

        if gradual.intents.iter().any(|i| *i == message.intent) {
            score += self.weights.intent;
            signals.push(Signal::Intent(message.intent.clone()));
        }

        if let Some(emotion) = message
            .emotions
            .iter()
            .find(|e| gradual.emotions.contains(*e))
        {
            score += self.weights.emotion;
            signals.push(Signal::Emotion(emotion.clone()));
        }

        let continued: Vec<&&String> = matched
            .iter()
            .filter(|kw| history.iter().any(|turn| turn.contains(kw.as_str())))
            .collect();
        if !continued.is_empty() {
            score += self.weights.continuity;
            for kw in continued {
                signals.push(Signal::Continuity((**kw).clone()));
            }
        }

        (score, signals)
    }
}

/// Lower-cased recent turns, without a trailing copy of the current message.
fn recent_history(state: &ConversationState, text_lower: &str) -> Vec<String> {
    let mut turns: Vec<String> = state
        .recent_turns
        .iter()
        .map(|t| t.content.to_lowercase())
        .collect();
    if let Some(last) = state.recent_turns.last() {
        if last.role == TurnRole::User && turns.last().map(String::as_str) == Some(text_lower) {
            turns.pop();
        }
    }
    turns
}
