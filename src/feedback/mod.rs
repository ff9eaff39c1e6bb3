//! Feedback learner: implicit approval/rejection of switches.
//!
//! After a switch, the user's next message is matched against the lexicon.
//! A verdict nudges the confidence adjustment of every signal that caused
//! the switch by `±step`, clamped to `±max_adjustment`, and appends a
//! [`FeedbackRecord`] to the bounded log. A neutral message writes nothing.
//!
//! Each verdict also scores the `persona:signal` patterns involved in a
//! ranked set per outcome, so the most failing and most successful triggers
//! can be listed, and adds the switch confidence to the persona's running
//! total for [`PersonaStats::avg_confidence`].
//!
//! Every write is an atomic store increment; nothing here reads a value,
//! modifies it and writes it back.

pub mod lexicon;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::state::PendingFeedback;
use crate::store::GuardedStore;
use crate::telemetry::MorphMetrics;
use crate::triggers::{AdjustmentSource, Signal, TriggerLayer};

pub use lexicon::{FeedbackLexicon, FeedbackOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Adjustment applied per verdict, in raw-score points.
    #[serde(default = "default_step")]
    pub step: f64,
    /// Adjustments stay within `[-max_adjustment, max_adjustment]`.
    #[serde(default = "default_max_adjustment")]
    pub max_adjustment: f64,
    #[serde(default = "lexicon::default_positive_phrases")]
    pub positive: Vec<String>,
    #[serde(default = "lexicon::default_negative_phrases")]
    pub negative: Vec<String>,
    /// Word Jaccard at or above which the next message counts as a repeat.
    #[serde(default = "default_repeat_similarity")]
    pub repeat_similarity: f64,
    /// Feedback log capacity.
    #[serde(default = "default_log_size")]
    pub log_size: usize,
}

fn default_true() -> bool {
    true
}
fn default_step() -> f64 {
    0.25
}
fn default_max_adjustment() -> f64 {
    2.0
}
fn default_repeat_similarity() -> f64 {
    0.7
}
fn default_log_size() -> usize {
    1000
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            step: default_step(),
            max_adjustment: default_max_adjustment(),
            positive: lexicon::default_positive_phrases(),
            negative: lexicon::default_negative_phrases(),
            repeat_similarity: default_repeat_similarity(),
            log_size: default_log_size(),
        }
    }
}

impl FeedbackConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.step > 0.0) || !(self.max_adjustment > 0.0) {
            return Err(ConfigError::InvalidPolicy(
                "feedback.step and feedback.max_adjustment must be positive".into(),
            ));
        }
        if self.step > self.max_adjustment {
            return Err(ConfigError::InvalidPolicy(format!(
                "feedback.step ({}) exceeds max_adjustment ({})",
                self.step, self.max_adjustment
            )));
        }
        if !(0.0..=1.0).contains(&self.repeat_similarity) {
            return Err(ConfigError::InvalidPolicy("feedback.repeat_similarity must be within [0, 1]".into()));
        }
        Ok(())
    }
}

/// One logged verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub conversation_id: String,
    pub persona_id: String,
    /// Signatures of the signals that caused the switch.
    pub signals: Vec<String>,
    pub layer: TriggerLayer,
    /// Confidence of the judged switch.
    pub confidence: f64,
    pub switched_at: DateTime<Utc>,
    pub outcome: FeedbackOutcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate verdicts for one persona.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersonaStats {
    pub positive: i64,
    pub negative: i64,
    /// positive + negative.
    pub total: i64,
    /// positive / total; 0 when nothing was judged.
    pub success_rate: f64,
    /// Mean confidence of the judged switches; 0 when nothing was judged.
    pub avg_confidence: f64,
}

/// A `(persona, signal)` pair and how often it drew one verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternScore {
    pub persona_id: String,
    /// Signal signature, e.g. `keyword:precio`.
    pub signal: String,
    pub count: i64,
}

impl PatternScore {
    fn from_member(member: &str, score: f64) -> Self {
        let (persona_id, signal) = member.split_once(':').unwrap_or((member, ""));
        Self {
            persona_id: persona_id.to_string(),
            signal: signal.to_string(),
            count: score.round() as i64,
        }
    }
}

/// What the learner has gathered so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSummary {
    pub enabled: bool,
    /// Stats per persona, for personas with at least one verdict.
    pub personas: Vec<(String, PersonaStats)>,
    pub top_failed_patterns: Vec<PatternScore>,
    pub top_successful_patterns: Vec<PatternScore>,
    pub total_feedback: i64,
}

fn pattern_member(persona_id: &str, signal: &Signal) -> String {
    format!("{}:{}", persona_id, signal.signature())
}

pub struct FeedbackLearner {
    store: GuardedStore,
    config: FeedbackConfig,
    lexicon: FeedbackLexicon,
    metrics: Arc<MorphMetrics>,
}

impl FeedbackLearner {
    pub fn new(store: GuardedStore, config: FeedbackConfig, metrics: Arc<MorphMetrics>) -> Self {
        let lexicon = FeedbackLexicon::new(&config.positive, &config.negative, config.repeat_similarity);
        Self {
            store,
            config,
            lexicon,
            metrics,
        }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    /// Judge `next_user_message` against the switch described by `previous`,
    /// applying the adjustments and logging the record on a verdict.
    pub async fn inspect(
        &self,
        conversation_id: &str,
        previous: &PendingFeedback,
        next_user_message: &str,
    ) -> FeedbackOutcome {
        if !self.config.enabled {
            return FeedbackOutcome::Neutral;
        }

        let outcome = self
            .lexicon
            .classify(next_user_message, &previous.trigger_message);
        self.metrics.record_feedback(outcome);

        let delta = match outcome {
            FeedbackOutcome::Positive => self.config.step,
            FeedbackOutcome::Negative => -self.config.step,
            FeedbackOutcome::Neutral => return outcome,
        };

        let keys = self.store.keys().clone();
        let max = self.config.max_adjustment;
        for signal in &previous.signals {
            let key = keys.adjustment(&previous.persona_id, &signal.signature());
            // failures are logged by the guarded store; the verdict still stands
            let _ = self.store.incr_float_clamped(&key, delta, -max, max).await;
        }
        for signal in &previous.signals {
            let member = pattern_member(&previous.persona_id, signal);
            let _ = self.store.zincr(&keys.patterns(outcome.as_str()), &member, 1.0).await;
        }
        let _ = self
            .store
            .incr(&keys.persona_stat(&previous.persona_id, outcome.as_str()), 1)
            .await;
        let _ = self
            .store
            .incr_float_clamped(
                &keys.persona_stat(&previous.persona_id, "total_confidence"),
                previous.confidence,
                0.0,
                f64::MAX,
            )
            .await;

        let now = Utc::now();
        let record = FeedbackRecord {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            persona_id: previous.persona_id.clone(),
            signals: previous.signals.iter().map(Signal::signature).collect(),
            layer: previous.layer,
            confidence: previous.confidence,
            switched_at: previous.switched_at,
            outcome,
            message: next_user_message.to_string(),
            timestamp: now,
        };
        match serde_json::to_string(&record) {
            Ok(json) => {
                let _ = self
                    .store
                    .push_trim(&keys.feedback_log(), &json, self.config.log_size)
                    .await;
            }
            Err(e) => log::error!("Failed to encode feedback record: {}", e),
        }

        log::info!(
            "Feedback {} for '{}' in conversation {} ({} switch at {:.2}, {} signals, {}ms later, step {:+})",
            outcome.as_str(),
            previous.persona_id,
            conversation_id,
            previous.layer.as_str(),
            previous.confidence,
            previous.signals.len(),
            now.signed_duration_since(previous.switched_at).num_milliseconds(),
            delta
        );
        outcome
    }

    /// Current adjustment for a `(persona, signal)` pair.
    pub async fn adjustment(&self, persona_id: &str, signal: &Signal) -> f64 {
        let key = self.store.keys().adjustment(persona_id, &signal.signature());
        let max = self.config.max_adjustment;
        self.store.get_float(&key).await.clamp(-max, max)
    }

    pub async fn persona_stats(&self, persona_id: &str) -> PersonaStats {
        let keys = self.store.keys();
        let positive = self.store.get_int(&keys.persona_stat(persona_id, "positive")).await;
        let negative = self.store.get_int(&keys.persona_stat(persona_id, "negative")).await;
        let total_confidence = self
            .store
            .get_float(&keys.persona_stat(persona_id, "total_confidence"))
            .await;
        let total = positive + negative;
        let (success_rate, avg_confidence) = if total > 0 {
            (positive as f64 / total as f64, total_confidence / total as f64)
        } else {
            (0.0, 0.0)
        };
        PersonaStats {
            positive,
            negative,
            total,
            success_rate,
            avg_confidence,
        }
    }

    /// `(persona, signal)` pairs that drew the most negative verdicts.
    pub async fn failed_patterns(&self, limit: usize) -> Vec<PatternScore> {
        self.top_patterns(FeedbackOutcome::Negative, limit).await
    }

    /// `(persona, signal)` pairs that drew the most positive verdicts.
    pub async fn successful_patterns(&self, limit: usize) -> Vec<PatternScore> {
        self.top_patterns(FeedbackOutcome::Positive, limit).await
    }

    async fn top_patterns(&self, outcome: FeedbackOutcome, limit: usize) -> Vec<PatternScore> {
        if !self.config.enabled || limit == 0 {
            return Vec::new();
        }
        self.store
            .ztop(&self.store.keys().patterns(outcome.as_str()), limit)
            .await
            .unwrap_or_default()
            .iter()
            .map(|(member, score)| PatternScore::from_member(member, *score))
            .collect()
    }

    /// Stats for `persona_ids` plus the five most failing and most
    /// successful patterns.
    pub async fn learning_summary<'a>(&self, persona_ids: impl IntoIterator<Item = &'a str>) -> LearningSummary {
        if !self.config.enabled {
            return LearningSummary {
                enabled: false,
                personas: Vec::new(),
                top_failed_patterns: Vec::new(),
                top_successful_patterns: Vec::new(),
                total_feedback: 0,
            };
        }
        let mut personas = Vec::new();
        let mut total_feedback = 0;
        for id in persona_ids {
            let stats = self.persona_stats(id).await;
            if stats.total > 0 {
                total_feedback += stats.total;
                personas.push((id.to_string(), stats));
            }
        }
        LearningSummary {
            enabled: true,
            personas,
            top_failed_patterns: self.failed_patterns(5).await,
            top_successful_patterns: self.successful_patterns(5).await,
            total_feedback,
        }
    }

    /// Newest records first.
    pub async fn recent_feedback(&self, limit: usize) -> Vec<FeedbackRecord> {
        let raw = self
            .store
            .list_range(&self.store.keys().feedback_log(), limit)
            .await
            .unwrap_or_default();
        raw.iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("Skipping unreadable feedback record: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl AdjustmentSource for FeedbackLearner {
    async fn adjustment(&self, persona_id: &str, signal: &Signal) -> f64 {
        if !self.config.enabled {
            return 0.0;
        }
        FeedbackLearner::adjustment(self, persona_id, signal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::FailingStore;
    use crate::store::{InMemoryStore, KvStore, StoreConfig};

    fn learner_on(inner: Arc<dyn KvStore>) -> FeedbackLearner {
        let metrics = Arc::new(MorphMetrics::new());
        let store = GuardedStore::new(inner, &StoreConfig::default(), metrics.clone());
        FeedbackLearner::new(store, FeedbackConfig::default(), metrics)
    }

    fn learner() -> FeedbackLearner {
        learner_on(Arc::new(InMemoryStore::new()))
    }

    fn pending() -> PendingFeedback {
        PendingFeedback {
            persona_id: "sales".into(),
            layer: TriggerLayer::Instant,
            signals: vec![Signal::Instant("quiero comprar".into())],
            trigger_message: "Hola, quiero comprar una laptop".into(),
            confidence: 1.0,
            experiments: vec![],
            switched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_positive_feedback_raises_adjustment_by_step() {
        let l = learner();
        let signal = Signal::Instant("quiero comprar".into());
        assert_eq!(l.adjustment("sales", &signal).await, 0.0);

        let outcome = l.inspect("c1", &pending(), "perfecto, eso buscaba").await;
        assert_eq!(outcome, FeedbackOutcome::Positive);
        assert_eq!(l.adjustment("sales", &signal).await, 0.25);

        let stats = l.persona_stats("sales").await;
        assert_eq!(stats.positive, 1);
        assert_eq!(stats.success_rate, 1.0);
        let log = l.recent_feedback(10).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].signals, vec!["instant:quiero comprar".to_string()]);
    }

    #[tokio::test]
    async fn test_stats_track_average_confidence() {
        let l = learner();
        let mut gradual = pending();
        gradual.layer = TriggerLayer::Gradual;
        gradual.confidence = 0.5;
        gradual.signals = vec![Signal::Keyword("precio".into())];
        l.inspect("c1", &pending(), "perfecto").await;
        l.inspect("c2", &gradual, "no era eso").await;

        let stats = l.persona_stats("sales").await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success_rate, 0.5);
        assert!((stats.avg_confidence - 0.75).abs() < 1e-9);

        let log = l.recent_feedback(1).await;
        assert_eq!(log[0].layer, TriggerLayer::Gradual);
        assert_eq!(log[0].confidence, 0.5);
        assert_eq!(log[0].switched_at, gradual.switched_at);
    }

    #[tokio::test]
    async fn test_patterns_ranked_by_outcome() {
        let l = learner();
        let mut gradual = pending();
        gradual.signals = vec![Signal::Keyword("precio".into()), Signal::Intent("question".into())];
        for _ in 0..3 {
            l.inspect("c1", &gradual, "no era eso").await;
        }
        l.inspect("c1", &pending(), "no era eso").await;
        l.inspect("c1", &pending(), "gracias").await;

        let failed = l.failed_patterns(10).await;
        assert_eq!(failed.len(), 3);
        assert_eq!(failed[0].count, 3);
        assert_eq!(failed[0].persona_id, "sales");
        assert_eq!(failed[2].signal, "instant:quiero comprar");
        assert_eq!(failed[2].count, 1);

        let ok = l.successful_patterns(10).await;
        assert_eq!(
            ok,
            vec![PatternScore {
                persona_id: "sales".into(),
                signal: "instant:quiero comprar".into(),
                count: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_learning_summary() {
        let l = learner();
        l.inspect("c1", &pending(), "perfecto").await;
        l.inspect("c2", &pending(), "no era eso").await;

        let summary = l.learning_summary(["general", "sales"]).await;
        assert!(summary.enabled);
        assert_eq!(summary.total_feedback, 2);
        assert_eq!(summary.personas.len(), 1);
        assert_eq!(summary.personas[0].0, "sales");
        assert_eq!(summary.top_failed_patterns.len(), 1);
        assert_eq!(summary.top_successful_patterns.len(), 1);

        let mut config = FeedbackConfig::default();
        config.enabled = false;
        let metrics = Arc::new(MorphMetrics::new());
        let store = GuardedStore::new(Arc::new(InMemoryStore::new()), &StoreConfig::default(), metrics.clone());
        let off = FeedbackLearner::new(store, config, metrics);
        assert!(!off.learning_summary(["sales"]).await.enabled);
    }

    #[tokio::test]
    async fn test_neutral_writes_nothing() {
        let l = learner();
        let outcome = l.inspect("c1", &pending(), "¿y tienen envío?").await;
        assert_eq!(outcome, FeedbackOutcome::Neutral);
        assert!(l.recent_feedback(10).await.is_empty());
        assert_eq!(l.persona_stats("sales").await.positive, 0);
        assert!(l.successful_patterns(5).await.is_empty());
    }

    #[tokio::test]
    async fn test_adjustment_stays_clamped() {
        let l = learner();
        let signal = Signal::Instant("quiero comprar".into());
        for _ in 0..30 {
            l.inspect("c1", &pending(), "no era eso").await;
        }
        assert_eq!(l.adjustment("sales", &signal).await, -2.0);
        for _ in 0..30 {
            l.inspect("c1", &pending(), "gracias").await;
        }
        assert_eq!(l.adjustment("sales", &signal).await, 2.0);
    }

    #[tokio::test]
    async fn test_concurrent_feedback_loses_no_increment() {
        let l = Arc::new(learner());
        let mut handles = Vec::new();
        for i in 0..6 {
            let l = l.clone();
            handles.push(tokio::spawn(async move {
                l.inspect(&format!("c{}", i), &pending(), "gracias").await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let signal = Signal::Instant("quiero comprar".into());
        assert_eq!(l.adjustment("sales", &signal).await, 1.5);
        assert_eq!(l.persona_stats("sales").await.positive, 6);
    }

    #[tokio::test]
    async fn test_store_down_degrades_to_no_adjustment() {
        let l = learner_on(Arc::new(FailingStore));
        let outcome = l.inspect("c1", &pending(), "perfecto").await;
        assert_eq!(outcome, FeedbackOutcome::Positive);
        let signal = Signal::Instant("quiero comprar".into());
        assert_eq!(AdjustmentSource::adjustment(&l, "sales", &signal).await, 0.0);
        assert!(l.recent_feedback(5).await.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(FeedbackConfig::default().validate().is_ok());
        let mut cfg = FeedbackConfig::default();
        cfg.step = 3.0;
        assert!(cfg.validate().is_err());
    }
}
