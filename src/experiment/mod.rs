//! Experiment controller: live comparison of parameter variants.
//!
//! A subject (conversation) is assigned to a variant by hashing
//! `"{experiment}:{subject}"` with SHA-256 and taking the first eight bytes
//! modulo the variant count. The first assignment is written with
//! set-if-absent, so concurrent first assignments converge on one winner,
//! and it is cached locally so repeat lookups never touch the store.
//!
//! Outcomes (`attempts`, `positive`, `negative`) are plain atomic counters per
//! `(experiment, variant)`; [`ExperimentController::snapshot`] reads them
//! back for offline comparison. No significance test is applied.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::store::{GuardedStore, LocalCache};

/// Engine parameter an experiment may tune.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunableParameter {
    ConfidenceThreshold,
    MaxRepeats,
    CooldownSecs,
}

impl TunableParameter {
    fn check(&self, value: f64) -> Result<(), String> {
        match self {
            TunableParameter::ConfidenceThreshold if !(0.0..=1.0).contains(&value) => {
                Err(format!("confidence threshold {} outside [0, 1]", value))
            }
            TunableParameter::MaxRepeats if whole_number(value).map_or(true, |n| n == 0) => {
                Err(format!("max_repeats {} must be a positive integer", value))
            }
            TunableParameter::CooldownSecs if whole_number(value).is_none() => {
                Err(format!("cooldown_secs {} must be a non-negative integer", value))
            }
            _ => Ok(()),
        }
    }
}

/// `value` as a whole number within `u32`, if it is one.
fn whole_number(value: f64) -> Option<u32> {
    if value.is_finite() && value.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&value) {
        Some(value as u32)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefinition {
    pub id: String,
    pub parameter: TunableParameter,
    pub variants: Vec<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ExperimentDefinition {
    pub fn new(id: impl Into<String>, parameter: TunableParameter, variants: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            parameter,
            variants,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidExperiment {
            id: self.id.clone(),
            message,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("blank experiment id".into()));
        }
        if self.variants.is_empty() {
            return Err(invalid("no variants".into()));
        }
        for value in &self.variants {
            self.parameter.check(*value).map_err(invalid)?;
        }
        Ok(())
    }
}

/// An `(experiment, variant index)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantRef {
    pub experiment_id: String,
    pub variant: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentOutcome {
    Attempt,
    Positive,
    Negative,
}

impl ExperimentOutcome {
    fn counter(&self) -> &'static str {
        match self {
            ExperimentOutcome::Attempt => "attempts",
            ExperimentOutcome::Positive => "positive",
            ExperimentOutcome::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantAggregate {
    pub variant: usize,
    pub value: f64,
    pub attempts: i64,
    pub positive: i64,
    pub negative: i64,
}

impl VariantAggregate {
    /// positive / (positive + negative), if anything was judged.
    pub fn success_rate(&self) -> Option<f64> {
        let judged = self.positive + self.negative;
        (judged > 0).then(|| self.positive as f64 / judged as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub experiment_id: String,
    pub parameter: TunableParameter,
    pub variants: Vec<VariantAggregate>,
}

/// Parameters in force for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveParameters {
    pub confidence_threshold: f64,
    pub max_repeats: usize,
    pub cooldown_secs: u64,
    /// Experiments that contributed, one per parameter.
    pub assignments: Vec<VariantRef>,
}

impl EffectiveParameters {
    pub fn base(confidence_threshold: f64, max_repeats: usize, cooldown_secs: u64) -> Self {
        Self {
            confidence_threshold,
            max_repeats,
            cooldown_secs,
            assignments: Vec::new(),
        }
    }
}

/// Deterministic variant index for a subject.
pub fn hash_variant(experiment_id: &str, subject_id: &str, variant_count: usize) -> usize {
    if variant_count == 0 {
        return 0;
    }
    let digest = Sha256::digest(format!("{}:{}", experiment_id, subject_id).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % variant_count as u64) as usize
}

pub struct ExperimentController {
    experiments: Vec<ExperimentDefinition>,
    store: GuardedStore,
    /// Assignment key → variant; first write wins, bounded.
    assignments: LocalCache<usize>,
}

impl ExperimentController {
    pub fn new(experiments: Vec<ExperimentDefinition>, store: GuardedStore) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for exp in &experiments {
            exp.validate()?;
            if !seen.insert(exp.id.clone()) {
                return Err(ConfigError::InvalidExperiment {
                    id: exp.id.clone(),
                    message: "duplicate experiment id".into(),
                });
            }
        }
        let assignments = LocalCache::new(store.local_cache_size());
        Ok(Self {
            experiments,
            store,
            assignments,
        })
    }

    pub fn definition(&self, experiment_id: &str) -> Option<&ExperimentDefinition> {
        self.experiments.iter().find(|e| e.id == experiment_id)
    }

    pub fn experiments(&self) -> &[ExperimentDefinition] {
        &self.experiments
    }

    /// Variant of `subject_id` in `experiment_id`; `None` for an unknown
    /// experiment. Stable across calls.
    pub async fn assign(&self, experiment_id: &str, subject_id: &str) -> Option<usize> {
        let exp = self.definition(experiment_id)?;
        let key = self.store.keys().assignment(experiment_id, subject_id);
        if let Some(v) = self.assignments.get(&key) {
            return Some(v);
        }

        let n = exp.variants.len();
        let computed = hash_variant(experiment_id, subject_id, n);
        let variant = match self.store.set_if_absent(&key, &computed.to_string()).await {
            Ok(winner) => match winner.parse::<usize>() {
                Ok(v) if v < n => v,
                _ => {
                    log::warn!("Stored assignment '{}' at '{}' is invalid, using {}", winner, key, computed);
                    computed
                }
            },
            Err(_) => computed,
        };

        let variant = self.assignments.get_or_insert(key, variant);
        log::debug!("Subject '{}' assigned to variant {} of '{}'", subject_id, variant, experiment_id);
        Some(variant)
    }

    /// Drop the subject's cached assignments. Stored assignments stay, so
    /// the subject keeps its variants.
    pub fn forget_subject(&self, subject_id: &str) {
        for exp in &self.experiments {
            self.assignments.remove(&self.store.keys().assignment(&exp.id, subject_id));
        }
    }

    /// Number of assignments held in the local cache.
    pub fn cached_assignments(&self) -> usize {
        self.assignments.len()
    }

    /// Concrete parameter value of the subject's variant.
    pub async fn effective_value(&self, experiment_id: &str, subject_id: &str) -> Option<f64> {
        let variant = self.assign(experiment_id, subject_id).await?;
        self.definition(experiment_id)
            .and_then(|e| e.variants.get(variant))
            .copied()
    }

    pub async fn record_outcome(&self, experiment_id: &str, variant: usize, outcome: ExperimentOutcome) {
        let key = self.store.keys().outcome(experiment_id, variant, outcome.counter());
        let _ = self.store.incr(&key, 1).await;
    }

    /// Per-variant counters; `None` for an unknown experiment.
    pub async fn snapshot(&self, experiment_id: &str) -> Option<ExperimentSnapshot> {
        let exp = self.definition(experiment_id)?;
        let keys = self.store.keys();
        let mut variants = Vec::with_capacity(exp.variants.len());
        for (variant, value) in exp.variants.iter().enumerate() {
            variants.push(VariantAggregate {
                variant,
                value: *value,
                attempts: self.store.get_int(&keys.outcome(experiment_id, variant, "attempts")).await,
                positive: self.store.get_int(&keys.outcome(experiment_id, variant, "positive")).await,
                negative: self.store.get_int(&keys.outcome(experiment_id, variant, "negative")).await,
            });
        }
        Some(ExperimentSnapshot {
            experiment_id: experiment_id.to_string(),
            parameter: exp.parameter,
            variants,
        })
    }

    /// Resolve `base` against every enabled experiment. The first experiment
    /// declared for a parameter wins; later ones for the same parameter are
    /// not assigned.
    pub async fn effective_parameters(&self, subject_id: &str, base: EffectiveParameters) -> EffectiveParameters {
        let mut params = base;
        let mut tuned = HashSet::new();
        for exp in self.experiments.iter().filter(|e| e.enabled) {
            if !tuned.insert(exp.parameter) {
                continue;
            }
            let Some(variant) = self.assign(&exp.id, subject_id).await else {
                continue;
            };
            let Some(value) = exp.variants.get(variant).copied() else {
                continue;
            };
            match (exp.parameter, whole_number(value)) {
                (TunableParameter::ConfidenceThreshold, _) => params.confidence_threshold = value,
                (TunableParameter::MaxRepeats, Some(n)) if n > 0 => params.max_repeats = n as usize,
                (TunableParameter::CooldownSecs, Some(n)) => params.cooldown_secs = u64::from(n),
                (parameter, _) => {
                    log::warn!("Experiment '{}' value {} is not usable for {:?}", exp.id, value, parameter);
                    continue;
                }
            }
            params.assignments.push(VariantRef {
                experiment_id: exp.id.clone(),
                variant,
            });
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::test_support::FailingStore;
    use crate::store::{InMemoryStore, KvStore, StoreConfig};
    use crate::telemetry::MorphMetrics;

    fn store_on(inner: Arc<dyn KvStore>) -> GuardedStore {
        GuardedStore::new(inner, &StoreConfig::default(), Arc::new(MorphMetrics::new()))
    }

    fn threshold_experiment() -> ExperimentDefinition {
        ExperimentDefinition::new(
            "confidence_threshold",
            TunableParameter::ConfidenceThreshold,
            vec![0.4, 0.6, 0.8],
        )
    }

    fn controller() -> ExperimentController {
        ExperimentController::new(vec![threshold_experiment()], store_on(Arc::new(InMemoryStore::new()))).unwrap()
    }

    #[tokio::test]
    async fn test_assignment_is_stable() {
        let c = controller();
        let first = c.assign("confidence_threshold", "u123").await.unwrap();
        let second = c.assign("confidence_threshold", "u123").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, hash_variant("confidence_threshold", "u123", 3));
        let value = c.effective_value("confidence_threshold", "u123").await.unwrap();
        assert_eq!(value, [0.4, 0.6, 0.8][first]);
    }

    #[tokio::test]
    async fn test_stored_assignment_wins_over_hash() {
        let inner = Arc::new(InMemoryStore::new());
        let computed = hash_variant("confidence_threshold", "u9", 3);
        let other = (computed + 1) % 3;
        inner
            .set("morphing:exp:assign:confidence_threshold:u9", &other.to_string())
            .await
            .unwrap();
        let c = ExperimentController::new(vec![threshold_experiment()], store_on(inner)).unwrap();
        assert_eq!(c.assign("confidence_threshold", "u9").await, Some(other));
    }

    #[tokio::test]
    async fn test_store_down_falls_back_to_hash() {
        let c = ExperimentController::new(vec![threshold_experiment()], store_on(Arc::new(FailingStore))).unwrap();
        let v = c.assign("confidence_threshold", "u1").await.unwrap();
        assert_eq!(v, hash_variant("confidence_threshold", "u1", 3));
    }

    #[tokio::test]
    async fn test_concurrent_first_assignments_converge() {
        let inner: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        // one controller per task, as on separate nodes sharing a store
        for _ in 0..8 {
            let c = ExperimentController::new(vec![threshold_experiment()], store_on(inner.clone())).unwrap();
            handles.push(tokio::spawn(async move { c.assign("confidence_threshold", "u42").await }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            seen.insert(h.await.unwrap().unwrap());
        }
        assert_eq!(seen.len(), 1);
        let stored = inner.get("morphing:exp:assign:confidence_threshold:u42").await.unwrap();
        assert_eq!(stored, seen.iter().next().map(|v| v.to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_assignments_share_one_controller() {
        let c = Arc::new(controller());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            handles.push(tokio::spawn(async move { c.assign("confidence_threshold", "u7").await }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            seen.insert(h.await.unwrap());
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(c.cached_assignments(), 1);
    }

    #[tokio::test]
    async fn test_forget_subject_keeps_stored_variant() {
        let c = controller();
        let first = c.assign("confidence_threshold", "u1").await.unwrap();
        c.forget_subject("u1");
        assert_eq!(c.cached_assignments(), 0);
        assert_eq!(c.assign("confidence_threshold", "u1").await, Some(first));
    }

    #[tokio::test]
    async fn test_assignment_cache_is_bounded() {
        let config = StoreConfig {
            local_cache_size: 50,
            ..StoreConfig::default()
        };
        let store = GuardedStore::new(Arc::new(InMemoryStore::new()), &config, Arc::new(MorphMetrics::new()));
        let c = ExperimentController::new(vec![threshold_experiment()], store).unwrap();
        for i in 0..500 {
            c.assign("confidence_threshold", &format!("u{}", i)).await;
        }
        assert!(c.cached_assignments() <= 50);
    }

    #[tokio::test]
    async fn test_unknown_experiment() {
        assert_eq!(controller().assign("nope", "u1").await, None);
    }

    #[tokio::test]
    async fn test_outcomes_aggregate_per_variant() {
        let c = controller();
        c.record_outcome("confidence_threshold", 1, ExperimentOutcome::Attempt).await;
        c.record_outcome("confidence_threshold", 1, ExperimentOutcome::Attempt).await;
        c.record_outcome("confidence_threshold", 1, ExperimentOutcome::Positive).await;
        c.record_outcome("confidence_threshold", 2, ExperimentOutcome::Negative).await;

        let snap = c.snapshot("confidence_threshold").await.unwrap();
        assert_eq!(snap.variants.len(), 3);
        assert_eq!(snap.variants[1].attempts, 2);
        assert_eq!(snap.variants[1].success_rate(), Some(1.0));
        assert_eq!(snap.variants[2].negative, 1);
        assert_eq!(snap.variants[0].success_rate(), None);
    }

    #[tokio::test]
    async fn test_first_experiment_per_parameter_wins() {
        let store = store_on(Arc::new(InMemoryStore::new()));
        let c = ExperimentController::new(
            vec![
                ExperimentDefinition::new("a", TunableParameter::ConfidenceThreshold, vec![0.7]),
                ExperimentDefinition::new("b", TunableParameter::ConfidenceThreshold, vec![0.9]),
                ExperimentDefinition::new("c", TunableParameter::MaxRepeats, vec![1.0]),
            ],
            store,
        )
        .unwrap();
        let params = c.effective_parameters("u1", EffectiveParameters::base(0.4, 2, 0)).await;
        assert_eq!(params.confidence_threshold, 0.7);
        assert_eq!(params.max_repeats, 1);
        let ids: Vec<&str> = params.assignments.iter().map(|a| a.experiment_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_disabled_experiment_ignored() {
        let mut exp = threshold_experiment();
        exp.enabled = false;
        let c = ExperimentController::new(vec![exp], store_on(Arc::new(InMemoryStore::new()))).unwrap();
        let params = c.effective_parameters("u1", EffectiveParameters::base(0.4, 2, 0)).await;
        assert_eq!(params.confidence_threshold, 0.4);
        assert!(params.assignments.is_empty());
    }

    #[test]
    fn test_definition_validation() {
        let store = store_on(Arc::new(InMemoryStore::new()));
        let bad = ExperimentDefinition::new("t", TunableParameter::ConfidenceThreshold, vec![1.5]);
        assert!(ExperimentController::new(vec![bad], store.clone()).is_err());
        let empty = ExperimentDefinition::new("t", TunableParameter::MaxRepeats, vec![]);
        assert!(empty.validate().is_err());
        let huge = ExperimentDefinition::new("t", TunableParameter::CooldownSecs, vec![1e30]);
        assert!(huge.validate().is_err());
        let zero = ExperimentDefinition::new("t", TunableParameter::MaxRepeats, vec![0.0]);
        assert!(zero.validate().is_err());
        let ok = ExperimentDefinition::new("t", TunableParameter::CooldownSecs, vec![0.0, 3600.0]);
        assert!(ok.validate().is_ok());
        let dup = vec![threshold_experiment(), threshold_experiment()];
        assert!(matches!(
            ExperimentController::new(dup, store),
            Err(ConfigError::InvalidExperiment { .. })
        ));
    }
}
