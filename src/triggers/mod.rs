//! Trigger detection: the two layers that propose a persona for a message.
//!
//! ```text
//! message
//!   → TriggerIndex      (instant layer: phrase hit, confidence 1.0)
//!   → GradualAnalyzer   (gradual layer: keyword/intent/emotion/continuity score)
//!   → Vec<TriggerEvaluation>, best first
//! ```

pub mod gradual;
pub mod instant;
pub mod signals;

use serde::{Deserialize, Serialize};

pub use gradual::{AdjustmentSource, GradualAnalyzer, GradualLayerConfig, NoAdjustments, ScoreWeights};
pub use instant::{InstantLayerConfig, InstantMatch, TriggerIndex};
pub use signals::{EmotionDetector, IntentClassifier, PhraseRule};

/// Which layer produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerLayer {
    Instant,
    Gradual,
}

impl TriggerLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerLayer::Instant => "instant",
            TriggerLayer::Gradual => "gradual",
        }
    }
}

/// One piece of evidence that contributed to a candidate.
///
/// The [`signature`](Signal::signature) is the signal half of the
/// confidence-adjustment key, so it must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Signal {
    /// An instant trigger phrase matched.
    Instant(String),
    /// A gradual keyword matched.
    Keyword(String),
    /// The classified intent is one of the persona's intents.
    Intent(String),
    /// A detected emotion is one of the persona's emotions.
    Emotion(String),
    /// A matched keyword also appears in the recent turns.
    Continuity(String),
}

impl Signal {
    /// Stable `kind:value` form.
    pub fn signature(&self) -> String {
        let (kind, value) = match self {
            Signal::Instant(v) => ("instant", v),
            Signal::Keyword(v) => ("keyword", v),
            Signal::Intent(v) => ("intent", v),
            Signal::Emotion(v) => ("emotion", v),
            Signal::Continuity(v) => ("continuity", v),
        };
        format!("{}:{}", kind, value.to_lowercase())
    }
}

/// A scored candidate persona, produced per evaluation and then dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvaluation {
    pub persona_id: String,
    pub layer: TriggerLayer,
    /// Score before normalization, adjustments included.
    pub raw_score: f64,
    /// Normalized confidence in [0, 1].
    pub confidence: f64,
    /// Evidence, in the order it was found.
    pub signals: Vec<Signal>,
}

impl TriggerEvaluation {
    /// Candidate from an instant phrase hit.
    pub fn instant(hit: &InstantMatch) -> Self {
        Self {
            persona_id: hit.persona_id.clone(),
            layer: TriggerLayer::Instant,
            raw_score: 1.0,
            confidence: 1.0,
            signals: vec![Signal::Instant(hit.phrase.clone())],
        }
    }

    /// Human-readable reason, used in logs and transition plans.
    pub fn reason(&self) -> String {
        let parts: Vec<String> = self.signals.iter().map(Signal::signature).collect();
        format!(
            "{} trigger ({:.2}): {}",
            self.layer.as_str(),
            self.confidence,
            parts.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_signature_is_lowercase_kind_value() {
        assert_eq!(
            Signal::Instant("Quiero Comprar".into()).signature(),
            "instant:quiero comprar"
        );
        assert_eq!(Signal::Continuity("laptop".into()).signature(), "continuity:laptop");
    }

    #[test]
    fn test_instant_evaluation_has_full_confidence() {
        let hit = InstantMatch {
            persona_id: "sales".into(),
            phrase: "quiero comprar".into(),
        };
        let eval = TriggerEvaluation::instant(&hit);
        assert_eq!(eval.layer, TriggerLayer::Instant);
        assert_eq!(eval.confidence, 1.0);
        assert!(eval.reason().contains("instant:quiero comprar"));
    }
}
