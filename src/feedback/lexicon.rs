//! Implicit feedback lexicon.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Verdict on a switch, inferred from the user's next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Positive,
    Negative,
    Neutral,
}

impl FeedbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackOutcome::Positive => "positive",
            FeedbackOutcome::Negative => "negative",
            FeedbackOutcome::Neutral => "neutral",
        }
    }
}

pub fn default_positive_phrases() -> Vec<String> {
    [
        "perfecto",
        "gracias",
        "exacto",
        "eso buscaba",
        "excelente",
        "me sirve",
        "justo lo que",
        "perfect",
        "thanks",
        "exactly",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub fn default_negative_phrases() -> Vec<String> {
    [
        "no era eso",
        "no me sirve",
        "no es lo que",
        "eso no",
        "no entiendes",
        "incorrecto",
        "equivocado",
        "wrong",
        "not what i",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Positive/negative phrase lists plus the near-repeat rule.
#[derive(Debug, Clone)]
pub struct FeedbackLexicon {
    positive: Vec<String>,
    negative: Vec<String>,
    repeat_similarity: f64,
}

impl FeedbackLexicon {
    pub fn new(positive: &[String], negative: &[String], repeat_similarity: f64) -> Self {
        let lower = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            positive: lower(positive),
            negative: lower(negative),
            repeat_similarity,
        }
    }

    /// Judge `next_message` as a reaction to a switch caused by
    /// `trigger_message`.
    ///
    /// Negative phrases are checked first, then a near-repeat of the
    /// triggering message (the user had to ask again), then positive phrases.
    pub fn classify(&self, next_message: &str, trigger_message: &str) -> FeedbackOutcome {
        let lower = next_message.to_lowercase();
        if self.negative.iter().any(|p| lower.contains(p.as_str())) {
            return FeedbackOutcome::Negative;
        }
        if self.repeat_similarity > 0.0
            && jaccard(&lower, &trigger_message.to_lowercase()) >= self.repeat_similarity
        {
            return FeedbackOutcome::Negative;
        }
        if self.positive.iter().any(|p| lower.contains(p.as_str())) {
            return FeedbackOutcome::Positive;
        }
        FeedbackOutcome::Neutral
    }
}

impl Default for FeedbackLexicon {
    fn default() -> Self {
        Self::new(&default_positive_phrases(), &default_negative_phrases(), 0.7)
    }
}

fn words(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Word-set Jaccard similarity.
fn jaccard(a: &str, b: &str) -> f64 {
    let (wa, wb) = (words(a), words(b));
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let inter = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    inter / union
}
