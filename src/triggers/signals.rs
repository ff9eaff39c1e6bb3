//! Lightweight intent and emotion signals.
//!
//! Both detectors are ordered phrase-rule lists. The intent classifier
//! returns the first exact rule that matches and only then falls back to the
//! catch-all rules (`question`, `statement`); the emotion detector returns
//! every emotion whose phrases occur.

use serde::{Deserialize, Serialize};

/// A label and the phrases that evidence it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhraseRule {
    #[serde(alias = "intent", alias = "emotion")]
    pub label: String,
    pub phrases: Vec<String>,
}

impl PhraseRule {
    pub fn new<I, S>(label: &str, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.to_string(),
            phrases: phrases.into_iter().map(Into::into).collect(),
        }
    }

    fn lowercased(&self) -> Self {
        Self {
            label: self.label.trim().to_lowercase(),
            phrases: self
                .phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    fn matches(&self, text_lower: &str) -> bool {
        self.phrases.iter().any(|p| text_lower.contains(p.as_str()))
    }
}

/// Intent returned when the text asks something but no exact rule matched.
pub const QUESTION_INTENT: &str = "question";
/// Intent returned when nothing else applies.
pub const STATEMENT_INTENT: &str = "statement";

/// Catch-all rules, evaluated in order after every exact rule failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackRule {
    QuestionMark,
    Any,
}

impl FallbackRule {
    const ORDER: [FallbackRule; 2] = [FallbackRule::QuestionMark, FallbackRule::Any];

    fn label(self, text: &str) -> Option<&'static str> {
        match self {
            FallbackRule::QuestionMark if text.contains('?') || text.contains('¿') => {
                Some(QUESTION_INTENT)
            }
            FallbackRule::QuestionMark => None,
            FallbackRule::Any => Some(STATEMENT_INTENT),
        }
    }
}

/// Keyword intent classifier.
#[derive(Debug, Clone)]
pub struct IntentClassifier {
    rules: Vec<PhraseRule>,
}

impl IntentClassifier {
    pub fn new(rules: &[PhraseRule]) -> Self {
        Self {
            rules: rules.iter().map(PhraseRule::lowercased).collect(),
        }
    }

    /// Classify a message into exactly one intent.
    pub fn classify(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        if let Some(rule) = self.rules.iter().find(|r| r.matches(&lower)) {
            return rule.label.clone();
        }
        FallbackRule::ORDER
            .iter()
            .find_map(|rule| rule.label(&lower))
            .unwrap_or(STATEMENT_INTENT)
            .to_string()
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(&default_intent_rules())
    }
}

/// Keyword emotion detector.
#[derive(Debug, Clone)]
pub struct EmotionDetector {
    rules: Vec<PhraseRule>,
}

impl EmotionDetector {
    pub fn new(rules: &[PhraseRule]) -> Self {
        Self {
            rules: rules.iter().map(PhraseRule::lowercased).collect(),
        }
    }

    /// All emotions evidenced by the text, in rule order.
    pub fn detect(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.rules
            .iter()
            .filter(|r| r.matches(&lower))
            .map(|r| r.label.clone())
            .collect()
    }
}

impl Default for EmotionDetector {
    fn default() -> Self {
        Self::new(&default_emotion_rules())
    }
}

/// Illustrative default intent rules.
pub fn default_intent_rules() -> Vec<PhraseRule> {
    vec![
        PhraseRule::new(
            "purchase_inquiry",
            ["comprar", "precio", "costo", "oferta", "producto", "buy", "price"],
        ),
        PhraseRule::new(
            "support_request",
            ["problema", "error", "falla", "no funciona", "ayuda", "broken", "help"],
        ),
        PhraseRule::new(
            "creative_request",
            ["crear", "diseñar", "idea", "imaginar", "create", "design"],
        ),
    ]
}

/// Illustrative default emotion rules.
pub fn default_emotion_rules() -> Vec<PhraseRule> {
    vec![
        PhraseRule::new(
            "frustration",
            ["no funciona", "harto", "molesto", "frustrado", "frustrante", "otra vez"],
        ),
        PhraseRule::new(
            "urgency",
            ["urgente", "rápido", "cuanto antes", "ahora mismo", "asap"],
        ),
        PhraseRule::new(
            "enthusiasm",
            ["genial", "increíble", "me encanta", "emocionado"],
        ),
        PhraseRule::new("confusion", ["no entiendo", "confundido", "no sé cómo"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_rule_wins_over_fallback() {
        let c = IntentClassifier::default();
        assert_eq!(c.classify("¿Cuál es el PRECIO?"), "purchase_inquiry");
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let c = IntentClassifier::default();
        // matches both purchase ("comprar") and support ("ayuda")
        assert_eq!(c.classify("ayuda para comprar"), "purchase_inquiry");
    }

    #[test]
    fn test_fallbacks() {
        let c = IntentClassifier::new(&[]);
        assert_eq!(c.classify("¿qué hora es"), QUESTION_INTENT);
        assert_eq!(c.classify("hola"), STATEMENT_INTENT);
    }

    #[test]
    fn test_emotions_collects_all() {
        let d = EmotionDetector::default();
        let found = d.detect("Estoy harto, lo necesito URGENTE");
        assert_eq!(found, vec!["frustration".to_string(), "urgency".to_string()]);
        assert!(d.detect("hola").is_empty());
    }

    #[test]
    fn test_rule_yaml_accepts_label_aliases() {
        let rule: PhraseRule = serde_yaml::from_str("intent: refund\nphrases: [reembolso]").unwrap();
        assert_eq!(rule.label, "refund");
    }
}
