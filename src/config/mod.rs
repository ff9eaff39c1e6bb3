//! Engine configuration.
//!
//! One YAML document configures the whole engine:
//!
//! ```yaml
//! default_persona: general
//! settings:
//!   transition_style: acknowledged
//!   history_turns: 6
//! gradual_layer:
//!   confidence_threshold: 0.4
//! anti_loop:
//!   max_repeats: 2
//!   window: 3
//! experiments:
//!   - id: confidence_threshold
//!     parameter: confidence_threshold
//!     variants: [0.4, 0.6, 0.8]
//! personas:
//!   general:
//!     personality: "Friendly general assistant."
//!   sales:
//!     personality: "Sales specialist."
//!     instant_triggers: ["quiero comprar"]
//! ```
//!
//! `personas` is an ordered mapping: declaration order is preserved and is
//! the final tie-break between equally good matches.

use std::fmt;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::anti_loop::AntiLoopPolicy;
use crate::error::ConfigError;
use crate::experiment::ExperimentDefinition;
use crate::feedback::FeedbackConfig;
use crate::persona::{Persona, PersonaRegistry};
use crate::store::StoreConfig;
use crate::transition::{validate_template, TransitionStyle, DEFAULT_ANNOUNCEMENT};
use crate::triggers::{GradualLayerConfig, InstantLayerConfig};

/// Environment variable that overrides `enabled`.
pub const ENABLED_ENV: &str = "MORPHING_ENABLED";

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MorphingSettings {
    #[serde(default)]
    pub transition_style: TransitionStyle,
    #[serde(default = "default_announcement")]
    pub announcement_template: String,
    /// Turns (K) the continuity bonus and patch look back over.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

fn default_announcement() -> String {
    DEFAULT_ANNOUNCEMENT.to_string()
}

fn default_history_turns() -> usize {
    6
}

impl Default for MorphingSettings {
    fn default() -> Self {
        Self {
            transition_style: TransitionStyle::default(),
            announcement_template: default_announcement(),
            history_turns: default_history_turns(),
        }
    }
}

// ============================================================================
// MorphingConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MorphingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub default_persona: String,
    #[serde(default)]
    pub settings: MorphingSettings,
    #[serde(default)]
    pub instant_layer: InstantLayerConfig,
    #[serde(default)]
    pub gradual_layer: GradualLayerConfig,
    #[serde(default)]
    pub anti_loop: AntiLoopPolicy,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub experiments: Vec<ExperimentDefinition>,
    #[serde(default)]
    pub store: StoreConfig,
    /// Personas in declaration order.
    #[serde(deserialize_with = "ordered_personas")]
    pub personas: Vec<Persona>,
}

fn default_true() -> bool {
    true
}

impl MorphingConfig {
    /// Config with default settings around the given personas.
    pub fn new(personas: Vec<Persona>, default_persona: impl Into<String>) -> Self {
        Self {
            enabled: true,
            default_persona: default_persona.into(),
            settings: MorphingSettings::default(),
            instant_layer: InstantLayerConfig::default(),
            gradual_layer: GradualLayerConfig::default(),
            anti_loop: AntiLoopPolicy::default(),
            feedback: FeedbackConfig::default(),
            experiments: Vec::new(),
            store: StoreConfig::default(),
            personas,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Apply `MORPHING_ENABLED` if set.
    pub fn apply_env_overrides(&mut self) {
        let value = std::env::var(ENABLED_ENV).ok();
        self.apply_enabled_override(value.as_deref());
    }

    fn apply_enabled_override(&mut self, value: Option<&str>) {
        if let Some(raw) = value {
            let enabled = matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes");
            if enabled != self.enabled {
                log::info!("{}={} overrides enabled={}", ENABLED_ENV, raw, self.enabled);
            }
            self.enabled = enabled;
        }
    }

    /// Check every section. Persona-level checks happen in
    /// [`build_registry`](Self::build_registry).
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gradual_layer.validate()?;
        self.anti_loop.validate()?;
        self.feedback.validate()?;
        for exp in &self.experiments {
            exp.validate()?;
        }
        validate_template(&self.settings.announcement_template)?;
        for persona in &self.personas {
            if let Some(template) = &persona.announcement {
                validate_template(template)?;
            }
        }
        Ok(())
    }

    pub fn build_registry(&self) -> Result<PersonaRegistry, ConfigError> {
        PersonaRegistry::new(self.personas.clone(), &self.default_persona)
    }
}

// ----------------------------------------------------------------------------
// Ordered persona mapping
// ----------------------------------------------------------------------------

/// Deserialize `id -> persona` into a `Vec` in document order, filling each
/// persona's id from its key. Duplicates are kept and rejected by the
/// registry.
fn ordered_personas<'de, D>(deserializer: D) -> Result<Vec<Persona>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PersonaMap;

    impl<'de> Visitor<'de> for PersonaMap {
        type Value = Vec<Persona>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of persona id to persona")
        }

        fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            let mut personas = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((id, mut persona)) = map.next_entry::<String, Persona>()? {
                persona.id = id;
                personas.push(persona);
            }
            Ok(personas)
        }
    }

    deserializer.deserialize_map(PersonaMap)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::experiment::TunableParameter;

    const YAML: &str = r#"
default_persona: general
settings:
  transition_style: acknowledged
  history_turns: 4
gradual_layer:
  confidence_threshold: 0.5
  weights: { keyword: 3 }
anti_loop:
  max_repeats: 1
  window: 2
experiments:
  - id: threshold_test
    parameter: confidence_threshold
    variants: [0.4, 0.6, 0.8]
personas:
  support:
    personality: "Support"
    instant_triggers: ["no funciona"]
  general:
    personality: "General"
  sales:
    personality: "Sales"
    model: gpt-4o-mini
    instant_triggers: ["quiero comprar"]
    gradual_triggers:
      keywords: ["comparar"]
      min_score: 3
"#;

    #[test]
    fn test_parse_full_document() {
        let cfg = MorphingConfig::from_yaml(YAML).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.settings.transition_style, TransitionStyle::Acknowledged);
        assert_eq!(cfg.settings.history_turns, 4);
        assert_eq!(cfg.gradual_layer.confidence_threshold, 0.5);
        assert_eq!(cfg.gradual_layer.weights.keyword, 3.0);
        assert_eq!(cfg.gradual_layer.weights.intent, 3.0);
        assert_eq!(cfg.anti_loop.max_repeats, 1);
        assert_eq!(cfg.anti_loop.history_size, 5);
        assert_eq!(cfg.experiments[0].parameter, TunableParameter::ConfidenceThreshold);
        assert_eq!(cfg.store.namespace, "morphing");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_persona_order_and_ids_from_keys() {
        let cfg = MorphingConfig::from_yaml(YAML).unwrap();
        let ids: Vec<&str> = cfg.personas.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["support", "general", "sales"]);
        let registry = cfg.build_registry().unwrap();
        assert_eq!(registry.default_id(), "general");
        assert_eq!(registry.get("sales").unwrap().model.model.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn test_missing_personality_is_fatal() {
        let yaml = "default_persona: a\npersonas:\n  a:\n    instant_triggers: [x]\n";
        assert!(matches!(MorphingConfig::from_yaml(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_unknown_default_is_fatal() {
        let yaml = "default_persona: nobody\npersonas:\n  a:\n    personality: A\n";
        let cfg = MorphingConfig::from_yaml(yaml).unwrap();
        assert!(matches!(cfg.build_registry(), Err(ConfigError::UnknownDefaultPersona(_))));
    }

    #[test]
    fn test_invalid_sections_rejected() {
        let mut cfg = MorphingConfig::from_yaml(YAML).unwrap();
        cfg.settings.announcement_template = "{% if %}".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTemplate { .. })));

        let mut cfg = MorphingConfig::from_yaml(YAML).unwrap();
        cfg.experiments[0].variants.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidExperiment { .. })));

        let mut cfg = MorphingConfig::from_yaml(YAML).unwrap();
        cfg.anti_loop.window = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidPolicy(_))));
    }

    #[test]
    fn test_enabled_override() {
        let mut cfg = MorphingConfig::from_yaml(YAML).unwrap();
        cfg.apply_enabled_override(Some("false"));
        assert!(!cfg.enabled);
        cfg.apply_enabled_override(Some("YES"));
        assert!(cfg.enabled);
        cfg.apply_enabled_override(None);
        assert!(cfg.enabled);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let cfg = MorphingConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(cfg.personas.len(), 3);

        let missing = MorphingConfig::from_yaml_file("/nonexistent/morphing.yaml");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
