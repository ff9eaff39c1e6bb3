//! Persona definitions: the behavioral configurations the assistant can adopt.
//!
//! A persona is a tagged record built once from configuration: personality
//! text, model overrides, the phrases that trigger it instantly, the weighted
//! signals that trigger it gradually, and its tool/RAG allowlists. Personas
//! are immutable after load and live in a [`PersonaRegistry`].
//!
//! ```yaml
//! sales:
//!   personality: "You help customers pick the right product."
//!   model: gpt-4o-mini
//!   temperature: 0.4
//!   instant_triggers: ["quiero comprar"]
//!   gradual_triggers:
//!     keywords: ["comparar", "mejor opción"]
//!     intents: [purchase_inquiry]
//!     emotions: []
//!     min_score: 3
//!   tools: [catalog_search]
//! ```

pub mod registry;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub use registry::PersonaRegistry;

/// Model parameters a persona overrides on the next model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverrides {
    /// Model name (e.g. `gpt-4o-mini`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Completion token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Retrieval override for a persona.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RagOverride {
    /// Whether retrieval is enabled while this persona is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Collection to search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Number of documents to retrieve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

/// Weighted signals that let a persona win on the gradual layer.
///
/// `min_score` is required whenever the block is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradualTriggers {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub emotions: Vec<String>,
    /// Minimum raw score for this persona to qualify.
    pub min_score: u32,
}

/// A named behavioral configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    /// Unique id. Filled from the mapping key when loaded from YAML.
    #[serde(default)]
    pub id: String,
    /// System personality text.
    pub personality: String,
    /// Model parameter overrides.
    #[serde(flatten)]
    pub model: ModelOverrides,
    /// Phrases that cause an immediate switch.
    #[serde(default)]
    pub instant_triggers: Vec<String>,
    /// Weighted signals for the gradual layer.
    #[serde(default)]
    pub gradual_triggers: Option<GradualTriggers>,
    /// Tool allowlist.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Retrieval override.
    #[serde(default)]
    pub rag: Option<RagOverride>,
    /// Short capability label used in acknowledged transitions.
    #[serde(default)]
    pub capability: Option<String>,
    /// Per-persona announcement template, overrides the global one.
    #[serde(default)]
    pub announcement: Option<String>,
}

impl Persona {
    /// Create a persona with only a personality; triggers are added with the
    /// builder methods.
    pub fn new(id: impl Into<String>, personality: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            personality: personality.into(),
            model: ModelOverrides::default(),
            instant_triggers: Vec::new(),
            gradual_triggers: None,
            tools: Vec::new(),
            rag: None,
            capability: None,
            announcement: None,
        }
    }

    /// Add instant trigger phrases.
    pub fn with_instant_triggers<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instant_triggers
            .extend(phrases.into_iter().map(Into::into));
        self
    }

    /// Set the gradual triggers.
    pub fn with_gradual_triggers(mut self, triggers: GradualTriggers) -> Self {
        self.gradual_triggers = Some(triggers);
        self
    }

    /// Set the capability label.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Label naming what this persona is good at.
    pub fn capability_label(&self) -> &str {
        self.capability.as_deref().unwrap_or(&self.id)
    }

    /// Minimum raw score on the gradual layer, if the persona takes part in it.
    pub fn min_score(&self) -> Option<u32> {
        self.gradual_triggers.as_ref().map(|g| g.min_score)
    }

    /// Lower-case and trim every trigger entry, rejecting blanks.
    pub(crate) fn normalized(mut self) -> Result<Self, ConfigError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::BlankTrigger {
                persona: self.id,
                field: "id",
            });
        }
        self.id = id;
        self.instant_triggers = normalize_list(&self.id, "instant_triggers", self.instant_triggers)?;
        if let Some(gradual) = self.gradual_triggers.take() {
            self.gradual_triggers = Some(GradualTriggers {
                keywords: normalize_list(&self.id, "keywords", gradual.keywords)?,
                intents: normalize_list(&self.id, "intents", gradual.intents)?,
                emotions: normalize_list(&self.id, "emotions", gradual.emotions)?,
                min_score: gradual.min_score,
            });
        }
        Ok(self)
    }
}

fn normalize_list(
    persona: &str,
    field: &'static str,
    entries: Vec<String>,
) -> Result<Vec<String>, ConfigError> {
    let mut out: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let norm = entry.trim().to_lowercase();
        if norm.is_empty() {
            return Err(ConfigError::BlankTrigger {
                persona: persona.to_string(),
                field,
            });
        }
        if !out.contains(&norm) {
            out.push(norm);
        }
    }
    Ok(out)
}
