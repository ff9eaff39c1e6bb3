//! Instant trigger index.
//!
//! All personas' instant phrases are compiled once into a single
//! case-insensitive [`RegexSet`], so one pass over the message reports every
//! phrase it contains. Ties between matches are broken by phrase length
//! (longest, i.e. most specific, first) and then by persona declaration order.

use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::persona::PersonaRegistry;

/// Instant layer toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantLayerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for InstantLayerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A phrase hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantMatch {
    pub persona_id: String,
    pub phrase: String,
}

#[derive(Debug, Clone)]
struct PatternEntry {
    persona_id: String,
    persona_position: usize,
    phrase: String,
    phrase_chars: usize,
}

/// Prebuilt multi-pattern index over every persona's instant phrases.
#[derive(Debug, Clone)]
pub struct TriggerIndex {
    set: Option<RegexSet>,
    entries: Vec<PatternEntry>,
}

impl TriggerIndex {
    /// Compile the index from the registry.
    pub fn new(registry: &PersonaRegistry) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for (position, persona) in registry.iter().enumerate() {
            for phrase in &persona.instant_triggers {
                entries.push(PatternEntry {
                    persona_id: persona.id.clone(),
                    persona_position: position,
                    phrase: phrase.clone(),
                    phrase_chars: phrase.chars().count(),
                });
            }
        }

        let set = if entries.is_empty() {
            None
        } else {
            let patterns: Vec<String> = entries.iter().map(|e| regex::escape(&e.phrase)).collect();
            let set = RegexSetBuilder::new(&patterns)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidPolicy(format!("instant trigger index: {}", e)))?;
            Some(set)
        };

        log::debug!("Instant trigger index built with {} phrases", entries.len());
        Ok(Self { set, entries })
    }

    /// Every phrase contained in `text`, best match first.
    pub fn find_matches(&self, text: &str) -> Vec<InstantMatch> {
        let Some(set) = &self.set else {
            return Vec::new();
        };
        if text.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<&PatternEntry> = set.matches(text).iter().map(|i| &self.entries[i]).collect();
        hits.sort_by(|a, b| {
            b.phrase_chars
                .cmp(&a.phrase_chars)
                .then(a.persona_position.cmp(&b.persona_position))
        });
        hits.into_iter()
            .map(|e| InstantMatch {
                persona_id: e.persona_id.clone(),
                phrase: e.phrase.clone(),
            })
            .collect()
    }

    /// The winning match under the tie-break policy.
    pub fn best_match(&self, text: &str) -> Option<InstantMatch> {
        self.find_matches(text).into_iter().next()
    }

    /// Number of indexed phrases.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
