//! Error types for the morphing engine.
//!
//! Only [`ConfigError`] is fatal, and only at startup. Store errors are
//! absorbed by each feature, which degrades to its stateless default.

use thiserror::Error;

/// Errors raised while loading or validating the morphing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed (includes missing required fields).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Two personas share the same id.
    #[error("Duplicate persona id: {0}")]
    DuplicatePersona(String),

    /// The configured default persona is not declared.
    #[error("Default persona '{0}' is not declared")]
    UnknownDefaultPersona(String),

    /// The registry was built with no personas at all.
    #[error("No personas declared")]
    NoPersonas,

    /// A trigger phrase, keyword, intent or emotion is blank.
    #[error("Persona '{persona}' has a blank {field} entry")]
    BlankTrigger { persona: String, field: &'static str },

    /// An announcement template does not render.
    #[error("Invalid template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    /// Anti-loop or scoring parameters are out of range.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// An experiment definition is malformed.
    #[error("Invalid experiment '{id}': {message}")]
    InvalidExperiment { id: String, message: String },
}

/// Errors from the external key-value store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The round trip exceeded the configured bound.
    #[error("Store operation '{op}' timed out after {millis}ms")]
    Timeout { op: String, millis: u64 },

    /// Connection or backend failure.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("Corrupt value at '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Umbrella error for the engine.
#[derive(Debug, Error)]
pub enum MorphError {
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A persona id that does not resolve in the registry.
    #[error("Invalid persona reference: {0}")]
    InvalidPersonaReference(String),
}
