//! Persona registry: the load-once catalog every persona id resolves against.
//!
//! Built once from configuration and shared read-only (behind an `Arc`)
//! by every component. Declaration order is kept: it is the last tie-break
//! when two personas match equally well.

use std::collections::HashMap;

use super::Persona;
use crate::error::ConfigError;

/// Immutable catalog of personas indexed by id.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    /// Personas in declaration order.
    personas: Vec<Persona>,
    /// id → position in `personas`.
    index: HashMap<String, usize>,
    /// Persona every conversation starts with.
    default_id: String,
}

impl PersonaRegistry {
    /// Build the registry, normalizing triggers and validating ids.
    ///
    /// Fails on duplicate ids, blank trigger entries, an empty persona list,
    /// or a default persona that is not declared.
    pub fn new(personas: Vec<Persona>, default_id: &str) -> Result<Self, ConfigError> {
        if personas.is_empty() {
            return Err(ConfigError::NoPersonas);
        }

        let mut normalized = Vec::with_capacity(personas.len());
        let mut index = HashMap::with_capacity(personas.len());
        for persona in personas {
            let persona = persona.normalized()?;
            if index.contains_key(&persona.id) {
                return Err(ConfigError::DuplicatePersona(persona.id));
            }
            index.insert(persona.id.clone(), normalized.len());
            normalized.push(persona);
        }

        let default_id = default_id.trim().to_string();
        if !index.contains_key(&default_id) {
            return Err(ConfigError::UnknownDefaultPersona(default_id));
        }

        log::info!(
            "Persona registry loaded: {} personas, default '{}'",
            normalized.len(),
            default_id
        );

        Ok(Self {
            personas: normalized,
            index,
            default_id,
        })
    }

    /// Look up a persona by id.
    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.index.get(id).map(|&i| &self.personas[i])
    }

    /// Whether `id` resolves.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration position of a persona.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// The default persona id.
    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// The default persona.
    pub fn default_persona(&self) -> &Persona {
        &self.personas[self.index[&self.default_id]]
    }

    /// All personas in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    /// All personas except `current`, in declaration order.
    pub fn others<'a>(&'a self, current: &'a str) -> impl Iterator<Item = &'a Persona> + 'a {
        self.personas.iter().filter(move |p| p.id != current)
    }

    /// Persona ids in declaration order.
    pub fn ids(&self) -> Vec<&str> {
        self.personas.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn personas() -> Vec<Persona> {
        vec![
            Persona::new("general", "General helper"),
            Persona::new("sales", "Sales").with_instant_triggers(["quiero comprar"]),
            Persona::new("support", "Support").with_instant_triggers(["no funciona"]),
        ]
    }

    #[test]
    fn test_lookup_and_order() {
        let reg = PersonaRegistry::new(personas(), "general").unwrap();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.ids(), vec!["general", "sales", "support"]);
        assert_eq!(reg.position("support"), Some(2));
        assert_eq!(reg.default_persona().id, "general");
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn test_others_excludes_current() {
        let reg = PersonaRegistry::new(personas(), "general").unwrap();
        let others: Vec<&str> = reg.others("sales").map(|p| p.id.as_str()).collect();
        assert_eq!(others, vec!["general", "support"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut list = personas();
        list.push(Persona::new("sales", "again"));
        let err = PersonaRegistry::new(list, "general").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePersona(id) if id == "sales"));
    }

    #[test]
    fn test_unknown_default_rejected() {
        let err = PersonaRegistry::new(personas(), "creative").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultPersona(_)));
    }

    #[test]
    fn test_empty_registry_rejected() {
        assert!(matches!(
            PersonaRegistry::new(vec![], "general"),
            Err(ConfigError::NoPersonas)
        ));
    }
}
