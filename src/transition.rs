//! Transition planning: how a switch is presented.
//!
//! `seamless` swaps the context silently. `acknowledged` also renders a
//! short announcement from a tera template. Available variables are
//! `from`, `to` and `capability`. A persona's own `announcement` template
//! takes precedence over the global one. Every template is parsed once when
//! the planner is built.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

use crate::error::ConfigError;
use crate::persona::Persona;
use crate::state::SystemContextDelta;

pub const DEFAULT_ANNOUNCEMENT: &str = "Switching to {{ capability }} mode so I can help you better.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStyle {
    #[default]
    Seamless,
    Acknowledged,
}

/// Result of planning a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub style: TransitionStyle,
    pub context_patch: SystemContextDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<String>,
    /// Why the switch happened, for logs.
    pub reason: String,
}

const GLOBAL_TEMPLATE: &str = "announcement";

fn persona_template(persona_id: &str) -> String {
    format!("persona/{}", persona_id)
}

/// Plans switches with templates parsed once, at construction.
#[derive(Debug, Clone)]
pub struct TransitionPlanner {
    tera: Tera,
    /// Personas registered with their own template.
    overrides: HashSet<String>,
}

impl TransitionPlanner {
    /// Parse the global template and every persona override. Fails if any
    /// of them does not render.
    pub fn new<'a>(
        template: impl Into<String>,
        personas: impl IntoIterator<Item = &'a Persona>,
    ) -> Result<Self, ConfigError> {
        let template = template.into();
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        register(&mut tera, GLOBAL_TEMPLATE, &template)?;

        let mut overrides = HashSet::new();
        for persona in personas {
            if let Some(own) = &persona.announcement {
                register(&mut tera, &persona_template(&persona.id), own)?;
                overrides.insert(persona.id.clone());
            }
        }
        log::debug!("Transition planner ready with {} persona templates", overrides.len());
        Ok(Self { tera, overrides })
    }

    pub fn plan(
        &self,
        old: &Persona,
        new: &Persona,
        style: TransitionStyle,
        reason: String,
        context_patch: SystemContextDelta,
    ) -> TransitionPlan {
        let announcement = match style {
            TransitionStyle::Seamless => None,
            TransitionStyle::Acknowledged => Some(self.render(old, new)),
        };
        TransitionPlan {
            style,
            context_patch,
            announcement,
            reason,
        }
    }

    fn render(&self, old: &Persona, new: &Persona) -> String {
        let ctx = context(&old.id, &new.id, new.capability_label());
        if self.overrides.contains(&new.id) {
            match self.tera.render(&persona_template(&new.id), &ctx) {
                Ok(text) => return text.trim().to_string(),
                // checked at load; keep going with the global one
                Err(e) => log::warn!("Announcement template for '{}' failed: {}", new.id, e),
            }
        }
        self.tera
            .render(GLOBAL_TEMPLATE, &ctx)
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|e| {
                log::warn!("Announcement template failed: {}", e);
                format!("Switching to {}.", new.capability_label())
            })
    }
}

impl Default for TransitionPlanner {
    fn default() -> Self {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        if let Err(e) = tera.add_raw_template(GLOBAL_TEMPLATE, DEFAULT_ANNOUNCEMENT) {
            log::error!("Default announcement template rejected: {}", e);
        }
        Self {
            tera,
            overrides: HashSet::new(),
        }
    }
}

fn register(tera: &mut Tera, name: &str, template: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidTemplate {
        template: template.to_string(),
        message,
    };
    tera.add_raw_template(name, template)
        .map_err(|e| invalid(e.to_string()))?;
    tera.render(name, &context("general", "sales", "sales"))
        .map(|_| ())
        .map_err(|e| invalid(e.to_string()))
}

fn context(from: &str, to: &str, capability: &str) -> Context {
    let mut ctx = Context::new();
    ctx.insert("from", from);
    ctx.insert("to", to);
    ctx.insert("capability", capability);
    ctx
}

/// Render the template once against sample values.
pub fn validate_template(template: &str) -> Result<(), ConfigError> {
    register(&mut Tera::default(), GLOBAL_TEMPLATE, template)
}
