//! Template lookup and rendering.
//!
//! Templated messages carry a `template_name` and a context map instead of
//! a subject and body. Before delivery the [`Courier`](crate::Courier) loads
//! the [`EmailTemplate`], checks that every variable it references is in
//! the context, and renders subject and body through a [`TemplateEngine`].
//!
//! [`MemoryTemplateEngine`] keeps templates in memory and substitutes
//! `{{ name }}` and `{name}` placeholders.
//!
//! ```
//! use courier::template::{render_simple, Context};
//!
//! let mut context = Context::new();
//! context.insert("name".to_string(), serde_json::json!("Alice"));
//!
//! assert_eq!(render_simple("Hello {{ name }}!", &context), "Hello Alice!");
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::MailError;

/// Template variables available during rendering.
pub type Context = HashMap<String, serde_json::Value>;

/// Which body a template renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateType {
    #[default]
    Html,
    Text,
}

/// A stored email template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub name: String,
    pub subject_template: String,
    pub body_template: String,
    #[serde(default)]
    pub template_type: TemplateType,
    /// Variables the template uses; derived from the text when empty.
    #[serde(default)]
    pub variables: Vec<String>,
}

impl EmailTemplate {
    /// Create a template. `variables` is filled from subject and body.
    pub fn new(
        name: impl Into<String>,
        subject_template: impl Into<String>,
        body_template: impl Into<String>,
        template_type: TemplateType,
    ) -> Self {
        let subject_template = subject_template.into();
        let body_template = body_template.into();
        let mut variables = extract_variables(&subject_template);
        for var in extract_variables(&body_template) {
            if !variables.contains(&var) {
                variables.push(var);
            }
        }

        Self {
            name: name.into(),
            subject_template,
            body_template,
            template_type,
            variables,
        }
    }

    /// Referenced variables absent from `context`.
    pub fn missing_variables(&self, context: &Context) -> Vec<String> {
        if self.variables.is_empty() {
            let mut missing = missing_variables(&self.subject_template, context);
            for var in missing_variables(&self.body_template, context) {
                if !missing.contains(&var) {
                    missing.push(var);
                }
            }
            return missing;
        }
        self.variables
            .iter()
            .filter(|var| !context.contains_key(*var))
            .cloned()
            .collect()
    }
}

/// Renders template strings and looks templates up by name.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    /// Render one template string against `context`.
    async fn render_string(&self, template: &str, context: &Context) -> Result<String, MailError>;

    /// Look up a template by name.
    async fn load_template(&self, name: &str) -> Result<EmailTemplate, MailError>;
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{?\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}?\}").expect("variable pattern is valid")
    })
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}|\{([a-zA-Z_][a-zA-Z0-9_]*)\}")
            .expect("placeholder pattern is valid")
    })
}

/// Variable names referenced by `template`, in first-use order.
///
/// ```
/// use courier::template::extract_variables;
///
/// assert_eq!(
///     extract_variables("Hi {{ name }}, your code is {code}. Bye {{name}}"),
///     vec!["name", "code"]
/// );
/// ```
pub fn extract_variables(template: &str) -> Vec<String> {
    let mut vars: Vec<String> = Vec::new();
    for caps in variable_pattern().captures_iter(template) {
        let var = &caps[1];
        if !vars.iter().any(|v| v == var) {
            vars.push(var.to_string());
        }
    }
    vars
}

/// Variables referenced by `template` that `context` does not provide.
pub fn missing_variables(template: &str, context: &Context) -> Vec<String> {
    extract_variables(template)
        .into_iter()
        .filter(|var| !context.contains_key(var))
        .collect()
}

/// Substitute `{{ var }}` and `{var}` placeholders. Unknown variables are
/// left in place.
pub fn render_simple(template: &str, context: &Context) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
            match name.and_then(|n| context.get(n)) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) => String::new(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// In-memory template registry.
#[derive(Debug, Default)]
pub struct MemoryTemplateEngine {
    templates: RwLock<HashMap<String, EmailTemplate>>,
}

impl MemoryTemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a template under its name.
    pub fn save_template(&self, template: EmailTemplate) {
        self.templates
            .write()
            .insert(template.name.clone(), template);
    }

    /// Builder-style [`save_template`](Self::save_template).
    pub fn with_template(self, template: EmailTemplate) -> Self {
        self.save_template(template);
        self
    }

    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TemplateEngine for MemoryTemplateEngine {
    async fn render_string(&self, template: &str, context: &Context) -> Result<String, MailError> {
        Ok(render_simple(template, context))
    }

    async fn load_template(&self, name: &str) -> Result<EmailTemplate, MailError> {
        self.templates
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MailError::Template(format!("template '{}' not found", name)))
    }
}
