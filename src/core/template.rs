//! Placeholder rendering for resource attributes and workflow parameters.
//!
//! `{{ raw_bucket.url }}` resolves to an attribute of a realized resource,
//! `{{ raw_bucket }}` to its `name`, and `{{ project_id }}`, `{{ region }}`,
//! `{{ zone }}`, `{{ run_id }}` to the run context.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{ResourceIdentity, RunContext};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)(?:\.([A-Za-z0-9_-]+))?\s*\}\}").unwrap()
});

/// Names resolved from the run context rather than from resources
pub const CONTEXT_VARIABLES: [&str; 4] = ["project_id", "region", "zone", "run_id"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("'{{{{ {reference} }}}}' refers to resource '{resource}', which has not been realized")]
    UnrealizedResource { reference: String, resource: String },

    #[error("Resource '{resource}' has no attribute '{attribute}'")]
    UnknownAttribute { resource: String, attribute: String },
}

/// What placeholders can see
pub struct TemplateScope<'a> {
    pub ctx: &'a RunContext,
    pub identities: &'a BTreeMap<String, ResourceIdentity>,
}

impl<'a> TemplateScope<'a> {
    pub fn new(ctx: &'a RunContext, identities: &'a BTreeMap<String, ResourceIdentity>) -> Self {
        Self { ctx, identities }
    }

    fn resolve(&self, caps: &Captures<'_>) -> Result<String, TemplateError> {
        let head = &caps[1];
        let attribute = caps.get(2).map(|m| m.as_str());

        if attribute.is_none() {
            match head {
                "project_id" => return Ok(self.ctx.project_id.clone()),
                "region" => return Ok(self.ctx.region.clone()),
                "zone" => return Ok(self.ctx.zone.clone()),
                "run_id" => return Ok(self.ctx.run_id.to_string()),
                _ => {}
            }
        }

        let identity = self
            .identities
            .get(head)
            .ok_or_else(|| TemplateError::UnrealizedResource {
                reference: caps[0].trim_matches(|c| c == '{' || c == '}').trim().to_string(),
                resource: head.to_string(),
            })?;

        let attribute = attribute.unwrap_or("name");
        identity
            .get(attribute)
            .map(str::to_string)
            .ok_or_else(|| TemplateError::UnknownAttribute {
                resource: head.to_string(),
                attribute: attribute.to_string(),
            })
    }
}

/// Resource names referenced by a string (context variables excluded)
pub fn references(template: &str) -> BTreeSet<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .filter(|caps| caps.get(2).is_some() || !CONTEXT_VARIABLES.contains(&&caps[1]))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Resource names referenced anywhere inside a JSON value
pub fn value_references(value: &Value) -> BTreeSet<String> {
    match value {
        Value::String(s) => references(s),
        Value::Array(items) => items.iter().flat_map(value_references).collect(),
        Value::Object(map) => map.values().flat_map(value_references).collect(),
        _ => BTreeSet::new(),
    }
}

/// Render every placeholder in a string
pub fn render_str(template: &str, scope: &TemplateScope<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((last, last));
        out.push_str(&template[last..whole.0]);
        out.push_str(&scope.resolve(&caps)?);
        last = whole.1;
    }
    out.push_str(&template[last..]);

    Ok(out)
}

/// Render every string inside a JSON value; other values pass through
pub fn render_value(value: &Value, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    Ok(match value {
        Value::String(s) => Value::String(render_str(s, scope)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_value(v, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_value(v, scope)?)))
                .collect::<Result<_, TemplateError>>()?,
        ),
        other => other.clone(),
    })
}
