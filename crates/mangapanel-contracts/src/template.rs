use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::reply::GenerationResult;
use crate::settings::NodeBindings;

/// A rendering-pipeline description as served to the rendering server: a
/// mapping of node id to node body. The document is opaque except for the
/// bound nodes whose `inputs` the workflow overlays; node order is kept so
/// the submitted document round-trips the template as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobTemplate {
    pub nodes: IndexMap<String, Value>,
}

impl JobTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job template {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("job template {} is not a JSON object", path.display()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("job template is not a JSON object")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Overlay the override record onto a copy. Only fields present in the
    /// overrides are written; every unrelated node, and every unrelated input
    /// of a bound node, is left untouched. The shared template itself is
    /// never mutated.
    pub fn merged_with(&self, overrides: &PromptOverrides, bindings: &NodeBindings) -> JobTemplate {
        let mut merged = self.clone();
        if let Some(text) = &overrides.positive_prompt {
            set_node_input(&mut merged.nodes, &bindings.positive_text, "text", json!(text));
        }
        if let Some(text) = &overrides.negative_prompt {
            set_node_input(&mut merged.nodes, &bindings.negative_text, "text", json!(text));
        }
        if let Some(seed) = overrides.noise_seed {
            set_node_input(&mut merged.nodes, &bindings.seed, "noise_seed", json!(seed));
        }
        if let Some(width) = overrides.width {
            set_node_input(&mut merged.nodes, &bindings.dimensions, "width", json!(width));
        }
        if let Some(height) = overrides.height {
            set_node_input(&mut merged.nodes, &bindings.dimensions, "height", json!(height));
        }
        merged
    }
}

/// The fixed record of values the submitter may write into a template. A
/// `None` field is simply not written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptOverrides {
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub noise_seed: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl PromptOverrides {
    /// Build overrides from generated parameters. A seed the user pinned in
    /// the settings wins over the generated one; this is resolved here, before
    /// any merge happens.
    pub fn from_generation(result: &GenerationResult, fixed_seed: Option<u64>) -> Self {
        Self {
            positive_prompt: Some(result.positive_prompt.clone()),
            negative_prompt: Some(result.negative_prompt.clone()),
            noise_seed: fixed_seed.or(result.noise_seed),
            width: result.width,
            height: result.height,
        }
    }
}

fn set_node_input(
    nodes: &mut IndexMap<String, Value>,
    node_id: &str,
    field: &str,
    value: Value,
) {
    let node = nodes
        .entry(node_id.to_string())
        .or_insert_with(|| json!({ "inputs": {} }));
    let Some(body) = node.as_object_mut() else {
        return;
    };
    let inputs = body
        .entry("inputs".to_string())
        .or_insert_with(|| json!({}));
    if let Some(inputs) = inputs.as_object_mut() {
        inputs.insert(field.to_string(), value);
    }
}
