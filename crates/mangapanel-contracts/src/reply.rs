use serde::Serialize;
use serde_json::Value;

use crate::errors::{Stage, WorkflowError};

/// How a model reply's text should be interpreted before use.
///
/// The text endpoint answers with free text; depending on the instruction it
/// carries a bare JSON object, a JSON object wrapped in documentation-style
/// fence markers, or a freeform HTML fragment. Each tag has its own unwrap
/// path instead of a blanket strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPayload {
    PlainJson,
    FencedJson,
    FreeformHtml,
}

pub fn classify_reply(text: &str) -> ReplyPayload {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        ReplyPayload::FencedJson
    } else if trimmed.starts_with('{') || trimmed.starts_with('[') {
        ReplyPayload::PlainJson
    } else {
        ReplyPayload::FreeformHtml
    }
}

/// Strip exactly one leading fence marker (with an optional language tag)
/// and one trailing fence marker. Anything not wrapped that way is returned
/// trimmed but otherwise untouched.
pub fn unwrap_fenced(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = after_open.strip_suffix("```") else {
        return trimmed;
    };
    strip_fence_tag(inner).trim()
}

// The opening fence may carry a language tag on the fence line itself. Only
// a recognized tag followed by a line break is stripped, never reply content.
fn strip_fence_tag(inner: &str) -> &str {
    for tag in ["json", "html"] {
        if let Some(rest) = inner.strip_prefix(tag) {
            if rest.starts_with(['\r', '\n']) {
                return rest;
            }
        }
    }
    inner
}

/// Interpret a reply as JSON, unwrapping fences when present.
pub fn reply_json(stage: Stage, text: &str) -> Result<Value, WorkflowError> {
    let inner = match classify_reply(text) {
        ReplyPayload::PlainJson => text.trim(),
        ReplyPayload::FencedJson => unwrap_fenced(text),
        ReplyPayload::FreeformHtml => {
            return Err(WorkflowError::malformed(
                stage,
                "expected a JSON reply, got freeform text",
            ))
        }
    };
    serde_json::from_str(inner)
        .map_err(|err| WorkflowError::malformed(stage, format!("reply is not valid JSON: {err}")))
}

/// Interpret a reply as an HTML fragment. Models occasionally fence markup
/// the same way they fence JSON; that wrapping is removed, nothing else.
pub fn reply_html(text: &str) -> String {
    match classify_reply(text) {
        ReplyPayload::FencedJson => unwrap_fenced(text).to_string(),
        _ => text.trim().to_string(),
    }
}

/// Image-generation parameters derived from the chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub noise_seed: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl GenerationResult {
    pub fn from_reply_text(text: &str) -> Result<Self, WorkflowError> {
        let value = reply_json(Stage::Parameters, text)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, WorkflowError> {
        let Some(obj) = value.as_object() else {
            return Err(WorkflowError::malformed(
                Stage::Parameters,
                "parameter reply is not a JSON object",
            ));
        };

        let positive_prompt = required_text(obj, "positive_prompt")?;
        let negative_prompt = required_text(obj, "negative_prompt")?;
        let noise_seed = optional_u64(obj, "noise_seed")?;
        let width = optional_dimension(obj, "width")?;
        let height = optional_dimension(obj, "height")?;

        Ok(Self {
            positive_prompt,
            negative_prompt,
            noise_seed,
            width,
            height,
        })
    }
}

fn required_text(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, WorkflowError> {
    let text = obj
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(WorkflowError::malformed(
            Stage::Parameters,
            format!("parameter reply is missing {key}"),
        ));
    }
    Ok(text.to_string())
}

fn optional_u64(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u64>, WorkflowError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            WorkflowError::malformed(
                Stage::Parameters,
                format!("{key} is not a non-negative integer: {value}"),
            )
        }),
    }
}

fn optional_dimension(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<u32>, WorkflowError> {
    let Some(raw) = optional_u64(obj, key)? else {
        return Ok(None);
    };
    u32::try_from(raw).map(Some).map_err(|_| {
        WorkflowError::malformed(Stage::Parameters, format!("{key} is out of range: {raw}"))
    })
}
