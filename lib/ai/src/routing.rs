//! Path selection by a language model.
//!
//! A router offers the model a list of named paths and asks for a JSON object
//! naming the ones to take:
//!
//! ```json
//! {"selectedPaths": ["billing", "refund"], "reasoning": "...", "confidence": 0.8}
//! ```
//!
//! Each entry may also be an object (`{"pathId", "reasoning", "priority",
//! "confidence"}`) when the model ranks its choices. A bare `selectedPath`
//! string is accepted as a single choice.

use crate::backend::ModelRequest;
use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

const SYSTEM_PROMPT: &str = "You are a workflow router. Read the input and the available paths, \
then answer with a single JSON object of the form \
{\"selectedPaths\": [{\"pathId\": string, \"reasoning\": string, \"priority\": number, \"confidence\": number}], \
\"reasoning\": string}. Only use path ids from the list. Lower priority runs first.";

/// A path the model may choose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOption {
    /// Path identifier; matches an edge port or chain mapping.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// What this path is for.
    #[serde(default)]
    pub description: Option<String>,
}

/// One chosen path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteChoice {
    /// The chosen path id.
    pub path_id: String,
    /// Why this path was chosen.
    pub reasoning: Option<String>,
    /// Execution order hint; lower first.
    pub priority: u32,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
}

/// The model's routing decision.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    /// Chosen paths in the order the model listed them.
    pub selected: Vec<RouteChoice>,
    /// Overall reasoning.
    pub reasoning: Option<String>,
}

impl RouteDecision {
    /// Chosen path ids in listed order.
    #[must_use]
    pub fn path_ids(&self) -> Vec<String> {
        self.selected.iter().map(|c| c.path_id.clone()).collect()
    }
}

/// Builds the completion request that asks `model` to pick among `options`.
#[must_use]
pub fn build_routing_request(
    model: &str,
    instructions: &str,
    options: &[RouteOption],
    input: &JsonValue,
    allow_multiple: bool,
    max_tokens: u32,
) -> ModelRequest {
    let mut prompt = String::new();
    if !instructions.is_empty() {
        prompt.push_str(instructions);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Available paths:\n");
    for option in options {
        match &option.description {
            Some(description) => {
                prompt.push_str(&format!("- {} ({}): {}\n", option.id, option.name, description));
            }
            None => prompt.push_str(&format!("- {} ({})\n", option.id, option.name)),
        }
    }
    if allow_multiple {
        prompt.push_str("\nSelect every path that applies.\n");
    } else {
        prompt.push_str("\nSelect exactly one path.\n");
    }
    prompt.push_str("\nInput:\n");
    prompt.push_str(&input.to_string());

    ModelRequest::new(model, prompt)
        .with_system(SYSTEM_PROMPT)
        .with_temperature(0.0)
        .with_max_tokens(max_tokens)
        .with_json_output()
}

/// Parses the model's reply into a decision.
///
/// Path ids that are not among `options` are kept; callers decide whether an
/// unknown path is an error. With `allow_multiple` false only the first
/// choice survives.
///
/// # Errors
///
/// Returns `ModelError::InvalidResponse` when no JSON object with a selection
/// can be found in `content`.
pub fn parse_decision(
    content: &str,
    options: &[RouteOption],
    allow_multiple: bool,
) -> Result<RouteDecision, ModelError> {
    let object = extract_json_object(content).ok_or_else(|| ModelError::InvalidResponse {
        details: "reply contains no JSON object".to_string(),
    })?;
    let value: JsonValue =
        serde_json::from_str(object).map_err(|e| ModelError::InvalidResponse {
            details: e.to_string(),
        })?;

    let default_confidence = value
        .get("confidence")
        .and_then(JsonValue::as_f64)
        .unwrap_or(1.0);

    let entries: Vec<JsonValue> = match (value.get("selectedPaths"), value.get("selectedPath")) {
        (Some(JsonValue::Array(entries)), _) => entries.clone(),
        (_, Some(single @ JsonValue::String(_))) => vec![single.clone()],
        _ => {
            return Err(ModelError::InvalidResponse {
                details: "reply has no selectedPaths".to_string(),
            });
        }
    };

    let mut selected = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let position = u32::try_from(index).unwrap_or(u32::MAX);
        let choice = match entry {
            JsonValue::String(path_id) => RouteChoice {
                path_id: path_id.clone(),
                reasoning: None,
                priority: position,
                confidence: default_confidence,
            },
            JsonValue::Object(fields) => {
                let Some(path_id) = fields
                    .get("pathId")
                    .or_else(|| fields.get("id"))
                    .and_then(JsonValue::as_str)
                else {
                    warn!(entry = %entry, "Ignoring route choice without a path id");
                    continue;
                };
                RouteChoice {
                    path_id: path_id.to_string(),
                    reasoning: fields
                        .get("reasoning")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    priority: fields
                        .get("priority")
                        .and_then(JsonValue::as_u64)
                        .and_then(|p| u32::try_from(p).ok())
                        .unwrap_or(position),
                    confidence: fields
                        .get("confidence")
                        .and_then(JsonValue::as_f64)
                        .unwrap_or(default_confidence)
                        .clamp(0.0, 1.0),
                }
            }
            other => {
                warn!(entry = %other, "Ignoring malformed route choice");
                continue;
            }
        };
        if !options.iter().any(|o| o.id == choice.path_id) {
            warn!(path_id = %choice.path_id, "Model selected a path that was not offered");
        }
        if selected.iter().any(|c: &RouteChoice| c.path_id == choice.path_id) {
            continue;
        }
        selected.push(choice);
    }

    if !allow_multiple {
        selected.truncate(1);
    }

    Ok(RouteDecision {
        selected,
        reasoning: value
            .get("reasoning")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
    })
}

/// Finds the outermost `{...}` span, which also strips Markdown code fences.
fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}
