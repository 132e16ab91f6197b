use serde::Deserialize;
use serde_json::Value;

use crate::call::CallKind;

/// Token counts reported by an OpenAI-compatible backend in a buffered
/// response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UsagePayload {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UsageEnvelope {
    model: Option<String>,
    usage: Option<UsagePayload>,
}

/// Pulls the model name and usage block out of a completed JSON body.
/// Returns `(None, default)` rather than failing on shapes we don't know.
pub fn extract_usage(body: &[u8]) -> (Option<String>, UsagePayload) {
    match serde_json::from_slice::<UsageEnvelope>(body) {
        Ok(envelope) => (envelope.model, envelope.usage.unwrap_or_default()),
        Err(_) => (None, UsagePayload::default()),
    }
}

/// Replaces (or inserts) the `model` field of a request body, returning the
/// re-serialized bytes. The input value is not mutated.
pub fn inject_model(body: &Value, model: &str) -> Vec<u8> {
    let mut body = body.clone();
    if let Some(map) = body.as_object_mut() {
        map.insert("model".to_string(), Value::String(model.to_string()));
    }
    serde_json::to_vec(&body).unwrap_or_default()
}

/// The model name a client asked for inside the request body, when present.
pub fn model_from_body(body: &Value) -> Option<String> {
    body.get("model")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

/// First choice's assistant text from a buffered chat completion, for audit
/// sinks that keep response content.
pub fn completion_text(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|text| text.to_string())
}

/// Flattens the prompt-bearing portion of a request body into plain text for
/// token estimation. Chat bodies contribute their message contents, legacy
/// completion bodies their `prompt`, embeddings their `input`.
pub fn prompt_text(kind: CallKind, body: &Value) -> Option<String> {
    match kind {
        CallKind::Chat => {
            let messages = body.get("messages")?.as_array()?;
            let mut out = String::new();
            for message in messages {
                match message.get("content") {
                    Some(Value::String(text)) => {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                if !out.is_empty() {
                                    out.push('\n');
                                }
                                out.push_str(text);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Some(out)
        }
        CallKind::Completions => match body.get("prompt") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        },
        CallKind::Embeddings => match body.get("input") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        },
        _ => None,
    }
}
