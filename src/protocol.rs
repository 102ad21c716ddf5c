use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// One primitive instruction returned by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Done {
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    Press {
        keys: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    Write {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
    /// Legacy coordinate form.
    Click {
        x: i64,
        y: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<String>,
    },
}

impl Operation {
    pub fn thought(&self) -> Option<&str> {
        match self {
            Operation::Done { thought, .. }
            | Operation::Press { thought, .. }
            | Operation::Write { thought, .. }
            | Operation::Click { thought, .. } => thought.as_deref(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Operation::Done { .. })
    }

    /// Lowercase wire tag, as the model writes it.
    pub fn tag(&self) -> &'static str {
        match self {
            Operation::Done { .. } => "done",
            Operation::Press { .. } => "press",
            Operation::Write { .. } => "write",
            Operation::Click { .. } => "click",
        }
    }

    /// Structured payload recorded in the action log.
    pub fn details(&self) -> Value {
        let thought = self.thought().unwrap_or_default();
        match self {
            Operation::Done { summary, .. } => json!({ "thought": thought, "summary": summary }),
            Operation::Press { keys, .. } => json!({ "thought": thought, "keys": keys }),
            Operation::Write { content, .. } => json!({ "thought": thought, "content": content }),
            Operation::Click { x, y, .. } => json!({ "thought": thought, "x": x, "y": y }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("model response is not valid JSON: {0}")]
    Parse(String),
    #[error("operation {index}: {reason}")]
    Schema { index: usize, reason: String },
}

impl ProtocolError {
    fn schema(index: usize, reason: impl Into<String>) -> Self {
        ProtocolError::Schema { index, reason: reason.into() }
    }
}

const LABELED_FENCE: &str = "```json";
const FENCE: &str = "```";

/// Strips Markdown code fences and trims every line.
pub fn clean_response(raw: &str) -> String {
    let mut content = raw.trim();
    if let Some(rest) = content.strip_prefix(LABELED_FENCE) {
        content = rest.trim();
    } else if let Some(rest) = content.strip_prefix(FENCE) {
        content = rest.trim();
    }
    if let Some(rest) = content.strip_suffix(FENCE) {
        content = rest.trim();
    }
    content.lines().map(str::trim).collect::<Vec<_>>().join("\n")
}

/// Cleans `raw` and decodes it into a validated batch of operations.
pub fn parse_operations(raw: &str) -> Result<Vec<Operation>, ProtocolError> {
    parse_cleaned(&clean_response(raw))
}

/// Decodes text that already went through [`clean_response`].
pub fn parse_cleaned(cleaned: &str) -> Result<Vec<Operation>, ProtocolError> {
    let value: Value =
        serde_json::from_str(cleaned).map_err(|e| ProtocolError::Parse(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(ProtocolError::schema(
                0,
                format!("expected an array of operations, got {}", json_kind(&other)),
            ))
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| decode_operation(index, &item))
        .collect()
}

fn decode_operation(index: usize, v: &Value) -> Result<Operation, ProtocolError> {
    if !v.is_object() {
        return Err(ProtocolError::schema(
            index,
            format!("expected an object, got {}", json_kind(v)),
        ));
    }
    let kind = v
        .get("operation")
        .and_then(|x| x.as_str())
        .map(|s| s.trim().to_ascii_lowercase())
        .ok_or_else(|| ProtocolError::schema(index, "missing `operation` tag"))?;
    let thought = v
        .get("thought")
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty());

    let op = match kind.as_str() {
        "done" => Operation::Done {
            summary: required_str(index, v, "summary")?,
            thought,
        },
        "press" => Operation::Press {
            keys: required_keys(index, v)?,
            thought,
        },
        "write" => Operation::Write {
            content: required_str(index, v, "content")?,
            thought,
        },
        "click" => Operation::Click {
            x: required_coord(index, v, "x")?,
            y: required_coord(index, v, "y")?,
            thought,
        },
        other => return Err(ProtocolError::schema(index, format!("unknown operation `{other}`"))),
    };
    Ok(op)
}

fn required_str(index: usize, v: &Value, field: &str) -> Result<String, ProtocolError> {
    v.get(field)
        .and_then(|x| x.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ProtocolError::schema(index, format!("`{field}` must be a string")))
}

fn required_keys(index: usize, v: &Value) -> Result<Vec<String>, ProtocolError> {
    let keys = v
        .get("keys")
        .and_then(|x| x.as_array())
        .ok_or_else(|| ProtocolError::schema(index, "`keys` must be an array of strings"))?;
    let keys = keys
        .iter()
        .map(|k| k.as_str().map(|s| s.to_string()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ProtocolError::schema(index, "`keys` must only contain strings"))?;
    if keys.is_empty() {
        return Err(ProtocolError::schema(index, "`keys` must not be empty"));
    }
    Ok(keys)
}

// Models sometimes answer 100.0 for 100; anything non-finite or fractional is rejected.
fn required_coord(index: usize, v: &Value, field: &str) -> Result<i64, ProtocolError> {
    let raw = v
        .get(field)
        .ok_or_else(|| ProtocolError::schema(index, format!("missing `{field}`")))?;
    if let Some(n) = raw.as_i64() {
        return Ok(n);
    }
    match raw.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 => Ok(f as i64),
        _ => Err(ProtocolError::schema(index, format!("`{field}` must be an integer"))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
