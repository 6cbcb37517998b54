use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::text::truncate_chars;

const MAX_PROGRESS_DELTA: u8 = 20;
const TITLE_FROM_TEXT_CHARS: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, alias = "task", alias = "need")]
    pub objective: String,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

/// A search the tool runtime performed during the iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub result_count: usize,
    pub answer: Option<String>,
}

/// Structured outcome of one collaborator reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationResult {
    pub thinking: String,
    pub activity: String,
    pub progress_delta: u8,
    pub output: String,
    pub spawn: Vec<SpawnRequest>,
    pub input_request: Option<String>,
    pub complete: bool,
    pub artifacts: Vec<ArtifactDraft>,
    pub findings: Vec<FindingDraft>,
    pub searches: Vec<SearchRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReply {
    Structured(IterationResult),
    /// Nothing in the reply decoded; carries the fallback result.
    Unparsed(IterationResult),
}

impl ParsedReply {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ParsedReply::Unparsed(_))
    }

    pub fn result(&self) -> &IterationResult {
        match self {
            ParsedReply::Structured(result) | ParsedReply::Unparsed(result) => result,
        }
    }

    pub fn into_result(self) -> IterationResult {
        match self {
            ParsedReply::Structured(result) | ParsedReply::Unparsed(result) => result,
        }
    }
}

/// Looks a field up under its canonical name, then its aliases.
fn field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| map.get(*name))
        .find(|value| !value.is_null())
}

/// Decodes one reply object field by field. A field of an unexpected shape
/// is dropped on its own instead of discarding the reply.
fn decode_reply(map: &Map<String, Value>) -> IterationResult {
    IterationResult {
        thinking: field(map, &["thinking", "reasoning"])
            .cloned()
            .map(value_to_text)
            .unwrap_or_default(),
        activity: field(map, &["activity", "currentActivity", "current_activity"])
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("Working")
            .to_string(),
        progress_delta: field(map, &["progress_delta", "progressDelta", "progress"])
            .map(to_delta)
            .unwrap_or(0),
        output: field(map, &["output", "result"])
            .cloned()
            .map(value_to_text)
            .unwrap_or_default(),
        spawn: list(map, &["spawn", "spawnAgents", "spawn_agents", "children"], to_spawn),
        input_request: field(map, &["input_request", "needsInput", "needs_input", "requestInput"])
            .cloned()
            .and_then(to_input_request),
        complete: field(map, &["complete", "isComplete", "done"])
            .map(to_bool)
            .unwrap_or(false),
        artifacts: list(map, &["artifacts"], |v| {
            to_titled(v).map(|(title, content)| ArtifactDraft { title, content })
        }),
        findings: list(map, &["findings"], |v| {
            to_titled(v).map(|(title, content)| FindingDraft { title, content })
        }),
        searches: Vec::new(),
    }
}

fn list<T>(map: &Map<String, Value>, names: &[&str], decode: impl Fn(&Value) -> Option<T>) -> Vec<T> {
    match field(map, names) {
        Some(Value::Array(items)) => items.iter().filter_map(decode).collect(),
        Some(single @ Value::Object(_)) => decode(single).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn to_spawn(value: &Value) -> Option<SpawnRequest> {
    match value {
        Value::String(objective) => Some(SpawnRequest {
            objective: objective.clone(),
            ..SpawnRequest::default()
        }),
        Value::Object(map) => Some(SpawnRequest {
            role: map.get("role").and_then(Value::as_str).map(str::to_string),
            objective: field(map, &["objective", "task", "need"])
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            context: map
                .get("context")
                .cloned()
                .map(value_to_text)
                .filter(|c| !c.is_empty()),
        }),
        _ => None,
    }
}

/// Accepts `{"title", "content"}` objects and bare strings.
fn to_titled(value: &Value) -> Option<(String, String)> {
    match value {
        Value::String(content) if !content.trim().is_empty() => {
            let first_line = content.lines().next().unwrap_or_default();
            Some((truncate_chars(first_line.trim(), TITLE_FROM_TEXT_CHARS), content.clone()))
        }
        Value::Object(map) => {
            let text = |key: &str| {
                map.get(key)
                    .cloned()
                    .map(value_to_text)
                    .unwrap_or_default()
            };
            Some((text("title"), text("content")))
        }
        _ => None,
    }
}

fn value_to_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn to_delta(value: &Value) -> u8 {
    let raw = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    raw.clamp(0.0, MAX_PROGRESS_DELTA as f64).round() as u8
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn to_input_request(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Object(map) => map
            .get("question")
            .or_else(|| map.get("prompt"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

/// Returns every top-level balanced `{...}` span in order of appearance.
///
/// Braces inside JSON string literals are ignored. A `{` that never balances
/// is skipped so later objects are still found.
fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(bytes, i) {
                spans.push(&text[i..=end]);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    spans
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses a collaborator reply, tolerating prose around the payload.
///
/// The last balanced object that decodes as JSON wins. When none does the
/// whole text becomes the output of an incomplete result.
pub fn parse_reply(text: &str, fallback_delta: u8) -> ParsedReply {
    for candidate in balanced_objects(text).into_iter().rev() {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if let Value::Object(map) = value {
            return ParsedReply::Structured(decode_reply(&map));
        }
    }

    ParsedReply::Unparsed(IterationResult {
        thinking: String::new(),
        activity: "Working".to_string(),
        progress_delta: fallback_delta.min(MAX_PROGRESS_DELTA),
        output: text.to_string(),
        complete: false,
        ..IterationResult::default()
    })
}
