use std::fmt;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

/// Separates the tokens of consecutive axes.
pub const AXIS_SEPARATOR: &str = "_";
/// Separates the elements of a list-valued candidate.
pub const LIST_SEPARATOR: &str = "-";
/// Identifier of the single run produced by a grid without axes.
pub const BASE_RUN_ID: &str = "base";
/// Stands in for a candidate that would otherwise render as nothing.
pub const EMPTY_TOKEN: &str = "empty";

const UNSAFE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Deterministic, path-safe name of one combination. Doubles as the run
/// directory name and the results table index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the identifier for one combination, given in axis order.
pub fn build_run_id<'a, I>(values: I) -> RunId
where
    I: IntoIterator<Item = &'a Value>,
{
    let id = values
        .into_iter()
        .map(value_token)
        .collect::<Vec<_>>()
        .join(AXIS_SEPARATOR);
    if id.is_empty() {
        return RunId(BASE_RUN_ID.to_string());
    }
    if id.chars().all(|c| c == '.') {
        return RunId(id.replace('.', LIST_SEPARATOR));
    }
    RunId(id)
}

/// Token for a single candidate value. Never empty.
pub fn value_token(value: &Value) -> String {
    let token = match value {
        Value::Array(items) => items
            .iter()
            .map(value_token)
            .collect::<Vec<_>>()
            .join(LIST_SEPARATOR),
        Value::String(s) => sanitize(&strip_path(s)),
        Value::Object(_) => sanitize(&value.to_string()),
        other => sanitize(&other.to_string()),
    };
    if token.is_empty() {
        EMPTY_TOKEN.to_string()
    } else {
        token
    }
}

/// Reduces path-like strings to their file stem: `/data/glove.50d.txt` becomes
/// `glove.50d`. Extensions that start with a digit are kept, so `2-0.5` stays.
fn strip_path(s: &str) -> String {
    let has_separator = s.contains('/') || s.contains('\\');
    let path = Path::new(s);
    let has_alpha_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|e| e.chars().next())
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false);
    if !has_separator && !has_alpha_extension {
        return s.to_string();
    }
    let name = s
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or(s);
    let name_path = Path::new(name);
    let keep_extension = !name_path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|e| e.chars().next())
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false);
    if keep_extension {
        return name.to_string();
    }
    name_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_string()
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if UNSAFE_CHARS.contains(&c) || c.is_whitespace() || c.is_control() {
                '-'
            } else {
                c
            }
        })
        .collect()
}
