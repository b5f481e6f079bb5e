//! Field extraction from refresh responses.
//!
//! Paths address a JSON document with dotted field names and array indexes,
//! e.g. `data.access_token`, `tokens.0.value` or `tokens[0].value`. A leading
//! `$.` is accepted and ignored.

use super::RefreshError;
use serde_json::Value;

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Extracts a token (or any scalar) at `path` as a string.
pub fn extract_token(body: &str, path: &str) -> Result<String, RefreshError> {
    let document = parse_body(body, path)?;
    match lookup(&document, path)? {
        Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

/// Extracts a lifetime in seconds at `path`.
///
/// Accepts integers, floats (truncated) and numeric strings.
pub fn extract_expires_in(body: &str, path: &str) -> Result<i64, RefreshError> {
    let document = parse_body(body, path)?;
    let value = lookup(&document, path)?;

    let seconds = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    };

    seconds.ok_or_else(|| RefreshError::Extraction {
        path: path.to_string(),
        reason: format!("value {} is not a number", value),
    })
}

fn parse_body(body: &str, path: &str) -> Result<Value, RefreshError> {
    serde_json::from_str(body).map_err(|e| RefreshError::Extraction {
        path: path.to_string(),
        reason: format!("response is not valid JSON: {}", e),
    })
}

fn lookup<'v>(document: &'v Value, path: &str) -> Result<&'v Value, RefreshError> {
    let not_found = || RefreshError::Extraction {
        path: path.to_string(),
        reason: "path not found in response".to_string(),
    };

    let segments = parse_path(path).ok_or_else(|| RefreshError::Extraction {
        path: path.to_string(),
        reason: "malformed path".to_string(),
    })?;

    let mut current = document;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            // A numeric dot segment indexes into an array
            (Segment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            (Segment::Index(i), Value::Array(items)) => items.get(i),
            _ => None,
        }
        .ok_or_else(not_found)?;
    }

    if current.is_null() {
        return Err(not_found());
    }
    Ok(current)
}

fn parse_path(path: &str) -> Option<Vec<Segment<'_>>> {
    let path = path.trim();
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);
    if path.is_empty() {
        return None;
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut brackets) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            segments.push(Segment::Key(name));
        } else if brackets.is_empty() {
            return None;
        }

        while !brackets.is_empty() {
            let inner = brackets.strip_prefix('[')?;
            let close = inner.find(']')?;
            segments.push(Segment::Index(inner[..close].trim().parse().ok()?));
            brackets = &inner[close + 1..];
        }
    }
    Some(segments)
}
