//! Request body templating.
//!
//! Templates use `{{.Name}}` placeholders. The context is the credential's
//! custom variables with `RefreshToken` set to its current refresh token.
//! A placeholder naming an unknown variable fails the render.

use super::RefreshError;
use crate::credentials::CredentialRecord;
use serde_json::{Map, Value};

/// Reserved variable holding the credential's current refresh token.
pub const REFRESH_TOKEN_VAR: &str = "RefreshToken";

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Renders the credential's body template against its variable context.
pub fn render_template(template: &str, credential: &CredentialRecord) -> Result<String, RefreshError> {
    let context = build_context(credential)?;
    render(template, &context)
}

fn build_context(credential: &CredentialRecord) -> Result<Map<String, Value>, RefreshError> {
    let mut context = if credential.custom_variables.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(&credential.custom_variables) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(RefreshError::Config(
                    "custom variables must be a JSON object".to_string(),
                ))
            }
            Err(e) => {
                return Err(RefreshError::Config(format!(
                    "failed to parse custom variables: {}",
                    e
                )))
            }
        }
    };

    context.insert(
        REFRESH_TOKEN_VAR.to_string(),
        Value::String(credential.current_refresh_token.clone()),
    );
    Ok(context)
}

fn render(template: &str, context: &Map<String, Value>) -> Result<String, RefreshError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open.find(CLOSE).ok_or_else(|| {
            RefreshError::Config(format!(
                "template syntax error: unclosed action at byte {}",
                template.len() - rest.len() + start
            ))
        })?;

        let name = parse_action(&after_open[..end])?;
        let value = context.get(name).ok_or_else(|| {
            RefreshError::Config(format!("template references undefined variable '{}'", name))
        })?;
        push_value(&mut out, value);

        rest = &after_open[end + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Accepts `.Identifier` with optional surrounding whitespace.
fn parse_action(action: &str) -> Result<&str, RefreshError> {
    let trimmed = action.trim();
    let name = trimmed.strip_prefix('.').ok_or_else(|| {
        RefreshError::Config(format!(
            "template syntax error: unsupported action '{{{{{}}}}}'",
            trimmed
        ))
    })?;

    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_');
    if !valid {
        return Err(RefreshError::Config(format!(
            "template syntax error: invalid variable name '{}'",
            name
        )));
    }
    Ok(name)
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => out.push_str(&other.to_string()),
    }
}
