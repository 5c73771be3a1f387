//! Step configuration helpers
//!
//! Reading typed values out of a step's configuration map, `${name}`
//! placeholder substitution, and turning leftover keys into CLI flags.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use trainyard_core::domain::workflow::WorkflowStep;

use crate::error::StepError;

/// Renders a configuration value the way it appears on a command line
pub fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replaces every `${name}` in `text` with its value from `vars`
pub fn substitute(text: &str, vars: &HashMap<String, String>) -> Result<String, StepError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            StepError::Configuration(format!("unterminated placeholder in '{}'", text))
        })?;
        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| {
            StepError::Configuration(format!("unknown placeholder '${{{}}}'", name))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// A configuration value as a substituted string, if present
pub fn optional_string(
    step: &WorkflowStep,
    key: &str,
    vars: &HashMap<String, String>,
) -> Result<Option<String>, StepError> {
    match step.configuration.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => substitute(&value_to_string(value), vars).map(Some),
    }
}

pub fn required_string(
    step: &WorkflowStep,
    key: &str,
    vars: &HashMap<String, String>,
) -> Result<String, StepError> {
    optional_string(step, key, vars)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            StepError::Configuration(format!(
                "step '{}' requires configuration key '{}'",
                step.name, key
            ))
        })
}

/// Reads a boolean flag; accepts `true`/`false` as booleans or strings
pub fn bool_flag(step: &WorkflowStep, key: &str) -> Result<bool, StepError> {
    match step.configuration.get(key) {
        None | Some(JsonValue::Null) => Ok(false),
        Some(JsonValue::Bool(b)) => Ok(*b),
        Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
        Some(JsonValue::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
        Some(other) => Err(StepError::Configuration(format!(
            "step '{}': '{}' must be a boolean, got {}",
            step.name, key, other
        ))),
    }
}

/// The flag a configuration key turns into: leading dashes stripped,
/// lowercased
pub fn flag_name(key: &str) -> String {
    key.trim_start_matches('-').to_ascii_lowercase()
}

/// Configuration keys that name one of `flags`, however they are spelled
pub fn keys_naming<'a>(step: &'a WorkflowStep, flags: &[&str]) -> Vec<&'a str> {
    let mut keys: Vec<&str> = step
        .configuration
        .keys()
        .filter(|k| flags.contains(&flag_name(k).as_str()))
        .map(String::as_str)
        .collect();
    keys.sort();
    keys
}

/// Turns configuration keys into `--key value` pairs
///
/// Keys are emitted in sorted order so the command line is stable. Keys
/// whose flag name is in `skip` are consumed elsewhere and left out; a null
/// value yields a bare `--key`.
pub fn build_flags(
    step: &WorkflowStep,
    vars: &HashMap<String, String>,
    skip: &[&str],
) -> Result<Vec<String>, StepError> {
    let mut keys: Vec<&String> = step
        .configuration
        .keys()
        .filter(|k| !skip.contains(&flag_name(k).as_str()))
        .collect();
    keys.sort();

    let mut flags = Vec::with_capacity(keys.len() * 2);
    for key in keys {
        flags.push(format!("--{}", key.trim_start_matches('-')));
        if let Some(value) = optional_string(step, key, vars)? {
            flags.push(value);
        }
    }
    Ok(flags)
}
