//! Output-point helpers: truncation, type messages, alert-context encoding.

use serde_json::{json, Value};

use crate::script::{value_type_name, FailureKind, ScriptFailure};
use crate::unit::Unit;

/// Largest serialized alert context, in characters.
pub const MAX_ALERT_CONTEXT_LENGTH: usize = 204_800;

/// Prefix of the dedup key used when no usable dedup or title exists.
pub const DEFAULT_DEDUP_PREFIX: &str = "defaultDedupString:";

pub fn default_dedup(unit_id: &str) -> String {
    format!("{}{}", DEFAULT_DEDUP_PREFIX, unit_id)
}

/// Cut `value` to `max` characters, ending in `suffix`. Values at or below
/// `max` are returned unchanged.
pub fn truncate(value: String, max: usize, suffix: &str) -> String {
    if value.chars().count() <= max {
        return value;
    }
    let keep = max.saturating_sub(suffix.chars().count());
    let mut truncated: String = value.chars().take(keep).collect();
    truncated.push_str(suffix);
    truncated
}

/// `TypeError` for an entry point that returned the wrong kind of value.
pub fn wrong_type(unit: &Unit, point: &str, value: &Value, expected: &str) -> ScriptFailure {
    ScriptFailure::new(
        FailureKind::Type,
        format!(
            "{} [{}] function [{}] returned [{}], expected [{}]",
            unit.kind(),
            unit.id(),
            point,
            value_type_name(value),
            expected
        ),
    )
}

/// `TypeError` for a destinations entry point that did not return a list.
pub fn not_a_list(unit: &Unit, point: &str, value: &Value) -> ScriptFailure {
    ScriptFailure::new(
        FailureKind::Type,
        format!(
            "{} [{}] function [{}] returned [{}], expected a list",
            unit.kind(),
            unit.id(),
            point,
            value_type_name(value)
        ),
    )
}

/// Compact JSON for an alert context map, or the size failure when it is
/// too large.
pub fn encode_alert_context(value: &Value) -> Result<String, ScriptFailure> {
    let encoded = value.to_string();
    let size = encoded.chars().count();
    if size > MAX_ALERT_CONTEXT_LENGTH {
        return Err(ScriptFailure::new(
            FailureKind::Validation,
            format!(
                "alert_context size is [{}] characters, bigger than maximum of [{}] characters",
                size, MAX_ALERT_CONTEXT_LENGTH
            ),
        ));
    }
    Ok(encoded)
}

/// `{"_error": message}` stored in place of an unusable alert context.
pub fn alert_context_error(message: &str) -> String {
    json!({ "_error": message }).to_string()
}

/// Destination references as strings; non-string items use their JSON text.
pub fn destination_references(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}
