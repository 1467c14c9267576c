//! Tolerant boolean handling for NetAPI / vmadm payloads.
//!
//! The anti-spoofing toggles arrive as `true`, `"true"`, `"1"`, `1` and
//! friends depending on which side wrote them last. Deserialization
//! normalizes all of those; comparisons canonicalize absent to `false`.

use serde::{Deserialize, Deserializer};

/// Canonical view used in diffs: absent and null mean `false`.
pub fn truthy(value: Option<bool>) -> bool {
    value.unwrap_or(false)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(|v| coerce(&v)))
}

fn coerce(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}
