//! Extra filters available to child templates

use minijinja::Value;

/// Returns `fallback` when the value is undefined, none or an empty string
///
/// Usage: `{{ instance.spec.hostname | or_default("x") }}`
pub fn or_default(value: Value, fallback: Value) -> Value {
    let empty = value.as_str().map(str::is_empty).unwrap_or(false);
    if value.is_undefined() || value.is_none() || empty {
        fallback
    } else {
        value
    }
}

/// Turns an image tag into something usable as a DNS label or object name
///
/// Usage: `{{ instance.spec.version | dns_label }}`
pub fn dns_label(value: &str) -> String {
    let mut out: String = value
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    out.truncate(63);
    out.trim_matches('-').to_string()
}
