//! REST transport: href builder, link pagination, value helpers.

mod client;
mod href;

#[cfg(test)]
mod tests;

pub use client::{Cluster, RestClient};
pub use href::{HrefBuilder, URL_MAX_FIELDS};

use serde_json::Value;

/// RFC 3339 timestamp to unix seconds.
pub fn rfc3339_to_unix(s: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.timestamp() as f64)
}

/// ISO-8601 duration (`P1DT2H3M4S`, `PT0.5S`, `P2W`) to seconds.
pub fn iso8601_duration_seconds(s: &str) -> Option<f64> {
    let rest = s.trim().strip_prefix('P')?;
    let mut seconds = 0.0;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_unit = false;
    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let n: f64 = number.parse().ok()?;
                number.clear();
                saw_unit = true;
                seconds += n * match (unit, in_time) {
                    ('Y', false) => 365.0 * 86400.0,
                    ('M', false) => 30.0 * 86400.0,
                    ('W', false) => 7.0 * 86400.0,
                    ('D', false) => 86400.0,
                    ('H', true) => 3600.0,
                    ('M', true) => 60.0,
                    ('S', true) => 1.0,
                    _ => return None,
                };
            }
        }
    }
    if !number.is_empty() || !saw_unit {
        return None;
    }
    Some(seconds)
}

/// Renders a JSON scalar as a label value. Arrays of scalars are joined
/// with commas; objects and null become empty.
pub fn value_to_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_label)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    }
}

/// Follows a dotted path such as `svm.name` or `ha.partners.0.name`.
pub fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
