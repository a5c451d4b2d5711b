use serde::{Deserialize, Deserializer};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Parse a loosely formatted timestamp.
///
/// Accepts RFC 3339 strings and integer epoch milliseconds. Anything
/// else yields `None` so callers can decide how to order it.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&chrono::Utc));
    }
    trimmed
        .parse::<i64>()
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
}

/// Return the first candidate that is present and not blank, trimmed.
pub fn first_non_blank<'a, I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// `true` when the identifier is absent or only whitespace.
pub fn is_blank(identifier: &str) -> bool {
    identifier.trim().is_empty()
}

/// Deserialize an optional identifier that may arrive as a JSON string
/// or number.
pub(crate) fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
