use std::time::Duration;

use crate::error::ConfigError;

/// Parse a duration such as `500ms`, `5s`, `2m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| format!("'{}' is not a duration (e.g. 500ms, 5s, 1m)", input))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("'{}' is too long", input)),
        other => Err(format!("unknown duration unit '{}' (use ms, s or m)", other)),
    }
}

/// Trimmed value of a required setting, or `MissingRequired`.
pub(crate) fn required(key: &str, value: Option<&str>, hint: &str) -> Result<String, ConfigError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        }),
    }
}

/// Drop blank entries left by trailing or doubled commas.
pub(crate) fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
