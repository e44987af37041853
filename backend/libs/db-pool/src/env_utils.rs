//! Environment variable parsing utilities
//!
//! Shared by the pool configuration and the worker configuration so every
//! setting is read the same way: trimmed, parsed, and defaulted without unwrap().

use std::str::FromStr;

fn read_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable with a default fallback
///
/// Missing, empty, or unparsable values yield `default`.
pub fn parse_env_with_default<T: FromStr>(key: &str, default: T) -> T {
    parse_env_optional(key).unwrap_or(default)
}

/// Parse an environment variable, returning None if missing or invalid
pub fn parse_env_optional<T: FromStr>(key: &str) -> Option<T> {
    read_trimmed(key).and_then(|v| v.parse().ok())
}

/// Parse an environment variable, falling back to `default` when unset or blank
///
/// A value that is present but unparsable is an error.
pub fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match read_trimmed(key) {
        Some(v) => v
            .parse()
            .map_err(|_| format!("Failed to parse environment variable {}", key)),
        None => Ok(default),
    }
}

/// Parse a required environment variable
///
/// Unlike [`parse_env_with_default`], an unparsable value is an error rather
/// than a silent fallback.
pub fn parse_env_required<T: FromStr>(key: &str) -> Result<T, String> {
    read_trimmed(key)
        .ok_or_else(|| format!("Environment variable {} not found", key))?
        .parse()
        .map_err(|_| format!("Failed to parse environment variable {}", key))
}
