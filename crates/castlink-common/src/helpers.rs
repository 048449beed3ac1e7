//! Common helper functions for castlink.

/// Reads a boolean flag from the environment.
///
/// Accepts `1`, `true`, `yes` and `on` (any case) as true; anything else set is
/// false, and an unset variable yields `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
