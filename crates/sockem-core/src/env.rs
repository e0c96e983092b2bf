//! Environment variable utilities
//!
//! Runtime sizing knobs (`SOCKEM_*`) are read through these helpers so a
//! malformed value falls back to the compiled default instead of failing.
//!
//! ```ignore
//! use sockem_core::env::{env_get, env_get_bool};
//!
//! let sockets: usize = env_get("SOCKEM_DGRAM_SOCKETS", 64);
//! let verbose = env_get_bool("SOCKEM_VERBOSE", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
///
/// `None` if unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
