//! Duration strings for timeout options
//!
//! Timeout values in chain descriptions use the compact `1m30s` form:
//! one or more decimal numbers, each with a unit from `ns`, `us`/`µs`,
//! `ms`, `s`, `m`, `h`, summed left to right. A bare `0` is allowed.

use crate::error::{Result, SockchainError};
use std::time::Duration;

/// Parse a duration string such as `300ms`, `1.5h` or `2h45m`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(SockchainError::Config("empty duration".to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0.0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let (value, after_number) = take_number(rest)
            .ok_or_else(|| SockchainError::Config(format!("invalid duration `{s}`")))?;
        let (scale, after_unit) = take_unit(after_number)
            .ok_or_else(|| SockchainError::Config(format!("unknown unit in duration `{s}`")))?;
        total += value * scale;
        rest = after_unit;
    }

    if !total.is_finite() || total < 0.0 {
        return Err(SockchainError::Config(format!("invalid duration `{s}`")));
    }

    Ok(Duration::from_secs_f64(total))
}

/// Consume a decimal number with optional fraction from the front of
/// `s`, returning its value and the remainder.
fn take_number(s: &str) -> Option<(f64, &str)> {
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let mut end = digits;
    if s[end..].starts_with('.') {
        let frac = s[end + 1..]
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len() - end - 1);
        if digits == 0 && frac == 0 {
            return None;
        }
        end += 1 + frac;
    } else if digits == 0 {
        return None;
    }
    let value: f64 = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

/// Consume a unit suffix, returning its scale in seconds and the
/// remainder.
fn take_unit(s: &str) -> Option<(f64, &str)> {
    for (unit, scale) in [
        ("ns", 1e-9),
        ("us", 1e-6),
        ("µs", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
    ] {
        if let Some(rest) = s.strip_prefix(unit) {
            return Some((scale, rest));
        }
    }
    None
}
