//! `M:SS` time text ⇄ seconds.
//!
//! Parsing is forgiving on purpose: the user types into a free-form field and
//! every keystroke is parsed, so intermediate garbage must degrade to a
//! sensible number instead of an error.  The result is always clamped into
//! `[0, MAX_SECONDS]`.
//!
//! Normalisation (carrying `0:75` into `1:15`) is a separate step the UI
//! applies when the field loses focus.

use regex::Regex;
use std::sync::OnceLock;

/// Upper bound for any time value: 24 hours.
pub const MAX_SECONDS: f64 = 86_400.0;

fn leading_float_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?").expect("static regex"))
}

fn leading_int_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?\d+").expect("static regex"))
}

fn mmss_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+):(\d+)(\.\d+)?$").expect("static regex"))
}

/// Clamp a raw number of seconds into the valid range.  NaN becomes 0.
pub fn clamp_seconds(seconds: f64) -> f64 {
    if seconds.is_nan() {
        return 0.0;
    }
    seconds.clamp(0.0, MAX_SECONDS)
}

/// Render seconds as `M:SS`.  Sub-second precision is truncated, minutes are
/// not padded and may exceed 59.
pub fn format(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{}:{:02}", total / 60, total % 60)
}

/// Parse free-form time text into seconds.
///
/// - blank → 0
/// - all digits → that many seconds
/// - `M:SS` → `M*60 + SS` (negative minutes → 0, seconds may be fractional)
/// - anything else → leading float, or 0
pub fn parse(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return clamp_seconds(trimmed.parse::<f64>().unwrap_or(0.0));
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() == 2 {
        let minutes_str = parts[0].trim();
        if minutes_str.starts_with('-') {
            return 0.0;
        }
        let minutes = leading_int(minutes_str).unwrap_or(0.0).abs();
        let seconds = leading_float(parts[1].trim()).unwrap_or(0.0).max(0.0);
        return clamp_seconds(minutes * 60.0 + seconds);
    }

    clamp_seconds(leading_float(trimmed).unwrap_or(0.0))
}

/// Carry an overflowed seconds field into the minutes (`0:75` → `1:15`).
///
/// Only `M:SS`-shaped text is touched; everything else, including text whose
/// seconds field is already below 60, is returned unchanged.
pub fn normalize(text: &str) -> String {
    let trimmed = text.trim();
    let Some(caps) = mmss_re().captures(trimmed) else {
        return text.to_string();
    };

    let (Ok(minutes), Ok(whole_secs)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) else {
        return text.to_string();
    };
    if whole_secs < 60 {
        return text.to_string();
    }

    let fraction = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    let Some(minutes) = minutes.checked_add(whole_secs / 60) else {
        return text.to_string();
    };
    format!("{}:{:02}{}", minutes, whole_secs % 60, fraction)
}

fn leading_float(s: &str) -> Option<f64> {
    leading_float_re()
        .find(s)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn leading_int(s: &str) -> Option<f64> {
    leading_int_re()
        .find(s)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
