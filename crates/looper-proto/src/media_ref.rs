//! Canonical media identifiers and extraction from sharing links.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::ValidationError;

/// Length of a canonical identifier.
pub const MEDIA_REF_LEN: usize = 11;

/// An 11-character identifier drawn from `[A-Za-z0-9_-]`.
///
/// The only way to obtain one is through validation, so holding a `MediaRef`
/// proves the string is well-formed.  Deserialisation validates too, which
/// lets a corrupt persisted record fail on its own without poisoning the
/// collection it sits in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MediaRef(String);

impl MediaRef {
    /// Accept `s` only if it is exactly a canonical identifier.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if is_strict_id(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(ValidationError::InvalidMediaRef)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Watch-page URL the player resolves.
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MediaRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MediaRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if is_strict_id(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::InvalidMediaRef)
        }
    }
}

impl From<MediaRef> for String {
    fn from(value: MediaRef) -> Self {
        value.0
    }
}

fn is_strict_id(s: &str) -> bool {
    s.len() == MEDIA_REF_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Sharing-link shapes, tried in order.  Each capture must be followed by a
/// non-identifier character or the end of input so a 12-character id is not
/// silently truncated to 11.
fn link_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // watch?v=, youtu.be/<id>, /embed/<id>
            r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)",
            // v= anywhere in the query of a youtube.com URL
            r"youtube\.com/.*[?&]v=([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

/// Pull a canonical identifier out of a literal id or a sharing link.
///
/// Returns `None` when nothing validates; raw input is never passed through.
pub fn extract(input: &str) -> Option<MediaRef> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_strict_id(trimmed) {
        return Some(MediaRef(trimmed.to_string()));
    }

    link_patterns().iter().find_map(|re| {
        re.captures(trimmed)
            .and_then(|caps| caps.get(1))
            .and_then(|m| MediaRef::parse(m.as_str()).ok())
    })
}
