//! Persisted record types and their validators.
//!
//! Every record has a `*Draft` twin with all fields optional.  Drafts come
//! from two places: the session building a record to save, and JSON read back
//! from the store.  Both go through the same `validate()` so a record that
//! could not have been written is also never returned by a load.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;
use crate::media_ref::MediaRef;
use crate::timecode::MAX_SECONDS;

pub const MAX_LOOPS: u32 = 10_000;
pub const MIN_PLAYBACK_RATE: f64 = 0.25;
pub const MAX_PLAYBACK_RATE: f64 = 2.0;
pub const PLAYBACK_RATE_STEP: f64 = 0.05;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_AUTHOR_LEN: usize = 100;
pub const MAX_URL_LEN: usize = 500;
pub const MAX_THUMBNAIL_LEN: usize = 500;
pub const MAX_ID_LEN: usize = 100;
pub const MAX_PLAYLIST_NAME_LEN: usize = 50;

pub const MAX_RECENT_ITEMS: usize = 100;
pub const MAX_LOOP_CONFIGS: usize = 100;
pub const MAX_PLAYLISTS: usize = 100;
pub const MAX_PLAYLIST_ENTRIES: usize = 100;

// ── Records ──────────────────────────────────────────────────────────────────

/// A saved loop segment.  Playlist entries are copies of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub id: String,
    pub media_ref: MediaRef,
    pub source_url: String,
    pub start_time: f64,
    pub end_time: f64,
    pub target_loop_count: u32,
    pub playback_rate: f64,
    pub title: String,
    pub author: String,
    pub thumbnail_url: String,
    pub created_at: DateTime<Utc>,
}

/// One slot in an ordered playlist.  Entries are snapshots: editing or
/// deleting the saved loop they were copied from does not affect them.
pub type PlaylistEntry = LoopConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentItem {
    pub media_ref: MediaRef,
    pub title: String,
    pub author: String,
    pub thumbnail_url: String,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultItem {
    pub media_ref: MediaRef,
    pub source_url: String,
    pub title: String,
    pub author: String,
    pub thumbnail_url: String,
    pub set_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPlaylist {
    pub id: String,
    pub name: String,
    pub entries: Vec<PlaylistEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Title/author/thumbnail as returned by a metadata lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub author: String,
    pub thumbnail_url: String,
}

impl MediaMetadata {
    /// Stand-in used when the lookup fails or times out.
    pub fn placeholder(media: &MediaRef) -> Self {
        Self {
            title: format!("Video {}", media),
            ..Self::default()
        }
    }

    /// Apply the same truncation and https-only rules the records use.
    pub fn sanitized(self) -> Self {
        Self {
            title: clean_text(&self.title, MAX_TITLE_LEN),
            author: clean_text(&self.author, MAX_AUTHOR_LEN),
            thumbnail_url: clean_thumbnail(&self.thumbnail_url),
        }
    }
}

// ── Drafts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfigDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub target_loop_count: Option<i64>,
    #[serde(default)]
    pub playback_rate: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub thumbnail_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentItemDraft {
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub thumbnail_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultItemDraft {
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub thumbnail_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub set_at: Option<DateTime<Utc>>,
}

/// Playlist as read from storage.  Entries stay raw so one bad entry can be
/// dropped without losing the playlist.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPlaylistDraft {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entries: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Soft field: a value of the wrong type reads as absent instead of failing
/// the whole record.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

// ── Validators ───────────────────────────────────────────────────────────────

impl LoopConfigDraft {
    pub fn validate(self) -> Result<LoopConfig, ValidationError> {
        let media_ref = MediaRef::parse(
            self.media_ref
                .as_deref()
                .ok_or(ValidationError::MissingField("mediaRef"))?,
        )?;
        let start_time = self
            .start_time
            .ok_or(ValidationError::MissingField("startTime"))?;
        let end_time = self
            .end_time
            .ok_or(ValidationError::MissingField("endTime"))?;
        validate_segment(start_time, end_time)?;

        let target = self
            .target_loop_count
            .ok_or(ValidationError::MissingField("targetLoopCount"))?;
        let target_loop_count = validate_target_loops(target)?;
        let playback_rate = validate_playback_rate(self.playback_rate.unwrap_or(1.0))?;

        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => truncate(id, MAX_ID_LEN),
            _ => generate_loop_id(&media_ref),
        };
        let source_url = match self.source_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => truncate(url, MAX_URL_LEN),
            _ => media_ref.watch_url(),
        };

        Ok(LoopConfig {
            id,
            media_ref,
            source_url,
            start_time,
            end_time,
            target_loop_count,
            playback_rate,
            title: clean_text(self.title.as_deref().unwrap_or(""), MAX_TITLE_LEN),
            author: clean_text(self.author.as_deref().unwrap_or(""), MAX_AUTHOR_LEN),
            thumbnail_url: clean_thumbnail(self.thumbnail_url.as_deref().unwrap_or("")),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

impl From<LoopConfig> for LoopConfigDraft {
    fn from(c: LoopConfig) -> Self {
        Self {
            id: Some(c.id),
            media_ref: Some(c.media_ref.into()),
            source_url: Some(c.source_url),
            start_time: Some(c.start_time),
            end_time: Some(c.end_time),
            target_loop_count: Some(i64::from(c.target_loop_count)),
            playback_rate: Some(c.playback_rate),
            title: Some(c.title),
            author: Some(c.author),
            thumbnail_url: Some(c.thumbnail_url),
            created_at: Some(c.created_at),
        }
    }
}

impl RecentItemDraft {
    pub fn validate(self) -> Result<RecentItem, ValidationError> {
        let media_ref = MediaRef::parse(
            self.media_ref
                .as_deref()
                .ok_or(ValidationError::MissingField("mediaRef"))?,
        )?;
        let title = clean_text(self.title.as_deref().unwrap_or(""), MAX_TITLE_LEN);
        let title = if title.is_empty() {
            MediaMetadata::placeholder(&media_ref).title
        } else {
            title
        };
        Ok(RecentItem {
            media_ref,
            title,
            author: clean_text(self.author.as_deref().unwrap_or(""), MAX_AUTHOR_LEN),
            thumbnail_url: clean_thumbnail(self.thumbnail_url.as_deref().unwrap_or("")),
            last_used_at: self.last_used_at.unwrap_or_else(Utc::now),
        })
    }
}

impl From<RecentItem> for RecentItemDraft {
    fn from(r: RecentItem) -> Self {
        Self {
            media_ref: Some(r.media_ref.into()),
            title: Some(r.title),
            author: Some(r.author),
            thumbnail_url: Some(r.thumbnail_url),
            last_used_at: Some(r.last_used_at),
        }
    }
}

impl DefaultItemDraft {
    pub fn validate(self) -> Result<DefaultItem, ValidationError> {
        let media_ref = MediaRef::parse(
            self.media_ref
                .as_deref()
                .ok_or(ValidationError::MissingField("mediaRef"))?,
        )?;
        let source_url = match self.source_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => truncate(url, MAX_URL_LEN),
            _ => media_ref.watch_url(),
        };
        Ok(DefaultItem {
            media_ref,
            source_url,
            title: clean_text(self.title.as_deref().unwrap_or(""), MAX_TITLE_LEN),
            author: clean_text(self.author.as_deref().unwrap_or(""), MAX_AUTHOR_LEN),
            thumbnail_url: clean_thumbnail(self.thumbnail_url.as_deref().unwrap_or("")),
            set_at: self.set_at.unwrap_or_else(Utc::now),
        })
    }
}

impl From<DefaultItem> for DefaultItemDraft {
    fn from(d: DefaultItem) -> Self {
        Self {
            media_ref: Some(d.media_ref.into()),
            source_url: Some(d.source_url),
            title: Some(d.title),
            author: Some(d.author),
            thumbnail_url: Some(d.thumbnail_url),
            set_at: Some(d.set_at),
        }
    }
}

impl SavedPlaylistDraft {
    /// Validate the playlist, dropping entries that fail their own
    /// validation.  Returns the playlist and the number of dropped entries.
    pub fn validate(self) -> Result<(SavedPlaylist, usize), ValidationError> {
        let name = validate_playlist_name(
            self.name
                .as_deref()
                .ok_or(ValidationError::MissingField("name"))?,
        )?;
        let (entries, dropped) = validate_entries(self.entries);
        let id = match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => truncate(id, MAX_ID_LEN),
            _ => generate_playlist_id(),
        };
        Ok((
            SavedPlaylist {
                id,
                name,
                entries,
                created_at: self.created_at.unwrap_or_else(Utc::now),
                updated_at: self.updated_at,
            },
            dropped,
        ))
    }
}

/// Validate raw entries one by one, keep at most `MAX_PLAYLIST_ENTRIES`.
pub fn validate_entries(raw: Vec<serde_json::Value>) -> (Vec<PlaylistEntry>, usize) {
    let total = raw.len();
    let entries: Vec<PlaylistEntry> = raw
        .into_iter()
        .filter_map(|v| serde_json::from_value::<LoopConfigDraft>(v).ok())
        .filter_map(|d| d.validate().ok())
        .take(MAX_PLAYLIST_ENTRIES)
        .collect();
    let dropped = total - entries.len();
    (entries, dropped)
}

pub fn validate_segment(start: f64, end: f64) -> Result<(), ValidationError> {
    if !start.is_finite() || !(0.0..=MAX_SECONDS).contains(&start) {
        return Err(ValidationError::StartOutOfRange);
    }
    if !end.is_finite() || end > MAX_SECONDS {
        return Err(ValidationError::EndOutOfRange);
    }
    if end <= start {
        return Err(ValidationError::EndNotAfterStart);
    }
    Ok(())
}

pub fn validate_target_loops(count: i64) -> Result<u32, ValidationError> {
    if (1..=i64::from(MAX_LOOPS)).contains(&count) {
        Ok(count as u32)
    } else {
        Err(ValidationError::LoopCountOutOfRange { max: MAX_LOOPS })
    }
}

pub fn validate_playback_rate(rate: f64) -> Result<f64, ValidationError> {
    if rate.is_finite() && (MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&rate) {
        Ok(rate)
    } else {
        Err(ValidationError::RateOutOfRange {
            min: MIN_PLAYBACK_RATE,
            max: MAX_PLAYBACK_RATE,
        })
    }
}

/// Round a valid rate to the nearest 0.05 step.
pub fn snap_playback_rate(rate: f64) -> f64 {
    let snapped = (rate / PLAYBACK_RATE_STEP).round() * PLAYBACK_RATE_STEP;
    // Strip float noise so 1.1500000000000001 reads back as 1.15.
    ((snapped * 100.0).round() / 100.0).clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
}

pub fn validate_playlist_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = clean_text(name, MAX_PLAYLIST_NAME_LEN);
    if trimmed.is_empty() {
        Err(ValidationError::EmptyName)
    } else {
        Ok(trimmed)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// `<mediaRef>-<unix millis>-<4 hex>`
pub fn generate_loop_id(media: &MediaRef) -> String {
    format!(
        "{}-{}-{:04x}",
        media,
        Utc::now().timestamp_millis(),
        rand::thread_rng().gen::<u16>()
    )
}

/// `setlist-<unix millis>-<4 hex>`
pub fn generate_playlist_id() -> String {
    format!(
        "setlist-{}-{:04x}",
        Utc::now().timestamp_millis(),
        rand::thread_rng().gen::<u16>()
    )
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Trim, drop control characters, cap length.
fn clean_text(s: &str, max_chars: usize) -> String {
    let cleaned: String = s.trim().chars().filter(|c| !c.is_control()).collect();
    truncate(cleaned.trim(), max_chars)
}

/// Keep a thumbnail only if it is an https URL with a host that fits the
/// length limit.  Anything else is blanked rather than truncated into a
/// broken link.
fn clean_thumbnail(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || s.chars().count() > MAX_THUMBNAIL_LEN {
        return String::new();
    }
    match url::Url::parse(s) {
        Ok(u) if u.scheme() == "https" && u.host_str().is_some() => s.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(start: f64, end: f64) -> LoopConfigDraft {
        LoopConfigDraft {
            media_ref: Some("dQw4w9WgXcQ".into()),
            start_time: Some(start),
            end_time: Some(end),
            target_loop_count: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_loop_config_defaults() {
        let c = draft(0.0, 10.0).validate().unwrap();
        assert_eq!(c.playback_rate, 1.0);
        assert!(c.id.starts_with("dQw4w9WgXcQ-"));
        assert_eq!(c.source_url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(c.title, "");
    }

    #[test]
    fn test_loop_config_bounds() {
        assert_eq!(
            draft(10.0, 10.0).validate().unwrap_err(),
            ValidationError::EndNotAfterStart
        );
        assert_eq!(
            draft(-1.0, 10.0).validate().unwrap_err(),
            ValidationError::StartOutOfRange
        );
        assert_eq!(
            draft(0.0, 86_401.0).validate().unwrap_err(),
            ValidationError::EndOutOfRange
        );
        assert!(draft(0.0, MAX_SECONDS).validate().is_ok());

        let mut d = draft(0.0, 10.0);
        d.target_loop_count = Some(0);
        assert!(d.validate().is_err());
        let mut d = draft(0.0, 10.0);
        d.target_loop_count = Some(10_001);
        assert!(d.validate().is_err());
        let mut d = draft(0.0, 10.0);
        d.playback_rate = Some(2.5);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_soft_fields_tolerate_wrong_types() {
        let raw = json!({
            "mediaRef": "dQw4w9WgXcQ",
            "startTime": 1.0,
            "endTime": 2.0,
            "targetLoopCount": 2,
            "title": 42,
            "createdAt": "yesterday",
            "thumbnailUrl": "http://insecure.example/x.jpg"
        });
        let c = serde_json::from_value::<LoopConfigDraft>(raw)
            .unwrap()
            .validate()
            .unwrap();
        assert_eq!(c.title, "");
        assert_eq!(c.thumbnail_url, "");
    }

    #[test]
    fn test_strings_truncated() {
        let mut d = draft(0.0, 10.0);
        d.title = Some("x".repeat(300));
        d.author = Some("y".repeat(300));
        d.thumbnail_url = Some(format!("https://i.example.com/{}", "z".repeat(600)));
        let c = d.validate().unwrap();
        assert_eq!(c.title.chars().count(), MAX_TITLE_LEN);
        assert_eq!(c.author.chars().count(), MAX_AUTHOR_LEN);
        assert_eq!(c.thumbnail_url, "");
    }

    #[test]
    fn test_playlist_drops_bad_entries() {
        let good = serde_json::to_value(draft(0.0, 5.0).validate().unwrap()).unwrap();
        let bad = json!({"mediaRef": "dQw4w9WgXcQ", "startTime": 5, "endTime": 5, "targetLoopCount": 1});
        let d = SavedPlaylistDraft {
            name: Some("  Warmups  ".into()),
            entries: vec![good, bad, json!("junk")],
            ..Default::default()
        };
        let (p, dropped) = d.validate().unwrap();
        assert_eq!(p.name, "Warmups");
        assert_eq!(p.entries.len(), 1);
        assert_eq!(dropped, 2);
        assert!(p.id.starts_with("setlist-"));
    }

    #[test]
    fn test_playlist_name_rules() {
        assert_eq!(
            validate_playlist_name("   ").unwrap_err(),
            ValidationError::EmptyName
        );
        assert_eq!(
            validate_playlist_name(&"n".repeat(80)).unwrap().len(),
            MAX_PLAYLIST_NAME_LEN
        );
    }

    #[test]
    fn test_snap_playback_rate() {
        assert_eq!(snap_playback_rate(1.0), 1.0);
        assert_eq!(snap_playback_rate(1.13), 1.15);
        assert_eq!(snap_playback_rate(0.26), 0.25);
        assert_eq!(snap_playback_rate(1.99), 2.0);
    }

    #[test]
    fn test_recent_placeholder_title() {
        let r = RecentItemDraft {
            media_ref: Some("dQw4w9WgXcQ".into()),
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(r.title, "Video dQw4w9WgXcQ");
    }
}
