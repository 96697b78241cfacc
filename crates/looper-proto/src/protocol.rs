use std::fmt;

use serde::{Deserialize, Serialize};

use crate::media_ref::MediaRef;
use crate::records::{DefaultItem, LoopConfig, PlaylistEntry, RecentItem, SavedPlaylist};

/// Requests accepted by `POST /api/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    // media
    LoadMedia { input: String },
    LoadRecent { media_ref: String },
    LoadDefault,
    LoadLoopConfig { id: String },

    // segment / settings
    /// Free-form time text.  `commit` marks the end of editing, which also
    /// normalises the text (`0:75` → `1:15`).
    SetStart {
        text: String,
        #[serde(default)]
        commit: bool,
    },
    SetEnd {
        text: String,
        #[serde(default)]
        commit: bool,
    },
    CaptureStart,
    CaptureEnd,
    SetTargetLoops { count: i64 },
    SetPlaybackRate { rate: f64 },
    SetVolume { volume: i64 },

    // loop control
    StartLoop,
    PauseLoop,
    ToggleLoop,
    ResetLoop,
    ResetConfiguration,

    // storage
    SaveLoopConfig,
    DeleteLoopConfig { id: String },
    DeleteRecent { media_ref: String },
    SetDefault,
    ClearDefault,

    // playlists
    SavePlaylist { name: String },
    UpdatePlaylist { id: String, name: String },
    LoadPlaylist { id: String },
    DeletePlaylist { id: String },
    NewPlaylist,
    AddPlaylistEntry {
        config_id: String,
        #[serde(default)]
        index: Option<usize>,
    },
    RemovePlaylistEntry { index: usize },
    MovePlaylistEntry { from: usize, to: usize },
    PlayPlaylist,
    StopPlaylist,

    // queries
    GetState,
    ListRecent,
    GetDefault,
    ListLoopConfigs,
    ListPlaylists,
}

/// Responses to a `Command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply")]
pub enum Reply {
    State { data: SessionState },
    Recent { items: Vec<RecentItem>, dropped: usize },
    Default { item: Option<DefaultItem> },
    LoopConfigs { items: Vec<LoopConfig>, dropped: usize },
    Playlists { items: Vec<SavedPlaylist>, dropped: usize },
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Category of a failed command, so clients can tell a bad field from a
/// player hiccup without parsing the message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    PlayerOperation,
    PersistenceValidation,
    DuplicateName,
    NotFound,
    ExternalLookup,
    InvalidState,
}

// ── Session snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LoopState {
    /// No media ready.
    #[default]
    Idle,
    /// Media ready, segment not running.
    Armed,
    Looping,
    Paused,
    /// Target loop count reached; the player is paused.
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state")]
pub enum PlaylistState {
    #[default]
    Idle,
    Playing {
        index: usize,
    },
    /// Entry `index` has ended; the next one starts when `remaining` hits 0.
    Countdown {
        index: usize,
        remaining: u32,
    },
    Finished,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopState::Idle => "no media is ready",
            LoopState::Armed => "armed",
            LoopState::Looping => "looping",
            LoopState::Paused => "paused",
            LoopState::Completed => "completed",
        })
    }
}

impl fmt::Display for PlaylistState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaylistState::Idle => f.write_str("the set list is stopped"),
            PlaylistState::Playing { index } => write!(f, "playing set list entry {}", index + 1),
            PlaylistState::Countdown { remaining, .. } => {
                write!(f, "the next set list entry starts in {}s", remaining)
            }
            PlaylistState::Finished => f.write_str("the set list is finished"),
        }
    }
}

impl PlaylistState {
    /// Index of the entry that is playing or has just finished.
    pub fn current_index(&self) -> Option<usize> {
        match self {
            PlaylistState::Playing { index } | PlaylistState::Countdown { index, .. } => {
                Some(*index)
            }
            PlaylistState::Idle | PlaylistState::Finished => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current_index().is_some()
    }
}

/// Which controller currently owns the player.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Loop,
    Playlist,
}

/// Health of the player process as observed by the session.
///
/// Transitions:
///   Absent -> Running -> Dead
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlayerHealth {
    /// No player attached (before first use, or it failed to start).
    #[default]
    Absent,
    /// IPC responding normally.
    Running,
    /// Process exited or IPC closed.
    Dead,
}

impl PlayerHealth {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, PlayerHealth::Dead)
    }
}

/// What the loop form shows.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoopStatus {
    pub state: LoopState,
    pub media_ref: Option<MediaRef>,
    pub source_url: Option<String>,
    /// Text exactly as last entered (or normalised on commit).
    pub start_text: String,
    pub end_text: String,
    pub start_secs: f64,
    pub end_secs: f64,
    pub target_loops: u32,
    pub playback_rate: f64,
    pub duration_secs: Option<f64>,
    pub position_secs: Option<f64>,
    /// `M:SS` of `position_secs`.
    pub position_text: String,
    pub loops_completed: u32,
    /// Position within the segment, 0–100, while looping.
    pub segment_progress: f64,
    /// `loops_completed / target_loops`, 0–100.
    pub overall_progress: u32,
    pub validation_error: Option<String>,
    pub can_start: bool,
    pub notice: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlaylistStatus {
    pub state: PlaylistState,
    pub entries: Vec<PlaylistEntry>,
    /// Saved playlist the working list was loaded from, if any.
    pub loaded_playlist_id: Option<String>,
    pub notice: Option<String>,
}

/// Full session snapshot.  `rev` is a monotonically increasing counter
/// incremented every time the session handles a state-changing event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionState {
    #[serde(default)]
    pub rev: u64,
    pub mode: Mode,
    #[serde(rename = "loop")]
    pub loop_status: LoopStatus,
    pub playlist: PlaylistStatus,
    #[serde(default)]
    pub player_health: PlayerHealth,
    pub volume: u8,
    /// Last user-visible error (player error codes, failed plays).
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_decode() {
        let cmd: Command = serde_json::from_str(r#"{"cmd":"SetStart","text":"0:75"}"#).unwrap();
        match cmd {
            Command::SetStart { text, commit } => {
                assert_eq!(text, "0:75");
                assert!(!commit);
            }
            other => panic!("Wrong command: {:?}", other),
        }

        let cmd: Command =
            serde_json::from_str(r#"{"cmd":"AddPlaylistEntry","config_id":"x"}"#).unwrap();
        assert!(matches!(
            cmd,
            Command::AddPlaylistEntry { index: None, .. }
        ));
    }

    #[test]
    fn test_error_reply_encode() {
        let reply = Reply::error(ErrorKind::DuplicateName, "taken");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["reply"], "Error");
        assert_eq!(json["kind"], "DuplicateName");
        assert_eq!(json["message"], "taken");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LoopState::Looping.to_string(), "looping");
        assert_eq!(
            PlaylistState::Playing { index: 0 }.to_string(),
            "playing set list entry 1"
        );
        assert_eq!(
            PlaylistState::Countdown {
                index: 0,
                remaining: 4
            }
            .to_string(),
            "the next set list entry starts in 4s"
        );
    }

    #[test]
    fn test_state_roundtrip_keeps_playlist_state() {
        let state = SessionState {
            rev: 7,
            playlist: PlaylistStatus {
                state: PlaylistState::Countdown {
                    index: 1,
                    remaining: 3,
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rev, 7);
        assert_eq!(
            back.playlist.state,
            PlaylistState::Countdown {
                index: 1,
                remaining: 3
            }
        );
    }
}
