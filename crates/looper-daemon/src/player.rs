//! The narrow player interface the controllers drive.
//!
//! Every capability is a required method, so a player that cannot seek or
//! report its position does not compile against the controllers.  Calls may
//! fail at any time and the getters may return `None` while media is still
//! loading.

use looper_proto::media_ref::MediaRef;
use looper_proto::protocol::PlayerHealth;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

/// Error codes a player reports for media it cannot play.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlayerErrorCode {
    InvalidId,
    PlayerMissing,
    NotFound,
    NotEmbeddable,
    Other(i64),
}

impl PlayerErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            2 => PlayerErrorCode::InvalidId,
            5 => PlayerErrorCode::PlayerMissing,
            100 => PlayerErrorCode::NotFound,
            101 | 150 => PlayerErrorCode::NotEmbeddable,
            other => PlayerErrorCode::Other(other),
        }
    }

    /// User-facing explanation.
    pub fn message(&self) -> &'static str {
        match self {
            PlayerErrorCode::InvalidId => "Invalid video ID. Please check the URL or Video ID.",
            PlayerErrorCode::PlayerMissing => {
                "The video player could not be found. Please restart the player."
            }
            PlayerErrorCode::NotFound => {
                "Video not found. It may have been removed or made private."
            }
            PlayerErrorCode::NotEmbeddable => {
                "Video is not available for playback here. It may be private or restricted."
            }
            PlayerErrorCode::Other(_) => {
                "Failed to load video. Please check the URL or Video ID and try again."
            }
        }
    }
}

/// Unsolicited notifications from the player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Media loaded far enough that seeking and getters work.
    Ready,
    StateChange(PlayerState),
    /// The media duration became known or changed.
    DurationChange(f64),
    Error(PlayerErrorCode),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlayerError {
    #[error("player is not ready")]
    NotReady,
    #[error("player command failed: {0}")]
    Command(String),
    #[error("player is unavailable")]
    Unavailable,
}

#[allow(async_fn_in_trait)]
pub trait Player {
    /// Load `media` paused.  `Ready` follows once it can be controlled.
    async fn load(&self, media: &MediaRef) -> Result<(), PlayerError>;
    async fn seek_to(&self, seconds: f64, allow_seek_ahead: bool) -> Result<(), PlayerError>;
    async fn play(&self) -> Result<(), PlayerError>;
    async fn pause(&self) -> Result<(), PlayerError>;
    async fn stop(&self) -> Result<(), PlayerError>;
    async fn current_time(&self) -> Result<Option<f64>, PlayerError>;
    async fn duration(&self) -> Result<Option<f64>, PlayerError>;
    async fn set_playback_rate(&self, rate: f64) -> Result<(), PlayerError>;
    /// 0–100
    async fn set_volume(&self, volume: u8) -> Result<(), PlayerError>;
    async fn state(&self) -> Result<PlayerState, PlayerError>;

    fn health(&self) -> PlayerHealth {
        PlayerHealth::Running
    }
}

#[cfg(test)]
pub mod fake {
    //! Scriptable in-memory player for controller tests.

    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Load(String),
        SeekTo(f64),
        Play,
        Pause,
        Stop,
        SetRate(f64),
        SetVolume(u8),
    }

    #[derive(Default)]
    struct Inner {
        calls: Vec<Call>,
        position: f64,
        /// Added to the position on every `current_time` while playing.
        step: f64,
        /// Readings returned by `current_time` before falling back to `step`.
        script: VecDeque<f64>,
        duration: Option<f64>,
        state: PlayerState,
        fail_seeks: usize,
        fail_play: bool,
    }

    /// Shared handle: clones observe the same player, so a test keeps one
    /// clone while the controller owns another.
    #[derive(Clone, Default)]
    pub struct FakePlayer {
        inner: Rc<RefCell<Inner>>,
    }

    impl FakePlayer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_step(self, step: f64) -> Self {
            self.inner.borrow_mut().step = step;
            self
        }

        pub fn with_duration(self, duration: f64) -> Self {
            self.inner.borrow_mut().duration = Some(duration);
            self
        }

        pub fn push_readings(&self, readings: &[f64]) {
            self.inner.borrow_mut().script.extend(readings.iter().copied());
        }

        pub fn fail_next_seeks(&self, n: usize) {
            self.inner.borrow_mut().fail_seeks = n;
        }

        pub fn fail_play(&self, fail: bool) {
            self.inner.borrow_mut().fail_play = fail;
        }

        pub fn set_position(&self, position: f64) {
            self.inner.borrow_mut().position = position;
        }

        pub fn calls(&self) -> Vec<Call> {
            self.inner.borrow().calls.clone()
        }

        pub fn clear_calls(&self) {
            self.inner.borrow_mut().calls.clear();
        }

        pub fn seeks(&self) -> Vec<f64> {
            self.inner
                .borrow()
                .calls
                .iter()
                .filter_map(|c| match c {
                    Call::SeekTo(s) => Some(*s),
                    _ => None,
                })
                .collect()
        }

        pub fn player_state(&self) -> PlayerState {
            self.inner.borrow().state
        }
    }

    impl Player for FakePlayer {
        async fn load(&self, media: &MediaRef) -> Result<(), PlayerError> {
            let mut inner = self.inner.borrow_mut();
            inner.calls.push(Call::Load(media.to_string()));
            inner.position = 0.0;
            inner.state = PlayerState::Cued;
            Ok(())
        }

        async fn seek_to(&self, seconds: f64, _allow_seek_ahead: bool) -> Result<(), PlayerError> {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_seeks > 0 {
                inner.fail_seeks -= 1;
                return Err(PlayerError::Command("seek rejected".into()));
            }
            inner.calls.push(Call::SeekTo(seconds));
            inner.position = seconds;
            Ok(())
        }

        async fn play(&self) -> Result<(), PlayerError> {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_play {
                return Err(PlayerError::Command("play rejected".into()));
            }
            inner.calls.push(Call::Play);
            inner.state = PlayerState::Playing;
            Ok(())
        }

        async fn pause(&self) -> Result<(), PlayerError> {
            let mut inner = self.inner.borrow_mut();
            inner.calls.push(Call::Pause);
            inner.state = PlayerState::Paused;
            Ok(())
        }

        async fn stop(&self) -> Result<(), PlayerError> {
            let mut inner = self.inner.borrow_mut();
            inner.calls.push(Call::Stop);
            inner.state = PlayerState::Unstarted;
            Ok(())
        }

        async fn current_time(&self) -> Result<Option<f64>, PlayerError> {
            let mut inner = self.inner.borrow_mut();
            if let Some(reading) = inner.script.pop_front() {
                inner.position = reading;
            } else if inner.state == PlayerState::Playing {
                inner.position += inner.step;
            }
            Ok(Some(inner.position))
        }

        async fn duration(&self) -> Result<Option<f64>, PlayerError> {
            Ok(self.inner.borrow().duration)
        }

        async fn set_playback_rate(&self, rate: f64) -> Result<(), PlayerError> {
            self.inner.borrow_mut().calls.push(Call::SetRate(rate));
            Ok(())
        }

        async fn set_volume(&self, volume: u8) -> Result<(), PlayerError> {
            self.inner.borrow_mut().calls.push(Call::SetVolume(volume));
            Ok(())
        }

        async fn state(&self) -> Result<PlayerState, PlayerError> {
            Ok(self.inner.borrow().state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(PlayerErrorCode::from_code(2), PlayerErrorCode::InvalidId);
        assert_eq!(PlayerErrorCode::from_code(101), PlayerErrorCode::NotEmbeddable);
        assert_eq!(PlayerErrorCode::from_code(150), PlayerErrorCode::NotEmbeddable);
        assert_eq!(PlayerErrorCode::from_code(7), PlayerErrorCode::Other(7));
        assert!(PlayerErrorCode::from_code(100).message().starts_with("Video not found"));
    }
}
