use looper_proto::error::{StoreError, ValidationError};
use looper_proto::protocol::ErrorKind;
use thiserror::Error;

use crate::player::PlayerError;

/// Failure of a controller or session operation.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Player(#[from] PlayerError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("no player attached")]
    NoPlayer,
    #[error("no media loaded")]
    NoMedia,
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: String },
    #[error("Set list is empty. Add songs to the set list to play.")]
    EmptyPlaylist,
    #[error("This song is already in the set list.")]
    DuplicateEntry,
    #[error("The set list is full ({0} songs).")]
    PlaylistFull(usize),
    #[error("no set list entry at position {0}")]
    NoSuchEntry(usize),
    #[error("no saved loop with id {0}")]
    NoSuchConfig(String),
}

impl ControlError {
    pub fn invalid_state(op: &'static str, state: impl std::fmt::Display) -> Self {
        ControlError::InvalidState {
            op,
            state: state.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Validation(_) => ErrorKind::InputValidation,
            ControlError::Player(_) | ControlError::NoPlayer => ErrorKind::PlayerOperation,
            ControlError::Store(StoreError::Validation(_)) => ErrorKind::PersistenceValidation,
            ControlError::Store(StoreError::DuplicateName(_)) => ErrorKind::DuplicateName,
            ControlError::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
            ControlError::Store(_) => ErrorKind::PersistenceValidation,
            ControlError::NoMedia | ControlError::InvalidState { .. } => ErrorKind::InvalidState,
            ControlError::EmptyPlaylist | ControlError::PlaylistFull(_) => {
                ErrorKind::InvalidState
            }
            ControlError::DuplicateEntry => ErrorKind::InputValidation,
            ControlError::NoSuchEntry(_) | ControlError::NoSuchConfig(_) => ErrorKind::NotFound,
        }
    }
}
