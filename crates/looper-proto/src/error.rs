use thiserror::Error;

/// A value failed a bounds or shape check.  Raised for user input and for
/// persisted records alike: both go through the same validators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid video reference. Please check the URL or Video ID.")]
    InvalidMediaRef,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("Start time must be between 0:00 and 24:00:00")]
    StartOutOfRange,
    #[error("End time must be greater than start time")]
    EndNotAfterStart,
    #[error("End time must not exceed 24 hours")]
    EndOutOfRange,
    #[error("Start time must be less than the video duration")]
    StartBeyondDuration,
    #[error("End time must not exceed the video duration")]
    EndBeyondDuration,
    #[error("Target loops must be between 1 and {max}")]
    LoopCountOutOfRange { max: u32 },
    #[error("Playback speed must be between {min}x and {max}x")]
    RateOutOfRange { min: f64, max: f64 },
    #[error("Set list name must not be empty")]
    EmptyName,
    #[error("A set list holds at most {max} songs")]
    TooManyEntries { max: usize },
}

/// Failure of a persistence operation.  A failed write never modifies the
/// stored collection.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("A set list named \"{0}\" already exists")]
    DuplicateName(String),
    #[error("no saved record with id {0}")]
    NotFound(String),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialise records: {0}")]
    Serialize(#[from] serde_json::Error),
}
