//! Shared types for the segment looper: time text, media references,
//! persisted records and the store that validates them, configuration,
//! platform paths and the wire protocol spoken by the HTTP API.

pub mod config;
pub mod error;
pub mod kv;
pub mod media_ref;
pub mod platform;
pub mod protocol;
pub mod records;
pub mod store;
pub mod timecode;
