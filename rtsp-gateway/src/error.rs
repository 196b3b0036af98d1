//! Application-wide error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Control channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }
}

/// Per-stream error taxonomy.
///
/// `Config`, `Capacity`, `UnknownStream`, `UnknownVerb`, `Conflict` and
/// `Unavailable` are returned synchronously to whoever routed the command and
/// never change any stream state. `Resource` and `Transport` are recorded into
/// the owning worker's status and drive its state machine.
///
/// Serialized with the same `kind` codes used in command replies.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StreamError {
    /// Malformed or incomplete stream configuration.
    #[serde(rename = "malformed_config")]
    #[error("Invalid configuration for stream '{stream_id}': {message}")]
    Config { stream_id: String, message: String },

    /// The pipeline or sink could not be acquired.
    #[error("Resource acquisition failed for stream '{stream_id}': {message}")]
    #[serde(rename = "resource_error")]
    Resource { stream_id: String, message: String },

    /// The pipeline or sink failed after a successful start.
    #[error("Transport failure on stream '{stream_id}': {message}")]
    #[serde(rename = "transport_failure")]
    Transport { stream_id: String, message: String },

    /// The registry already holds `limit` streams.
    #[error("Cannot start stream '{stream_id}': {limit} concurrent streams already active")]
    #[serde(rename = "at_capacity")]
    Capacity { stream_id: String, limit: usize },

    /// The command targets a stream that does not exist.
    #[error("Unknown stream '{stream_id}'")]
    #[serde(rename = "unknown_stream")]
    UnknownStream { stream_id: String },

    /// The command verb is not recognised.
    #[error("Unknown command '{verb}' for stream '{stream_id}'")]
    #[serde(rename = "unknown_verb")]
    UnknownVerb { stream_id: String, verb: String },

    /// The stream is already active with a different configuration.
    #[error("Stream '{stream_id}' already exists: {message}")]
    #[serde(rename = "conflicting_config")]
    Conflict { stream_id: String, message: String },

    /// The stream's worker cannot accept commands right now.
    #[error("Stream '{stream_id}' unavailable: {message}")]
    #[serde(rename = "unavailable")]
    Unavailable { stream_id: String, message: String },
}

impl StreamError {
    pub fn config(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            stream_id: stream_id.into(),
            message: message.into(),
        }
    }

    pub fn resource(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resource {
            stream_id: stream_id.into(),
            message: message.into(),
        }
    }

    pub fn transport(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            stream_id: stream_id.into(),
            message: message.into(),
        }
    }

    pub fn unknown_stream(stream_id: impl Into<String>) -> Self {
        Self::UnknownStream {
            stream_id: stream_id.into(),
        }
    }

    pub fn unavailable(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            stream_id: stream_id.into(),
            message: message.into(),
        }
    }

    /// Stream the error refers to.
    pub fn stream_id(&self) -> &str {
        match self {
            Self::Config { stream_id, .. }
            | Self::Resource { stream_id, .. }
            | Self::Transport { stream_id, .. }
            | Self::Capacity { stream_id, .. }
            | Self::UnknownStream { stream_id }
            | Self::UnknownVerb { stream_id, .. }
            | Self::Conflict { stream_id, .. }
            | Self::Unavailable { stream_id, .. } => stream_id,
        }
    }

    /// Human-readable detail without the stream prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Config { message, .. }
            | Self::Resource { message, .. }
            | Self::Transport { message, .. }
            | Self::Conflict { message, .. }
            | Self::Unavailable { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Stable code used in command replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "malformed_config",
            Self::Resource { .. } => "resource_error",
            Self::Transport { .. } => "transport_failure",
            Self::Capacity { .. } => "at_capacity",
            Self::UnknownStream { .. } => "unknown_stream",
            Self::UnknownVerb { .. } => "unknown_verb",
            Self::Conflict { .. } => "conflicting_config",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}
