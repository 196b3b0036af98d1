//! Control-plane commands and their replies.

use serde::{Deserialize, Serialize};

use super::stream::StreamConfig;
use crate::error::StreamError;

/// Verbs understood by the command router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandVerb {
    Start,
    Stop,
    Configure,
    Status,
}

impl CommandVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Configure => "configure",
            Self::Status => "status",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "configure" => Some(Self::Configure),
            "status" => Some(Self::Status),
            _ => None,
        }
    }

    /// Whether the verb carries a stream configuration.
    pub fn requires_config(&self) -> bool {
        matches!(self, Self::Start | Self::Configure)
    }
}

impl std::fmt::Display for CommandVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound control message, transient until dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttCommand {
    pub verb: CommandVerb,
    pub stream_id: String,
    pub config: Option<StreamConfig>,
}

/// Loose shape of the JSON payload before the verb is known.
#[derive(Debug, Deserialize)]
struct RawCommand {
    command: String,
    #[serde(default)]
    stream_id: String,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl MqttCommand {
    pub fn start(config: StreamConfig) -> Self {
        Self {
            verb: CommandVerb::Start,
            stream_id: config.stream_id.clone(),
            config: Some(config),
        }
    }

    pub fn configure(config: StreamConfig) -> Self {
        Self {
            verb: CommandVerb::Configure,
            stream_id: config.stream_id.clone(),
            config: Some(config),
        }
    }

    pub fn stop(stream_id: impl Into<String>) -> Self {
        Self {
            verb: CommandVerb::Stop,
            stream_id: stream_id.into(),
            config: None,
        }
    }

    pub fn status(stream_id: impl Into<String>) -> Self {
        Self {
            verb: CommandVerb::Status,
            stream_id: stream_id.into(),
            config: None,
        }
    }

    /// Parse a raw control payload.
    ///
    /// Only the shape is checked here; semantic validation of the embedded
    /// configuration is left to the router.
    pub fn parse(payload: &[u8]) -> Result<Self, StreamError> {
        let raw: RawCommand = serde_json::from_slice(payload)
            .map_err(|e| StreamError::config("", format!("unparsable command: {e}")))?;

        let verb = CommandVerb::parse(&raw.command).ok_or_else(|| StreamError::UnknownVerb {
            stream_id: raw.stream_id.clone(),
            verb: raw.command.clone(),
        })?;

        let config = match raw.config {
            Some(value) if verb.requires_config() => {
                let mut config: StreamConfig = serde_json::from_value(value)
                    .map_err(|e| StreamError::config(&raw.stream_id, format!("invalid config: {e}")))?;
                if config.stream_id.is_empty() {
                    config.stream_id = raw.stream_id.clone();
                } else if !raw.stream_id.is_empty() && config.stream_id != raw.stream_id {
                    return Err(StreamError::config(
                        &raw.stream_id,
                        format!(
                            "config stream_id '{}' does not match command stream_id",
                            config.stream_id
                        ),
                    ));
                }
                Some(config)
            }
            None if verb.requires_config() => {
                return Err(StreamError::config(
                    &raw.stream_id,
                    format!("'{verb}' requires a config"),
                ));
            }
            _ => None,
        };

        let stream_id = match &config {
            Some(config) => config.stream_id.clone(),
            None => raw.stream_id,
        };
        if stream_id.trim().is_empty() {
            return Err(StreamError::config("", "stream_id is required"));
        }

        Ok(Self {
            verb,
            stream_id,
            config,
        })
    }
}

/// Reply published for every inbound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub stream_id: String,
    pub command: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl CommandReply {
    pub fn accepted(command: &MqttCommand) -> Self {
        Self {
            stream_id: command.stream_id.clone(),
            command: command.verb.to_string(),
            accepted: true,
            error_kind: None,
            message: String::new(),
        }
    }

    pub fn rejected(command: impl Into<String>, error: &StreamError) -> Self {
        Self {
            stream_id: error.stream_id().to_string(),
            command: command.into(),
            accepted: false,
            error_kind: Some(error.kind().to_string()),
            message: error.to_string(),
        }
    }
}
