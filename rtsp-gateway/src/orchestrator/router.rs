//! Command router: validates control commands and enqueues them on the
//! target worker.
//!
//! Routing never awaits. A command is accepted once it is queued, not once
//! it is applied; configuration errors, capacity and unknown ids are
//! rejected synchronously and change nothing.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use super::actor::StreamRegistry;
use crate::domain::{CommandVerb, MqttCommand, StreamConfig, StreamStatus};
use crate::engine::MediaSink;
use crate::error::StreamError;

/// What an accepted command yields to its caller.
#[derive(Debug)]
pub enum RouteOutcome {
    /// Queued on the stream's worker.
    Queued,
    /// Queued; the worker answers once every earlier command is applied.
    Status(oneshot::Receiver<StreamStatus>),
}

pub struct CommandRouter {
    registry: Arc<StreamRegistry>,
    sink: Arc<dyn MediaSink>,
}

impl CommandRouter {
    pub fn new(registry: Arc<StreamRegistry>, sink: Arc<dyn MediaSink>) -> Self {
        Self { registry, sink }
    }

    pub fn route(&self, command: MqttCommand) -> Result<RouteOutcome, StreamError> {
        debug!(stream_id = %command.stream_id, command = %command.verb, "Routing command");

        match command.verb {
            CommandVerb::Start => {
                let config = self.checked_config(command)?;
                self.registry.start(config)?;
                Ok(RouteOutcome::Queued)
            }
            CommandVerb::Configure => {
                let config = self.checked_config(command)?;
                self.registry.configure(config)?;
                Ok(RouteOutcome::Queued)
            }
            CommandVerb::Stop => {
                self.registry.stop(&command.stream_id)?;
                Ok(RouteOutcome::Queued)
            }
            CommandVerb::Status => self
                .registry
                .status(&command.stream_id)
                .map(RouteOutcome::Status),
        }
    }

    fn checked_config(&self, command: MqttCommand) -> Result<StreamConfig, StreamError> {
        let config = command.config.ok_or_else(|| {
            StreamError::config(
                &command.stream_id,
                format!("'{}' requires a config", command.verb),
            )
        })?;
        config.validate()?;

        if let Some(target) = config
            .sink_targets()
            .into_iter()
            .find(|target| !self.sink.supports_target(target))
        {
            return Err(StreamError::config(
                &config.stream_id,
                format!("unknown sink target '{target}'"),
            ));
        }
        Ok(config)
    }
}
