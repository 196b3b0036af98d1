//! Inbound control loop: control channel → router → reply.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::{CommandRouter, RouteOutcome};
use crate::config::TopicsConfig;
use crate::domain::{CommandReply, MqttCommand};
use crate::engine::{ControlChannel, InboundMessage};

/// How long a status query may wait behind earlier commands.
const STATUS_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommandListener {
    router: Arc<CommandRouter>,
    channel: Arc<dyn ControlChannel>,
    topics: TopicsConfig,
}

impl CommandListener {
    pub fn new(router: Arc<CommandRouter>, channel: Arc<dyn ControlChannel>, topics: TopicsConfig) -> Self {
        Self {
            router,
            channel,
            topics,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        info!(topic = %self.topics.command, "Command listener started");
        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = self.channel.next_message() => message,
            };
            let Some(message) = message else {
                info!("Control channel inbound side closed");
                break;
            };
            self.handle(message).await;
        }
        debug!("Command listener stopped");
    }

    /// Route one inbound message and publish its reply.
    pub async fn handle(&self, message: InboundMessage) {
        if message.topic != self.topics.command {
            debug!(topic = %message.topic, "Ignoring message on unrelated topic");
            return;
        }

        let command = match MqttCommand::parse(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejected malformed command");
                self.reply(&CommandReply::rejected("unknown", &e)).await;
                return;
            }
        };

        let verb = command.verb;
        let stream_id = command.stream_id.clone();
        let reply = match self.router.route(command.clone()) {
            Ok(RouteOutcome::Queued) => CommandReply::accepted(&command),
            Ok(RouteOutcome::Status(rx)) => {
                let channel = self.channel.clone();
                let topic = self.topics.stream_status(&stream_id);
                let stream_id = stream_id.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(STATUS_REPLY_TIMEOUT, rx).await {
                        Ok(Ok(status)) => publish_json(channel.as_ref(), &topic, &status).await,
                        Ok(Err(_)) => debug!(stream_id = %stream_id, "Worker exited before answering status"),
                        Err(_) => warn!(topic = %topic, "Status query timed out"),
                    }
                });
                CommandReply::accepted(&command)
            }
            Err(e) => {
                info!(stream_id = %stream_id, command = %verb, error = %e, "Command rejected");
                CommandReply::rejected(verb.as_str(), &e)
            }
        };
        self.reply(&reply).await;
    }

    async fn reply(&self, reply: &CommandReply) {
        publish_json(self.channel.as_ref(), &self.topics.response, reply).await;
    }
}

async fn publish_json<T: Serialize>(channel: &dyn ControlChannel, topic: &str, value: &T) {
    let payload = match serde_json::to_vec(value) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic, error = %e, "Failed to serialize reply");
            return;
        }
    };
    if let Err(e) = channel.publish(topic, Bytes::from(payload)).await {
        warn!(topic, error = %e, "Failed to publish reply");
    }
}
