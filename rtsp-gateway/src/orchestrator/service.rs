//! Orchestrator facade wired by the composition root.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::actor::{ShutdownReport, StreamRegistry, WorkerSettings};
use super::events::StreamEvent;
use super::listener::CommandListener;
use super::publisher::{OverallStatus, StatusPublisher, StatusReporter};
use super::router::{CommandRouter, RouteOutcome};
use crate::config::AppConfig;
use crate::domain::{MqttCommand, StreamStatus};
use crate::engine::{Collaborators, ControlChannel};
use crate::error::StreamError;
use crate::metrics::HealthReport;
use crate::{Error, Result};

/// Grace period for background tasks after cancellation.
const BACKGROUND_STOP_TIMEOUT: Duration = Duration::from_secs(2);

struct Background {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the registry, router and reporting for one gateway.
pub struct Orchestrator {
    config: AppConfig,
    registry: Arc<StreamRegistry>,
    router: Arc<CommandRouter>,
    reporter: Arc<StatusReporter>,
    channel: Arc<dyn ControlChannel>,
    background: Mutex<Option<Background>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(StreamRegistry::new(
            config.orchestrator.max_concurrent_streams,
            WorkerSettings::from_config(&config),
            collaborators.pipeline,
            collaborators.inference,
            collaborators.sink.clone(),
        ));
        let router = Arc::new(CommandRouter::new(registry.clone(), collaborators.sink));
        let reporter = Arc::new(StatusReporter::new(
            registry.clone(),
            collaborators.channel.clone(),
            config.name.clone(),
            config.orchestrator.error_grace_period(),
        ));

        Ok(Self {
            config,
            registry,
            router,
            reporter,
            channel: collaborators.channel,
            background: Mutex::new(None),
        })
    }

    /// Validate and enqueue a command. Accepted means queued, not applied.
    pub fn handle_command(&self, command: MqttCommand) -> std::result::Result<(), StreamError> {
        self.router.route(command).map(|_| ())
    }

    /// Status of one stream, answered after every command queued before it.
    pub async fn query_status(&self, stream_id: &str) -> std::result::Result<StreamStatus, StreamError> {
        match self.router.route(MqttCommand::status(stream_id))? {
            RouteOutcome::Status(rx) => rx
                .await
                .map_err(|_| StreamError::unavailable(stream_id, "worker exited before answering")),
            RouteOutcome::Queued => Err(StreamError::unavailable(stream_id, "no status reply")),
        }
    }

    pub fn get_overall_status(&self) -> OverallStatus {
        self.reporter.overall_status()
    }

    pub fn is_healthy(&self) -> bool {
        self.reporter.health().healthy
    }

    pub fn health(&self) -> HealthReport {
        self.reporter.health()
    }

    pub fn snapshot_all(&self) -> Vec<StreamStatus> {
        self.registry.snapshot_all()
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.registry.subscribe_events()
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Spawn the status publisher and the command listener.
    pub fn start(&self) -> Result<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Err(Error::Other("orchestrator already started".to_string()));
        }

        let token = CancellationToken::new();
        let topics = self.config.control.topics.clone();

        let publisher = StatusPublisher::new(
            self.reporter.clone(),
            self.channel.clone(),
            topics.clone(),
            self.config.orchestrator.status_interval(),
        );
        let listener = CommandListener::new(self.router.clone(), self.channel.clone(), topics);

        let tasks = vec![
            tokio::spawn(publisher.run(token.child_token())),
            tokio::spawn(listener.run(token.child_token())),
        ];
        *background = Some(Background { token, tasks });

        info!(
            gateway = %self.config.name,
            max_streams = self.config.orchestrator.max_concurrent_streams,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop background tasks, then every stream worker.
    pub async fn stop(&self) -> ShutdownReport {
        let background = self.background.lock().take();
        if let Some(background) = background {
            background.token.cancel();
            let aborts: Vec<_> = background.tasks.iter().map(|t| t.abort_handle()).collect();
            let joined = futures::future::join_all(background.tasks);
            if tokio::time::timeout(BACKGROUND_STOP_TIMEOUT, joined).await.is_err() {
                warn!("Background tasks did not stop in time, aborting");
                aborts.iter().for_each(|abort| abort.abort());
            }
        }

        let report = self
            .registry
            .shutdown(self.config.orchestrator.shutdown_timeout())
            .await;
        info!("Orchestrator stopped");
        report
    }
}
