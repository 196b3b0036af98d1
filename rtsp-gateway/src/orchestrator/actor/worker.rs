//! Stream worker: the single consumer of one stream's mailbox.
//!
//! The worker owns its stream's configuration, status and pipeline lease.
//! Messages are handled one at a time to completion, so a `stop` queued
//! behind a `start` runs only after the start attempt has finished, and
//! transitions of one stream are totally ordered.
//!
//! ```text
//! STOPPED ─start─▶ STARTING ─ok─▶ RUNNING ─failure─▶ RECONNECTING ─ok─▶ RUNNING
//!                      │                                  │
//!                      └─err─▶ ERROR ◀─── budget spent ───┘
//! RUNNING | ERROR | RECONNECTING ─stop─▶ STOPPING ─▶ STOPPED
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::media::{self, MediaContext};
use super::messages::{StreamMessage, WorkerEvent, WorkerExit, WorkerOutcome};
use super::registry::RegistryShared;
use super::telemetry::StreamTelemetry;
use crate::config::{AppConfig, InferenceConfig};
use crate::domain::{ReconnectPolicy, StreamConfig, StreamState, StreamStatus};
use crate::engine::{EngineError, InferenceEngine, MediaSink, PipelineEngine, PipelineLease};
use crate::error::StreamError;
use crate::orchestrator::events::StreamEvent;

/// How often pipeline resource usage is sampled while a lease is held.
const RESOURCE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the collaborator notification channel.
const EVENT_QUEUE: usize = 16;

/// Tunables every worker shares.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub mailbox_capacity: usize,
    pub acquire_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub inference: InferenceConfig,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            mailbox_capacity: config.orchestrator.mailbox_capacity,
            acquire_timeout: config.orchestrator.acquire_timeout(),
            reconnect: config.orchestrator.reconnect.clone(),
            inference: config.inference.clone(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Collaborators and settings handed to every worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub pipeline: Arc<dyn PipelineEngine>,
    pub inference: Arc<dyn InferenceEngine>,
    pub sink: Arc<dyn MediaSink>,
    pub settings: Arc<WorkerSettings>,
    pub events: broadcast::Sender<StreamEvent>,
}

/// Everything a new worker is born with.
pub(crate) struct WorkerSeed {
    pub stream_id: String,
    pub config: StreamConfig,
    pub mailbox: mpsc::Receiver<StreamMessage>,
    pub status_tx: watch::Sender<StreamStatus>,
    pub telemetry: Arc<StreamTelemetry>,
    pub cancellation_token: CancellationToken,
    pub registry: Weak<RegistryShared>,
    pub generation: u64,
}

pub(crate) struct StreamWorker {
    id: String,
    config: StreamConfig,
    status: StreamStatus,
    mailbox: mpsc::Receiver<StreamMessage>,
    events_tx: mpsc::Sender<WorkerEvent>,
    events_rx: mpsc::Receiver<WorkerEvent>,
    ctx: WorkerContext,
    telemetry: Arc<StreamTelemetry>,
    status_tx: watch::Sender<StreamStatus>,
    lease: Option<PipelineLease>,
    next_lease_id: u64,
    reconnect_at: Option<Instant>,
    cancellation_token: CancellationToken,
    registry: Weak<RegistryShared>,
    generation: u64,
}

impl StreamWorker {
    pub(crate) fn new(seed: WorkerSeed, ctx: WorkerContext) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            status: StreamStatus::new(&seed.stream_id),
            id: seed.stream_id,
            config: seed.config,
            mailbox: seed.mailbox,
            events_tx,
            events_rx,
            ctx,
            telemetry: seed.telemetry,
            status_tx: seed.status_tx,
            lease: None,
            next_lease_id: 0,
            reconnect_at: None,
            cancellation_token: seed.cancellation_token,
            registry: seed.registry,
            generation: seed.generation,
        }
    }

    /// Run until retired, cancelled or orphaned.
    pub(crate) async fn run(mut self) -> WorkerExit {
        info!("StreamWorker {} started", self.id);

        let mut resource_timer = tokio::time::interval(RESOURCE_SAMPLE_INTERVAL);
        resource_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("StreamWorker {} cancelled", self.id);
                    break WorkerOutcome::Cancelled;
                }

                msg = self.mailbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("StreamWorker {} mailbox closed", self.id);
                        break WorkerOutcome::Orphaned;
                    };
                    self.handle_message(msg).await;
                    if self.status.state == StreamState::Stopped && self.try_retire() {
                        break WorkerOutcome::Retired;
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.attempt_reconnect().await;
                }

                _ = resource_timer.tick(), if self.lease.is_some() => {
                    self.sample_resources();
                }
            }
        };

        if self.status.state.is_stoppable() {
            self.stop().await;
        }
        if outcome != WorkerOutcome::Retired {
            self.leave_registry();
        }
        info!(outcome = ?outcome, "StreamWorker {} exited", self.id);

        WorkerExit {
            stream_id: self.id,
            outcome,
        }
    }

    async fn handle_message(&mut self, msg: StreamMessage) {
        debug!(stream_id = %self.id, message = msg.name(), state = %self.status.state, "Handling message");

        match msg {
            StreamMessage::Start(config) => self.on_start(config).await,
            StreamMessage::Configure(config) => self.on_configure(config).await,
            StreamMessage::Stop => {
                if self.status.state.is_stoppable() {
                    self.stop().await;
                } else {
                    debug!(stream_id = %self.id, state = %self.status.state, "Stop ignored");
                }
            }
            StreamMessage::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_start(&mut self, config: StreamConfig) {
        match self.status.state {
            StreamState::Stopped | StreamState::Error => {
                self.config = config;
                self.start().await;
            }
            StreamState::Running | StreamState::Reconnecting if config == self.config => {
                debug!(stream_id = %self.id, "Start ignored, stream already active");
            }
            StreamState::Running | StreamState::Reconnecting => {
                warn!(stream_id = %self.id, "Start with a new config on an active stream, restarting");
                self.restart(config).await;
            }
            state @ (StreamState::Starting | StreamState::Stopping) => {
                warn!(stream_id = %self.id, %state, "Start ignored mid-transition");
            }
        }
    }

    async fn on_configure(&mut self, config: StreamConfig) {
        match self.status.state {
            StreamState::Stopped => {
                self.config = config;
                self.start().await;
            }
            StreamState::Running | StreamState::Error | StreamState::Reconnecting => {
                self.restart(config).await;
            }
            state @ (StreamState::Starting | StreamState::Stopping) => {
                warn!(stream_id = %self.id, %state, "Configure ignored mid-transition");
            }
        }
    }

    /// Full teardown followed by a fresh start; a pipeline is never
    /// reconfigured in place.
    async fn restart(&mut self, config: StreamConfig) {
        self.stop().await;
        self.config = config;
        self.start().await;
    }

    async fn start(&mut self) {
        self.transition(StreamState::Starting);

        match self.acquire().await {
            Ok(lease) => {
                self.lease = Some(lease);
                self.status.clear_error();
                self.status.reconnect_attempts = 0;
                self.status.start_time = Some(Utc::now());
                self.transition(StreamState::Running);
            }
            Err(e) => {
                warn!(stream_id = %self.id, error = %e, "Pipeline acquisition failed");
                self.record_error(StreamError::resource(&self.id, e.message));
                self.transition(StreamState::Error);
            }
        }
    }

    async fn stop(&mut self) {
        self.transition(StreamState::Stopping);
        self.reconnect_at = None;
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
        self.telemetry.metrics.reset_rates();
        self.telemetry.clear_detections();
        self.status.clear_error();
        self.status.reconnect_attempts = 0;
        self.status.start_time = None;
        self.transition(StreamState::Stopped);
    }

    async fn acquire(&mut self) -> Result<PipelineLease, EngineError> {
        self.next_lease_id += 1;
        let mut lease = PipelineLease::acquire(
            self.next_lease_id,
            self.ctx.pipeline.clone(),
            self.ctx.sink.clone(),
            &self.config,
            self.ctx.settings.acquire_timeout,
        )
        .await?;

        let media = MediaContext {
            stream: self.config.clone(),
            inference: self.ctx.inference.clone(),
            settings: self.ctx.settings.inference.clone(),
            telemetry: self.telemetry.clone(),
            events: self.events_tx.clone(),
        };
        match media::activate(&mut lease, media).await {
            Ok(()) => Ok(lease),
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent::TransportFailure {
            lease_id,
            source,
            reason,
        } = event;

        let current = self.lease.as_ref().map(PipelineLease::lease_id);
        if self.status.state != StreamState::Running || current != Some(lease_id) {
            debug!(stream_id = %self.id, lease = lease_id, "Ignoring stale failure notification");
            return;
        }

        warn!(stream_id = %self.id, %source, reason = %reason, "Transport failure, reconnecting");
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
        self.telemetry.metrics.reset_rates();
        self.status.reconnect_attempts = 0;

        let policy = &self.ctx.settings.reconnect;
        if policy.should_retry(0) {
            self.reconnect_at = Some(Instant::now() + policy.delay_for_attempt(0));
            self.record_error(StreamError::transport(&self.id, reason));
            self.transition(StreamState::Reconnecting);
        } else {
            self.record_error(StreamError::transport(
                &self.id,
                format!("reconnect disabled: {reason}"),
            ));
            self.transition(StreamState::Reconnecting);
            self.transition(StreamState::Error);
        }
    }

    async fn attempt_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.status.state != StreamState::Reconnecting {
            return;
        }

        let attempt = self.status.reconnect_attempts + 1;
        let max_attempts = self.ctx.settings.reconnect.max_attempts;
        self.status.reconnect_attempts = attempt;
        self.publish_status();
        let _ = self.ctx.events.send(StreamEvent::ReconnectAttempt {
            stream_id: self.id.clone(),
            attempt,
            max_attempts,
        });
        info!(stream_id = %self.id, attempt, max_attempts, "Reconnect attempt");

        match self.acquire().await {
            Ok(lease) => {
                self.lease = Some(lease);
                self.status.clear_error();
                self.status.reconnect_attempts = 0;
                self.transition(StreamState::Running);
            }
            Err(e) if self.ctx.settings.reconnect.should_retry(attempt) => {
                let delay = self.ctx.settings.reconnect.delay_for_attempt(attempt);
                debug!(stream_id = %self.id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Reconnect failed, backing off");
                self.reconnect_at = Some(Instant::now() + delay);
                self.record_error(StreamError::resource(&self.id, e.message));
                self.publish_status();
            }
            Err(e) => {
                warn!(stream_id = %self.id, attempts = attempt, error = %e, "Reconnect budget exhausted");
                self.record_error(StreamError::resource(
                    &self.id,
                    format!("reconnect failed after {attempt} attempts: {}", e.message),
                ));
                self.transition(StreamState::Error);
            }
        }
    }

    fn sample_resources(&self) {
        if let Some(lease) = &self.lease
            && let Some(usage) = lease.pipeline().resource_usage(lease.handle())
        {
            self.telemetry.metrics.set_resources(&usage);
        }
    }

    fn transition(&mut self, to: StreamState) {
        let from = self.status.state;
        if !from.can_transition_to(to) {
            warn!(stream_id = %self.id, %from, %to, "Unexpected state transition");
        }

        let now = Utc::now();
        self.status.state = to;
        self.status.state_since = now;
        info!(stream_id = %self.id, %from, %to, "Stream state changed");

        self.publish_status();
        let _ = self.ctx.events.send(StreamEvent::StateChanged {
            stream_id: self.id.clone(),
            from,
            to,
            at: now,
        });
    }

    /// Store a failure in the status and announce it; published with the next transition.
    fn record_error(&mut self, error: StreamError) {
        let _ = self.ctx.events.send(StreamEvent::Failed {
            stream_id: self.id.clone(),
            error: error.clone(),
        });
        self.status.record_error(error);
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn snapshot(&self) -> StreamStatus {
        self.telemetry.compose(&self.status)
    }

    /// Remove this worker's entry if nothing is queued behind the stop.
    ///
    /// Senders only enqueue while holding the registry lock, so an empty
    /// mailbox observed under the write lock stays empty.
    fn try_retire(&mut self) -> bool {
        let Some(shared) = self.registry.upgrade() else {
            return true;
        };
        {
            let mut streams = shared.streams.write();
            if !self.mailbox.is_empty() {
                return false;
            }
            if streams
                .get(&self.id)
                .is_some_and(|entry| entry.generation == self.generation)
            {
                streams.remove(&self.id);
            }
        }
        let _ = self.ctx.events.send(StreamEvent::Retired {
            stream_id: self.id.clone(),
        });
        true
    }

    fn leave_registry(&self) {
        if let Some(shared) = self.registry.upgrade() {
            let mut streams = shared.streams.write();
            if streams
                .get(&self.id)
                .is_some_and(|entry| entry.generation == self.generation)
            {
                streams.remove(&self.id);
            }
        }
    }
}
