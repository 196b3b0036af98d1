//! Periodic status, metrics and health publication.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actor::StreamRegistry;
use crate::config::TopicsConfig;
use crate::domain::{StreamState, StreamStatus};
use crate::engine::ControlChannel;
use crate::metrics::{HealthReport, HostSampler, MetricsSnapshot, ResourceUsage, evaluate_health};

/// Aggregated gateway status published on the status topic.
#[derive(Debug, Clone, Serialize)]
pub struct OverallStatus {
    pub gateway: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub healthy: bool,
    pub control_connected: bool,
    pub active_streams: usize,
    pub max_concurrent_streams: usize,
    pub streams_by_state: BTreeMap<StreamState, usize>,
    pub host: ResourceUsage,
    pub streams: Vec<StreamStatus>,
}

/// Builds status and health documents from a registry snapshot.
pub struct StatusReporter {
    registry: Arc<StreamRegistry>,
    channel: Arc<dyn ControlChannel>,
    gateway: String,
    grace_period: chrono::Duration,
    host: HostSampler,
    started_at: DateTime<Utc>,
}

impl StatusReporter {
    pub fn new(
        registry: Arc<StreamRegistry>,
        channel: Arc<dyn ControlChannel>,
        gateway: impl Into<String>,
        grace_period: Duration,
    ) -> Self {
        Self {
            registry,
            channel,
            gateway: gateway.into(),
            grace_period: chrono::Duration::from_std(grace_period)
                .unwrap_or(chrono::Duration::MAX),
            host: HostSampler::new(),
            started_at: Utc::now(),
        }
    }

    pub fn overall_status(&self) -> OverallStatus {
        let now = Utc::now();
        let streams = self.registry.snapshot_all();
        let health = self.evaluate(&streams, now);

        let mut streams_by_state = BTreeMap::new();
        for status in &streams {
            *streams_by_state.entry(status.state).or_insert(0) += 1;
        }

        OverallStatus {
            gateway: self.gateway.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: now,
            uptime_secs: (now - self.started_at).num_seconds().max(0) as u64,
            healthy: health.healthy,
            control_connected: health.control_connected,
            active_streams: streams.len(),
            max_concurrent_streams: self.registry.max_streams(),
            streams_by_state,
            host: self.host.sample(),
            streams,
        }
    }

    pub fn health(&self) -> HealthReport {
        self.evaluate(&self.registry.snapshot_all(), Utc::now())
    }

    fn evaluate(&self, streams: &[StreamStatus], now: DateTime<Utc>) -> HealthReport {
        evaluate_health(streams, self.channel.is_connected(), self.grace_period, now)
    }
}

/// Publishes the overall status, per-stream metrics and health each tick.
///
/// Ticks missed while a publish is slow are skipped, never replayed.
pub struct StatusPublisher {
    reporter: Arc<StatusReporter>,
    channel: Arc<dyn ControlChannel>,
    topics: TopicsConfig,
    interval: Duration,
    failing: bool,
}

impl StatusPublisher {
    pub fn new(
        reporter: Arc<StatusReporter>,
        channel: Arc<dyn ControlChannel>,
        topics: TopicsConfig,
        interval: Duration,
    ) -> Self {
        Self {
            reporter,
            channel,
            topics,
            interval,
            failing: false,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "Status publisher started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.publish_once().await,
            }
        }
        debug!("Status publisher stopped");
    }

    /// One publication round; failures are logged and retried next tick.
    pub async fn publish_once(&mut self) {
        self.reporter.registry.reap();

        let status = self.reporter.overall_status();
        let health = self.reporter.evaluate(&status.streams, status.timestamp);
        let metrics: BTreeMap<&str, &MetricsSnapshot> = status
            .streams
            .iter()
            .map(|s| (s.stream_id.as_str(), &s.metrics))
            .collect();

        let mut result = self.publish_json(&self.topics.status, &status).await;
        if result.is_ok() {
            result = self.publish_json(&self.topics.metrics, &metrics).await;
        }
        if result.is_ok() {
            result = self.publish_json(&self.topics.health, &health).await;
        }

        match result {
            Ok(()) if self.failing => {
                info!("Status publication recovered");
                self.failing = false;
            }
            Ok(()) => {}
            Err(e) if !self.failing => {
                warn!(error = %e, "Status publication failed, retrying next tick");
                self.failing = true;
            }
            Err(e) => debug!(error = %e, "Status publication still failing"),
        }
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), String> {
        let payload = serde_json::to_vec(value).map_err(|e| e.to_string())?;
        self.channel
            .publish(topic, Bytes::from(payload))
            .await
            .map_err(|e| e.to_string())
    }
}
