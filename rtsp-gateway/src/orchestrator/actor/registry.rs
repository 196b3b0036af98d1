//! Registry of live stream workers.
//!
//! The id → entry map is the only structure mutated by more than one task.
//! Every mutation, and every enqueue into a worker mailbox, happens under its
//! write lock, which makes creation, routing and retirement linearizable:
//! - concurrent `start`s for one id create exactly one worker
//! - the capacity check and the insert are one step
//! - a worker only retires when no command is queued behind its stop

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::{SendError, WorkerHandle};
use super::messages::{StreamMessage, WorkerExit, WorkerOutcome};
use super::telemetry::StreamTelemetry;
use super::worker::{StreamWorker, WorkerContext, WorkerSeed, WorkerSettings};
use crate::domain::{StreamConfig, StreamState, StreamStatus};
use crate::engine::{InferenceEngine, MediaSink, PipelineEngine};
use crate::error::StreamError;
use crate::orchestrator::events::{EVENT_CHANNEL_CAPACITY, StreamEvent};

/// Time cancelled workers get to release their pipelines before abort.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct StreamEntry {
    pub(crate) handle: WorkerHandle,
    pub(crate) config: StreamConfig,
    pub(crate) status: watch::Receiver<StreamStatus>,
    pub(crate) telemetry: Arc<StreamTelemetry>,
    pub(crate) generation: u64,
    /// A stop was routed and no start or configure since.
    pub(crate) pending_stop: bool,
}

impl StreamEntry {
    /// In ERROR with nothing queued, so no pipeline is held.
    fn is_idle_error(&self) -> bool {
        self.handle.queued() == 0 && self.status.borrow().state == StreamState::Error
    }
}

/// State shared with workers so they can retire themselves.
#[derive(Default)]
pub(crate) struct RegistryShared {
    pub(crate) streams: RwLock<HashMap<String, StreamEntry>>,
}

/// Summary of [`StreamRegistry::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers alive when shutdown began.
    pub total_workers: usize,
    /// Workers that processed their stop and retired.
    pub graceful_stops: usize,
    /// Workers cancelled or aborted after the deadline.
    pub forced_terminations: usize,
}

pub struct StreamRegistry {
    shared: Arc<RegistryShared>,
    tasks: Mutex<JoinSet<WorkerExit>>,
    ctx: WorkerContext,
    max_streams: usize,
    root_token: CancellationToken,
    next_generation: AtomicU64,
    closing: AtomicBool,
}

impl StreamRegistry {
    pub fn new(
        max_streams: usize,
        settings: WorkerSettings,
        pipeline: Arc<dyn PipelineEngine>,
        inference: Arc<dyn InferenceEngine>,
        sink: Arc<dyn MediaSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(RegistryShared::default()),
            tasks: Mutex::new(JoinSet::new()),
            ctx: WorkerContext {
                pipeline,
                inference,
                sink,
                settings: Arc::new(settings),
                events,
            },
            max_streams,
            root_token: CancellationToken::new(),
            next_generation: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.ctx.events.subscribe()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn len(&self) -> usize {
        self.shared.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.streams.read().is_empty()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.shared.streams.read().contains_key(stream_id)
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.streams.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handle of the stream's worker, creating worker and entry if absent.
    ///
    /// Returns the existing handle when the id is active with the same
    /// configuration, has a stop pending, or sits in ERROR with nothing
    /// queued; otherwise a different configuration is a conflict.
    pub fn create_or_get(&self, config: &StreamConfig) -> Result<WorkerHandle, StreamError> {
        let mut streams = self.shared.streams.write();
        self.create_or_get_locked(&mut streams, config, false)
            .map(|entry| entry.handle.clone())
    }

    /// Route a `start`.
    pub fn start(&self, config: StreamConfig) -> Result<(), StreamError> {
        let mut streams = self.shared.streams.write();
        let entry = self.create_or_get_locked(&mut streams, &config, false)?;
        enqueue(entry, StreamMessage::Start(config.clone()))?;
        entry.config = config;
        entry.pending_stop = false;
        Ok(())
    }

    /// Route a `configure`, creating the stream if absent.
    pub fn configure(&self, config: StreamConfig) -> Result<(), StreamError> {
        let mut streams = self.shared.streams.write();
        let entry = self.create_or_get_locked(&mut streams, &config, true)?;
        enqueue(entry, StreamMessage::Configure(config.clone()))?;
        entry.config = config;
        entry.pending_stop = false;
        Ok(())
    }

    /// Route a `stop`.
    pub fn stop(&self, stream_id: &str) -> Result<(), StreamError> {
        let mut streams = self.shared.streams.write();
        let entry = existing_locked(&mut streams, stream_id)?;
        enqueue(entry, StreamMessage::Stop)?;
        entry.pending_stop = true;
        Ok(())
    }

    /// Route a `status` query; the worker answers in command order.
    pub fn status(&self, stream_id: &str) -> Result<oneshot::Receiver<StreamStatus>, StreamError> {
        let mut streams = self.shared.streams.write();
        let entry = existing_locked(&mut streams, stream_id)?;
        let (tx, rx) = oneshot::channel();
        enqueue(entry, StreamMessage::Status(tx))?;
        Ok(rx)
    }

    /// Delete an entry whose worker is STOPPED with nothing queued.
    ///
    /// Returns whether an entry was removed; absent ids are a no-op.
    pub fn remove(&self, stream_id: &str) -> bool {
        let mut streams = self.shared.streams.write();
        let removable = streams.get(stream_id).is_some_and(|entry| {
            entry.status.borrow().state == StreamState::Stopped && entry.handle.queued() == 0
        });
        if removable {
            streams.remove(stream_id);
            debug!(stream_id, "Stream entry removed");
        }
        removable
    }

    /// Status of one stream, if registered.
    pub fn snapshot(&self, stream_id: &str) -> Option<StreamStatus> {
        let (status, telemetry) = {
            let streams = self.shared.streams.read();
            let entry = streams.get(stream_id)?;
            (entry.status.clone(), entry.telemetry.clone())
        };
        let base = status.borrow().clone();
        Some(telemetry.compose(&base))
    }

    /// Status of every stream, ordered by id.
    ///
    /// The lock is held only to clone the per-entry readers; each status is
    /// a whole value published by its worker.
    pub fn snapshot_all(&self) -> Vec<StreamStatus> {
        let views: Vec<_> = {
            let streams = self.shared.streams.read();
            streams
                .values()
                .map(|entry| (entry.status.clone(), entry.telemetry.clone()))
                .collect()
        };

        let mut statuses: Vec<StreamStatus> = views
            .into_iter()
            .map(|(status, telemetry)| {
                let base = status.borrow().clone();
                telemetry.compose(&base)
            })
            .collect();
        statuses.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        statuses
    }

    /// Collect finished worker tasks, logging crashes.
    pub fn reap(&self) -> Vec<WorkerExit> {
        let mut exits = Vec::new();
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            match result {
                Ok(exit) => {
                    debug!(stream_id = %exit.stream_id, outcome = ?exit.outcome, "Worker task finished");
                    exits.push(exit);
                }
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
        exits
    }

    /// Stop every worker: queue a stop, wait until `timeout`, then cancel
    /// and finally abort what is left. New streams are refused from here on.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.reap();

        let total_workers = {
            let mut streams = self.shared.streams.write();
            self.closing.store(true, Ordering::SeqCst);
            for entry in streams.values_mut() {
                entry.pending_stop = true;
                if let Err(e) = entry.handle.try_send(StreamMessage::Stop) {
                    warn!(stream_id = %entry.handle.id(), error = %e, "Could not queue stop, cancelling worker");
                    entry.handle.cancel();
                }
            }
            streams.len()
        };
        info!("Shutting down {} stream workers", total_workers);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut graceful_stops = 0;
        let mut forced_terminations = 0;

        let deadline = tokio::time::Instant::now() + timeout;
        while !tasks.is_empty() {
            tokio::select! {
                result = tasks.join_next() => match result {
                    Some(Ok(exit)) if exit.outcome == WorkerOutcome::Retired => graceful_stops += 1,
                    Some(Ok(_)) => forced_terminations += 1,
                    Some(Err(e)) => {
                        error!(error = %e, "Worker task panicked during shutdown");
                        forced_terminations += 1;
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        if !tasks.is_empty() {
            warn!("{} workers still running after {:?}, cancelling", tasks.len(), timeout);
            self.root_token.cancel();
            let grace = tokio::time::Instant::now() + CANCEL_GRACE;
            while let Ok(Some(_)) = tokio::time::timeout_at(grace, tasks.join_next()).await {
                forced_terminations += 1;
            }
            forced_terminations += tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.shared.streams.write().clear();

        let report = ShutdownReport {
            total_workers,
            graceful_stops,
            forced_terminations,
        };
        info!(
            "Shutdown complete: {} total, {} graceful, {} forced",
            report.total_workers, report.graceful_stops, report.forced_terminations
        );
        report
    }

    fn create_or_get_locked<'a>(
        &self,
        streams: &'a mut HashMap<String, StreamEntry>,
        config: &StreamConfig,
        replace_config: bool,
    ) -> Result<&'a mut StreamEntry, StreamError> {
        let stream_id = config.stream_id.as_str();
        heal_locked(streams, stream_id);

        if streams.contains_key(stream_id) {
            let entry = streams
                .get_mut(stream_id)
                .ok_or_else(|| StreamError::unknown_stream(stream_id))?;
            if !replace_config
                && !entry.pending_stop
                && !entry.is_idle_error()
                && entry.config != *config
            {
                return Err(StreamError::Conflict {
                    stream_id: stream_id.to_string(),
                    message: "stream is active with a different configuration; use configure"
                        .to_string(),
                });
            }
            return Ok(entry);
        }

        if self.closing.load(Ordering::SeqCst) {
            return Err(StreamError::unavailable(stream_id, "gateway is shutting down"));
        }
        if streams.len() >= self.max_streams {
            return Err(StreamError::Capacity {
                stream_id: stream_id.to_string(),
                limit: self.max_streams,
            });
        }

        let entry = self.spawn_worker(config);
        Ok(streams.entry(stream_id.to_string()).or_insert(entry))
    }

    fn spawn_worker(&self, config: &StreamConfig) -> StreamEntry {
        let stream_id = config.stream_id.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.ctx.settings.mailbox_capacity.max(1));
        let token = self.root_token.child_token();
        let (status_tx, status_rx) = watch::channel(StreamStatus::new(&stream_id));
        let telemetry = Arc::new(StreamTelemetry::new());

        let worker = StreamWorker::new(
            WorkerSeed {
                stream_id: stream_id.clone(),
                config: config.clone(),
                mailbox: rx,
                status_tx,
                telemetry: telemetry.clone(),
                cancellation_token: token.clone(),
                registry: Arc::downgrade(&self.shared),
                generation,
            },
            self.ctx.clone(),
        );
        self.tasks.lock().spawn(worker.run());
        info!(stream_id = %stream_id, generation, "Spawned stream worker");

        StreamEntry {
            handle: WorkerHandle::new(stream_id, tx, token),
            config: config.clone(),
            status: status_rx,
            telemetry,
            generation,
            pending_stop: false,
        }
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.root_token.cancel();
    }
}

/// Drop an entry whose worker is gone so the id can be reused.
fn heal_locked(streams: &mut HashMap<String, StreamEntry>, stream_id: &str) {
    if streams
        .get(stream_id)
        .is_some_and(|entry| entry.handle.is_closed())
    {
        warn!(stream_id, "Worker mailbox closed, dropping stale entry");
        streams.remove(stream_id);
    }
}

fn existing_locked<'a>(
    streams: &'a mut HashMap<String, StreamEntry>,
    stream_id: &str,
) -> Result<&'a mut StreamEntry, StreamError> {
    heal_locked(streams, stream_id);
    streams
        .get_mut(stream_id)
        .ok_or_else(|| StreamError::unknown_stream(stream_id))
}

fn enqueue(entry: &StreamEntry, msg: StreamMessage) -> Result<(), StreamError> {
    entry.handle.try_send(msg).map_err(|e| match e {
        SendError::MailboxFull => {
            StreamError::unavailable(entry.handle.id(), "command queue is full, retry later")
        }
        SendError::WorkerStopped => StreamError::unavailable(entry.handle.id(), e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CountingSink, NoopInferenceEngine, SimulatedPipelineEngine};

    fn registry(max_streams: usize) -> (StreamRegistry, SimulatedPipelineEngine) {
        let engine = SimulatedPipelineEngine::new();
        let registry = StreamRegistry::new(
            max_streams,
            WorkerSettings::default(),
            Arc::new(engine.clone()),
            Arc::new(NoopInferenceEngine),
            Arc::new(CountingSink::new()),
        );
        (registry, engine)
    }

    fn config(id: &str) -> StreamConfig {
        StreamConfig::new(id, format!("rtsp://camera/{id}"))
    }

    async fn wait_for_state(registry: &StreamRegistry, id: &str, state: StreamState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if registry.snapshot(id).is_some_and(|s| s.state == state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_or_get_returns_same_worker() {
        let (registry, _) = registry(4);
        let first = registry.create_or_get(&config("cam1")).unwrap();
        let second = registry.create_or_get(&config("cam1")).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_config_rejected() {
        let (registry, _) = registry(4);
        registry.start(config("cam1")).unwrap();
        let err = registry.start(config("cam1").with_bitrate(512)).unwrap_err();
        assert_eq!(err.kind(), "conflicting_config");
    }

    #[tokio::test]
    async fn test_errored_stream_accepts_new_config() {
        let (registry, engine) = registry(4);
        engine.fail_all_acquires(Some("connection refused".to_string()));
        registry.start(config("cam1")).unwrap();
        wait_for_state(&registry, "cam1", StreamState::Error).await;

        engine.fail_all_acquires(None);
        registry.start(config("cam1").with_bitrate(512)).unwrap();
        wait_for_state(&registry, "cam1", StreamState::Running).await;
        assert_eq!(engine.acquired_configs().last().unwrap().bitrate_kbps, 512);
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let (registry, _) = registry(1);
        registry.start(config("cam1")).unwrap();
        let err = registry.start(config("cam2")).unwrap_err();
        assert_eq!(
            err,
            StreamError::Capacity {
                stream_id: "cam2".to_string(),
                limit: 1
            }
        );
        assert_eq!(registry.stream_ids(), vec!["cam1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_stream_for_stop_and_status() {
        let (registry, _) = registry(1);
        assert_eq!(registry.stop("ghost").unwrap_err().kind(), "unknown_stream");
        assert_eq!(registry.status("ghost").unwrap_err().kind(), "unknown_stream");
        assert!(!registry.remove("ghost"));
    }

    #[tokio::test]
    async fn test_stop_retires_entry() {
        let (registry, engine) = registry(2);
        registry.start(config("cam1")).unwrap();
        wait_for_state(&registry, "cam1", StreamState::Running).await;

        registry.stop("cam1").unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.contains("cam1") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(engine.active_handles(), 0);
    }

    #[tokio::test]
    async fn test_remove_only_idle_stopped_entries() {
        let (registry, _) = registry(2);
        registry.create_or_get(&config("cam1")).unwrap();
        assert!(registry.remove("cam1"));
        assert!(!registry.contains("cam1"));

        registry.start(config("cam2")).unwrap();
        wait_for_state(&registry, "cam2", StreamState::Running).await;
        assert!(!registry.remove("cam2"));
    }

    #[tokio::test]
    async fn test_snapshot_all_sorted() {
        let (registry, _) = registry(4);
        for id in ["cam3", "cam1", "cam2"] {
            registry.start(config(id)).unwrap();
        }
        let ids: Vec<String> = registry
            .snapshot_all()
            .into_iter()
            .map(|s| s.stream_id)
            .collect();
        assert_eq!(ids, vec!["cam1", "cam2", "cam3"]);
    }

    #[tokio::test]
    async fn test_cancelled_worker_is_healed() {
        let (registry, _) = registry(1);
        let handle = registry.create_or_get(&config("cam1")).unwrap();
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        registry.start(config("cam1")).unwrap();
        wait_for_state(&registry, "cam1", StreamState::Running).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (registry, engine) = registry(4);
        registry.start(config("cam1")).unwrap();
        registry.start(config("cam2")).unwrap();
        wait_for_state(&registry, "cam1", StreamState::Running).await;
        wait_for_state(&registry, "cam2", StreamState::Running).await;

        let report = registry.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.total_workers, 2);
        assert_eq!(report.graceful_stops, 2);
        assert_eq!(report.forced_terminations, 0);
        assert!(registry.is_empty());
        assert_eq!(engine.active_handles(), 0);

        let err = registry.start(config("cam3")).unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }
}
