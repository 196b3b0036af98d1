//! Scoped ownership of an acquired pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EngineError, MediaSink, PipelineEngine, PipelineHandle};
use crate::domain::StreamConfig;

/// An acquired pipeline plus the tasks feeding off it.
///
/// Call [`PipelineLease::release`] to tear down in order. Dropping an
/// unreleased lease still releases it on the current runtime.
pub struct PipelineLease {
    lease_id: u64,
    handle: PipelineHandle,
    pipeline: Arc<dyn PipelineEngine>,
    sink: Arc<dyn MediaSink>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    released: bool,
}

impl PipelineLease {
    /// Acquire a pipeline, giving up after `timeout`.
    ///
    /// On timeout the acquisition keeps running in the background and any
    /// handle it eventually yields is released immediately.
    pub async fn acquire(
        lease_id: u64,
        pipeline: Arc<dyn PipelineEngine>,
        sink: Arc<dyn MediaSink>,
        config: &StreamConfig,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let mut task = {
            let pipeline = pipeline.clone();
            let config = config.clone();
            tokio::spawn(async move { pipeline.acquire(&config).await })
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(handle))) => Ok(Self {
                lease_id,
                handle,
                pipeline,
                sink,
                token: CancellationToken::new(),
                tasks: Vec::new(),
                released: false,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => Err(EngineError::permanent(format!(
                "pipeline acquisition aborted: {join_err}"
            ))),
            Err(_) => {
                let stream_id = config.stream_id.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = task.await {
                        warn!(stream_id = %stream_id, pipeline = handle.id(), "Releasing pipeline acquired after timeout");
                        pipeline.release(&handle).await;
                    }
                });
                Err(EngineError::transient(format!(
                    "pipeline acquisition timed out after {} ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    pub fn lease_id(&self) -> u64 {
        self.lease_id
    }

    pub fn handle(&self) -> &PipelineHandle {
        &self.handle
    }

    pub fn pipeline(&self) -> &Arc<dyn PipelineEngine> {
        &self.pipeline
    }

    pub fn sink(&self) -> &Arc<dyn MediaSink> {
        &self.sink
    }

    /// Token cancelled when the lease is released.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Tie a task's lifetime to this lease.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop attached tasks, close the sink, then release the pipeline.
    pub async fn release(mut self) {
        self.released = true;
        self.token.cancel();
        self.sink.close(&self.handle).await;
        self.pipeline.release(&self.handle).await;
        for task in self.tasks.drain(..) {
            if !task.is_finished() {
                task.abort();
            }
        }
        debug!(stream_id = %self.handle.stream_id(), lease = self.lease_id, "Pipeline lease released");
    }
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.token.cancel();
        for task in &self.tasks {
            task.abort();
        }

        let handle = self.handle.clone();
        let pipeline = self.pipeline.clone();
        let sink = self.sink.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    sink.close(&handle).await;
                    pipeline.release(&handle).await;
                });
            }
            Err(_) => {
                warn!(stream_id = %self.handle.stream_id(), "Pipeline lease dropped outside a runtime; handle leaked");
            }
        }
    }
}
