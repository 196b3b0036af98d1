//! Wiring of a freshly acquired pipeline: failure callbacks, fragment
//! forwarding to the sink and frame sampling for inference.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::messages::{FailureSource, WorkerEvent};
use super::telemetry::StreamTelemetry;
use crate::config::InferenceConfig;
use crate::domain::{Detection, StreamConfig};
use crate::engine::{
    EngineError, FailureCallback, Fragment, FragmentCallback, Frame, InferenceEngine, MediaSink,
    PipelineHandle, PipelineLease,
};
use crate::metrics::RateMeter;

/// Fragments buffered between the pipeline callback and the sink.
const FRAGMENT_QUEUE: usize = 64;

pub(crate) struct MediaContext {
    pub stream: StreamConfig,
    pub inference: Arc<dyn InferenceEngine>,
    pub settings: InferenceConfig,
    pub telemetry: Arc<StreamTelemetry>,
    pub events: mpsc::Sender<WorkerEvent>,
}

impl MediaContext {
    fn inference_enabled(&self) -> bool {
        self.settings.enabled && self.stream.cv_enabled
    }
}

/// Attach callbacks and tasks to `lease`, then signal the sink ready.
pub(crate) async fn activate(lease: &mut PipelineLease, ctx: MediaContext) -> Result<(), EngineError> {
    let handle = lease.handle().clone();
    let lease_id = lease.lease_id();

    lease.pipeline().register_failure_callback(
        &handle,
        failure_callback(ctx.events.clone(), lease_id, FailureSource::Pipeline),
    );
    let sink_failure = failure_callback(ctx.events.clone(), lease_id, FailureSource::Sink);
    lease
        .sink()
        .register_failure_callback(&handle, sink_failure.clone());

    let (fragment_tx, fragment_rx) = mpsc::channel::<Fragment>(FRAGMENT_QUEUE);
    lease
        .pipeline()
        .register_fragment_callback(&handle, fragment_intake(ctx.telemetry.clone(), fragment_tx));
    let forwarder = tokio::spawn(forward_fragments(
        lease.sink().clone(),
        handle.clone(),
        fragment_rx,
        ctx.telemetry.clone(),
        sink_failure,
        lease.token(),
    ));
    lease.attach(forwarder);

    if ctx.inference_enabled() {
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(ctx.settings.frame_queue.max(1));
        lease
            .pipeline()
            .submit_frame_callback(&handle, frame_sampler(&ctx, frame_tx));
        let token = lease.token();
        let task = tokio::spawn(run_inference(ctx, frame_rx, token));
        lease.attach(task);
    }

    lease.sink().signal_ready(&handle).await
}

fn failure_callback(
    events: mpsc::Sender<WorkerEvent>,
    lease_id: u64,
    source: FailureSource,
) -> FailureCallback {
    Arc::new(move |reason: String| {
        let event = WorkerEvent::TransportFailure {
            lease_id,
            source,
            reason,
        };
        if events.try_send(event).is_err() {
            debug!(lease = lease_id, %source, "Failure notification dropped, worker busy or gone");
        }
    })
}

/// Measures the input rate of everything the pipeline emits and queues it
/// for the sink, dropping the newest fragment when the queue is full.
fn fragment_intake(
    telemetry: Arc<StreamTelemetry>,
    fragments: mpsc::Sender<Fragment>,
) -> FragmentCallback {
    let meter = Mutex::new(RateMeter::new());

    Arc::new(move |fragment: Fragment| {
        if let Some(rate) = meter.lock().record(fragment.data.len()) {
            telemetry.metrics.set_fps_input(rate.per_second);
        }
        if fragments.try_send(fragment).is_err() {
            trace!("Fragment queue full, dropping fragment");
        }
    })
}

/// Queues every `skip_frames + 1`-th frame for inference, dropping the
/// newest frame when the queue is full.
fn frame_sampler(ctx: &MediaContext, frames: mpsc::Sender<Frame>) -> crate::engine::FrameCallback {
    let stride = ctx.settings.skip_frames as u64 + 1;
    let telemetry = ctx.telemetry.clone();
    let stream_id = ctx.stream.stream_id.clone();
    let seen = AtomicU64::new(0);

    Arc::new(move |frame: Frame| {
        if seen.fetch_add(1, Ordering::Relaxed) % stride != 0 {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = frames.try_send(frame) {
            let dropped = telemetry.record_dropped_frame();
            if dropped % 100 == 1 {
                debug!(stream_id = %stream_id, dropped, "Inference queue full, dropping frames");
            }
        }
    })
}

async fn forward_fragments(
    sink: Arc<dyn MediaSink>,
    handle: PipelineHandle,
    mut fragments: mpsc::Receiver<Fragment>,
    telemetry: Arc<StreamTelemetry>,
    on_failure: FailureCallback,
    token: CancellationToken,
) {
    let mut meter = RateMeter::new();
    loop {
        let fragment = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            fragment = fragments.recv() => match fragment {
                Some(fragment) => fragment,
                None => break,
            },
        };

        let len = fragment.data.len();
        if let Err(e) = sink.push_fragment(&handle, fragment.data).await {
            warn!(stream_id = %handle.stream_id(), error = %e, "Sink rejected fragment");
            on_failure(e.message);
            break;
        }
        if let Some(rate) = meter.record(len) {
            telemetry.metrics.set_output(rate.per_second, rate.kbps);
        }
    }
}

async fn run_inference(ctx: MediaContext, mut frames: mpsc::Receiver<Frame>, token: CancellationToken) {
    let timeout = ctx.settings.timeout();
    let threshold = ctx.stream.confidence_threshold;
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = tokio::time::timeout(timeout, ctx.inference.infer(&ctx.stream.cv_model, &frame)) => result,
        };

        match result {
            Ok(Ok(detections)) => {
                let detections = filter_detections(
                    detections,
                    &ctx.stream,
                    threshold,
                    ctx.settings.max_detections,
                );
                ctx.telemetry
                    .metrics
                    .record_inference(started.elapsed(), detections.len());
                ctx.telemetry.replace_detections(detections);
            }
            Ok(Err(e)) => {
                debug!(stream_id = %ctx.stream.stream_id, error = %e, transient = e.transient, "Inference failed");
            }
            Err(_) => {
                debug!(stream_id = %ctx.stream.stream_id, timeout_ms = timeout.as_millis() as u64, "Inference timed out");
            }
        }
    }
}

fn filter_detections(
    detections: Vec<Detection>,
    stream: &StreamConfig,
    threshold: f64,
    max: usize,
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| f64::from(d.confidence) >= threshold && stream.accepts_class(&d.class_name))
        .take(max)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BoundingBox;

    #[test]
    fn test_filter_by_threshold_class_and_bound() {
        let mut stream = StreamConfig::new("cam1", "rtsp://camera/stream").with_inference("yolov5s", 0.5);
        stream.classes_filter = vec!["person".to_string()];
        let detections = vec![
            Detection::new("person", 0.9, BoundingBox::default()),
            Detection::new("person", 0.2, BoundingBox::default()),
            Detection::new("car", 0.95, BoundingBox::default()),
            Detection::new("person", 0.7, BoundingBox::default()),
            Detection::new("person", 0.6, BoundingBox::default()),
        ];

        let kept = filter_detections(detections, &stream, 0.5, 2);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|d| d.class_name == "person" && d.confidence >= 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragment_intake_meters_input_rate() {
        let telemetry = Arc::new(StreamTelemetry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let intake = fragment_intake(telemetry.clone(), tx);
        let fragment = |sequence| Fragment {
            sequence,
            timestamp_ms: 0,
            keyframe: sequence == 0,
            data: bytes::Bytes::from_static(&[0u8; 125]),
        };

        for sequence in 0..4 {
            intake(fragment(sequence));
            tokio::time::advance(std::time::Duration::from_millis(250)).await;
        }
        assert_eq!(telemetry.metrics.snapshot().fps_input, 0.0);

        intake(fragment(4));
        assert_eq!(telemetry.metrics.snapshot().fps_input, 5.0);
        for sequence in 0..5 {
            assert_eq!(rx.try_recv().unwrap().sequence, sequence);
        }
    }

    #[test]
    fn test_frame_sampler_strides_and_drops() {
        let (events, _events_rx) = mpsc::channel(1);
        let ctx = MediaContext {
            stream: StreamConfig::new("cam1", "rtsp://camera/stream"),
            inference: Arc::new(crate::engine::NoopInferenceEngine),
            settings: InferenceConfig {
                skip_frames: 2,
                frame_queue: 2,
                ..Default::default()
            },
            telemetry: Arc::new(StreamTelemetry::new()),
            events,
        };
        let (tx, mut rx) = mpsc::channel(2);
        let sampler = frame_sampler(&ctx, tx);

        for sequence in 0..9 {
            sampler(Frame {
                sequence,
                pts_ms: 0,
                width: 1,
                height: 1,
                data: bytes::Bytes::new(),
            });
        }

        // frames 0, 3 and 6 are sampled; the queue holds two of them
        assert_eq!(rx.try_recv().unwrap().sequence, 0);
        assert_eq!(rx.try_recv().unwrap().sequence, 3);
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.telemetry.frames_dropped(), 1);
    }
}
