//! End-to-end lifecycle tests for the orchestrator.
//!
//! Every collaborator is simulated in-process; every wait is bounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use rtsp_gateway::config::{AppConfig, TopicsConfig};
use rtsp_gateway::domain::{MqttCommand, ReconnectPolicy, StreamConfig, StreamState, StreamStatus};
use rtsp_gateway::engine::{
    Collaborators, CountingSink, LoopbackChannel, NoopInferenceEngine, SimulatedInferenceEngine,
    SimulatedPipelineEngine,
};
use rtsp_gateway::error::StreamError;
use rtsp_gateway::orchestrator::{Orchestrator, StreamEvent};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    orchestrator: Arc<Orchestrator>,
    pipeline: SimulatedPipelineEngine,
    sink: Arc<CountingSink>,
    channel: Arc<LoopbackChannel>,
}

fn harness(config: AppConfig) -> Harness {
    let pipeline = SimulatedPipelineEngine::new();
    let sink = Arc::new(CountingSink::new());
    let channel = Arc::new(LoopbackChannel::new());
    let collaborators = Collaborators {
        pipeline: Arc::new(pipeline.clone()),
        inference: Arc::new(NoopInferenceEngine),
        sink: sink.clone(),
        channel: channel.clone(),
    };
    Harness {
        orchestrator: Arc::new(Orchestrator::new(config, collaborators).unwrap()),
        pipeline,
        sink,
        channel,
    }
}

fn app_config(max_streams: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.max_concurrent_streams = max_streams;
    config.orchestrator.reconnect = ReconnectPolicy::fixed(3, 10);
    config.orchestrator.status_interval_ms = 20;
    config
}

fn stream(id: &str) -> StreamConfig {
    StreamConfig::new(id, format!("rtsp://10.0.0.5/{id}"))
}

async fn wait_for_status(
    orchestrator: &Orchestrator,
    id: &str,
    predicate: impl Fn(&StreamStatus) -> bool,
) -> StreamStatus {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(status) = orchestrator.registry().snapshot(id)
                && predicate(&status)
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

async fn wait_for_state(orchestrator: &Orchestrator, id: &str, state: StreamState) -> StreamStatus {
    wait_for_status(orchestrator, id, |s| s.state == state).await
}

async fn wait_until_removed(orchestrator: &Orchestrator, id: &str) {
    tokio::time::timeout(WAIT, async {
        while orchestrator.registry().contains(id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Collect events until one matches `last`.
async fn events_until(
    events: &mut broadcast::Receiver<StreamEvent>,
    last: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let done = last(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .unwrap()
}

fn transitions(events: &[StreamEvent]) -> Vec<(StreamState, StreamState)> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::StateChanged { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn start_then_stop_walks_the_lifecycle_and_removes_the_entry() {
    let h = harness(app_config(4));
    let mut events = h.orchestrator.subscribe_events();

    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    let running = wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    assert!(running.start_time.is_some());
    assert!(running.error_message.is_empty());
    assert_eq!(h.sink.ready_signals(), 1);

    h.orchestrator
        .handle_command(MqttCommand::stop("cam1"))
        .unwrap();
    let seen = events_until(&mut events, |e| matches!(e, StreamEvent::Retired { .. })).await;

    assert_eq!(
        transitions(&seen),
        vec![
            (StreamState::Stopped, StreamState::Starting),
            (StreamState::Starting, StreamState::Running),
            (StreamState::Running, StreamState::Stopping),
            (StreamState::Stopping, StreamState::Stopped),
        ]
    );
    wait_until_removed(&h.orchestrator, "cam1").await;
    assert_eq!(h.pipeline.active_handles(), 0);
    assert_eq!(h.pipeline.release_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_starts_create_one_worker() {
    let h = harness(app_config(4));
    let barrier = Arc::new(tokio::sync::Barrier::new(10));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let orchestrator = h.orchestrator.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            orchestrator.handle_command(MqttCommand::start(stream("cam1")))
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    // the status query is answered after all ten starts were applied
    let status = h.orchestrator.query_status("cam1").await.unwrap();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!(h.orchestrator.registry().len(), 1);
    assert_eq!(h.pipeline.acquire_calls(), 1);
    assert_eq!(h.pipeline.active_for("cam1"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_starts_of_distinct_streams_respect_capacity() {
    let h = harness(app_config(3));
    let barrier = Arc::new(tokio::sync::Barrier::new(10));

    let mut tasks = Vec::new();
    for i in 0..10 {
        let orchestrator = h.orchestrator.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            orchestrator.handle_command(MqttCommand::start(stream(&format!("cam{i}"))))
        }));
    }

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(e) => assert_eq!(e.kind(), "at_capacity"),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(h.orchestrator.registry().len(), 3);

    for id in h.orchestrator.registry().stream_ids() {
        wait_for_state(&h.orchestrator, &id, StreamState::Running).await;
    }
    assert_eq!(h.pipeline.active_handles(), 3);

    let report = h.orchestrator.stop().await;
    assert_eq!(report.total_workers, 3);
    assert_eq!(h.pipeline.active_handles(), 0);
}

#[tokio::test]
async fn capacity_rejects_the_extra_stream_without_creating_it() {
    let h = harness(app_config(1));

    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    let err = h
        .orchestrator
        .handle_command(MqttCommand::start(stream("cam2")))
        .unwrap_err();

    assert_eq!(err.kind(), "at_capacity");
    assert_eq!(err.stream_id(), "cam2");
    assert_eq!(h.orchestrator.registry().stream_ids(), vec!["cam1".to_string()]);
}

#[tokio::test]
async fn configures_apply_in_submission_order() {
    let h = harness(app_config(4));

    for bitrate in [1000, 2000, 3000] {
        h.orchestrator
            .handle_command(MqttCommand::configure(stream("cam1").with_bitrate(bitrate)))
            .unwrap();
    }

    let status = h.orchestrator.query_status("cam1").await.unwrap();
    assert_eq!(status.state, StreamState::Running);

    let bitrates: Vec<u32> = h
        .pipeline
        .acquired_configs()
        .iter()
        .map(|c| c.bitrate_kbps)
        .collect();
    assert_eq!(bitrates, vec![1000, 2000, 3000]);
    assert_eq!(h.pipeline.active_for("cam1"), 1);
}

#[tokio::test]
async fn configure_while_running_tears_down_and_reacquires() {
    let h = harness(app_config(4));
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    let mut events = h.orchestrator.subscribe_events();

    h.orchestrator
        .handle_command(MqttCommand::configure(stream("cam1").with_bitrate(512)))
        .unwrap();
    let seen = events_until(&mut events, |e| {
        matches!(e, StreamEvent::StateChanged { to: StreamState::Running, .. })
    })
    .await;

    assert_eq!(
        transitions(&seen),
        vec![
            (StreamState::Running, StreamState::Stopping),
            (StreamState::Stopping, StreamState::Stopped),
            (StreamState::Stopped, StreamState::Starting),
            (StreamState::Starting, StreamState::Running),
        ]
    );
    assert_eq!(h.pipeline.release_calls(), 1);
    assert_eq!(h.pipeline.acquire_calls(), 2);
    assert_eq!(h.pipeline.active_for("cam1"), 1);
    assert_eq!(
        h.pipeline.acquired_configs().last().map(|c| c.bitrate_kbps),
        Some(512)
    );
}

#[tokio::test]
async fn stop_on_a_stopped_stream_changes_nothing() {
    let h = harness(app_config(4));
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    let mut events = h.orchestrator.subscribe_events();

    // both stops are queued before the worker runs again
    h.orchestrator
        .handle_command(MqttCommand::stop("cam1"))
        .unwrap();
    h.orchestrator
        .handle_command(MqttCommand::stop("cam1"))
        .unwrap();

    let seen = events_until(&mut events, |e| matches!(e, StreamEvent::Retired { .. })).await;
    assert_eq!(
        transitions(&seen),
        vec![
            (StreamState::Running, StreamState::Stopping),
            (StreamState::Stopping, StreamState::Stopped),
        ]
    );
    assert_eq!(h.pipeline.release_calls(), 1);
}

#[tokio::test]
async fn stop_and_status_for_unknown_stream_are_rejected() {
    let h = harness(app_config(4));
    let err = h
        .orchestrator
        .handle_command(MqttCommand::stop("ghost"))
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_stream");
    assert_eq!(
        h.orchestrator.query_status("ghost").await.unwrap_err().kind(),
        "unknown_stream"
    );
    assert!(h.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn acquisition_failure_surfaces_verbatim_in_error_state() {
    let h = harness(app_config(4));
    h.pipeline.fail_next_acquires(1, "no route to camera 10.0.0.5");

    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    let status = wait_for_state(&h.orchestrator, "cam1", StreamState::Error).await;
    assert_eq!(status.error_message, "no route to camera 10.0.0.5");
    assert_eq!(
        status.last_error,
        Some(StreamError::resource("cam1", "no route to camera 10.0.0.5"))
    );

    // a fresh start from ERROR clears the message
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    let status = wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    assert!(status.error_message.is_empty());
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn exhausted_reconnect_budget_ends_in_error() {
    let h = harness(app_config(4));
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    let mut events = h.orchestrator.subscribe_events();

    h.pipeline
        .fail_all_acquires(Some("camera unreachable".to_string()));
    assert!(h.pipeline.inject_failure("cam1", "connection reset by peer"));

    let seen = events_until(&mut events, |e| {
        matches!(e, StreamEvent::StateChanged { to: StreamState::Error, .. })
    })
    .await;

    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ReconnectAttempt { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(h.pipeline.acquire_calls(), 4);
    assert_eq!(h.pipeline.active_for("cam1"), 0);

    let status = h.orchestrator.registry().snapshot("cam1").unwrap();
    assert_eq!(status.state, StreamState::Error);
    assert!(!status.error_message.is_empty());
    assert!(status.error_message.contains("camera unreachable"));
}

#[tokio::test]
async fn transient_failure_recovers_without_leaking_handles() {
    let h = harness(app_config(4));
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    let mut events = h.orchestrator.subscribe_events();

    h.pipeline.fail_next_acquires(2, "camera rebooting");
    assert!(h.pipeline.inject_failure("cam1", "stream ended"));

    let seen = events_until(&mut events, |e| {
        matches!(e, StreamEvent::StateChanged { to: StreamState::Running, .. })
    })
    .await;
    assert_eq!(
        transitions(&seen),
        vec![
            (StreamState::Running, StreamState::Reconnecting),
            (StreamState::Reconnecting, StreamState::Running),
        ]
    );

    let status = h.orchestrator.registry().snapshot("cam1").unwrap();
    assert!(status.error_message.is_empty());
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(h.pipeline.active_handles(), 1);
    assert_eq!(h.pipeline.acquire_calls(), 4);
}

#[tokio::test]
async fn sink_failure_also_triggers_reconnect() {
    let h = harness(app_config(4));
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    let mut events = h.orchestrator.subscribe_events();

    assert!(h.sink.inject_failure("cam1", "upload token expired"));
    let seen = events_until(&mut events, |e| {
        matches!(e, StreamEvent::StateChanged { to: StreamState::Running, .. })
    })
    .await;
    assert_eq!(transitions(&seen)[0], (StreamState::Running, StreamState::Reconnecting));
    assert_eq!(h.pipeline.active_for("cam1"), 1);

    let failure = seen.iter().find_map(|e| match e {
        StreamEvent::Failed { error, .. } => Some(error.clone()),
        _ => None,
    });
    assert_eq!(
        failure,
        Some(StreamError::transport("cam1", "upload token expired"))
    );
}

#[tokio::test]
async fn stop_during_starting_runs_after_the_start_completes() {
    let h = harness(app_config(4));
    h.pipeline.set_acquire_delay(Duration::from_millis(100));
    let mut events = h.orchestrator.subscribe_events();

    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Starting).await;
    h.orchestrator
        .handle_command(MqttCommand::stop("cam1"))
        .unwrap();

    let seen = events_until(&mut events, |e| matches!(e, StreamEvent::Retired { .. })).await;
    assert_eq!(
        transitions(&seen),
        vec![
            (StreamState::Stopped, StreamState::Starting),
            (StreamState::Starting, StreamState::Running),
            (StreamState::Running, StreamState::Stopping),
            (StreamState::Stopping, StreamState::Stopped),
        ]
    );
    wait_until_removed(&h.orchestrator, "cam1").await;
    assert_eq!(h.pipeline.active_handles(), 0);
}

#[tokio::test]
async fn acquisition_timeout_ends_in_error_and_releases_the_late_handle() {
    let mut config = app_config(4);
    config.orchestrator.acquire_timeout_ms = 50;
    let h = harness(config);
    h.pipeline.set_acquire_delay(Duration::from_millis(200));

    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    let status = wait_for_state(&h.orchestrator, "cam1", StreamState::Error).await;
    assert!(status.error_message.contains("timed out"));
    assert_eq!(
        status.last_error.as_ref().map(StreamError::kind),
        Some("resource_error")
    );

    // the acquisition finishes after the deadline and is handed straight back
    tokio::time::timeout(WAIT, async {
        while h.pipeline.release_calls() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(h.pipeline.acquire_calls(), 1);
    assert_eq!(h.pipeline.active_handles(), 0);
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_back_off_exponentially() {
    let mut config = app_config(4);
    config.orchestrator.reconnect = ReconnectPolicy {
        max_attempts: 3,
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        backoff_multiplier: 2.0,
        use_jitter: false,
    };
    let h = harness(config);
    h.orchestrator
        .handle_command(MqttCommand::start(stream("cam1")))
        .unwrap();
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;
    let mut events = h.orchestrator.subscribe_events();

    h.pipeline
        .fail_all_acquires(Some("camera unreachable".to_string()));
    let failed_at = Instant::now();
    assert!(h.pipeline.inject_failure("cam1", "connection reset by peer"));

    let mut attempt_times = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                StreamEvent::ReconnectAttempt { .. } => attempt_times.push(Instant::now()),
                StreamEvent::StateChanged { to: StreamState::Error, .. } => break,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    let mut previous = failed_at;
    let mut gaps = Vec::new();
    for at in attempt_times {
        gaps.push(at - previous);
        previous = at;
    }
    assert_eq!(gaps.len(), 3);
    for (gap, expected_ms) in gaps.iter().zip([100u64, 200, 400]) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(50),
            "gap {gap:?}, expected about {expected:?}"
        );
    }
    assert_eq!(h.pipeline.active_for("cam1"), 0);
}

#[tokio::test]
async fn snapshot_all_during_transitions_returns_whole_statuses() {
    let h = harness(app_config(8));
    h.pipeline.set_acquire_delay(Duration::from_millis(5));

    for i in 0..4 {
        h.orchestrator
            .handle_command(MqttCommand::start(stream(&format!("cam{i}"))))
            .unwrap();
    }
    for _ in 0..20 {
        for status in h.orchestrator.snapshot_all() {
            assert!(status.stream_id.starts_with("cam"));
            match status.state {
                StreamState::Running => assert!(status.start_time.is_some()),
                StreamState::Stopped | StreamState::Starting => {
                    assert!(status.start_time.is_none())
                }
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn control_channel_round_trip() {
    let h = harness(app_config(4));
    h.orchestrator.start().unwrap();
    let topics = TopicsConfig::default();

    h.channel.inject(
        topics.command.clone(),
        r#"{"command":"start","stream_id":"cam1","config":{"rtsp_url":"rtsp://10.0.0.5/cam1","kvs_stream_name":"cam1"}}"#,
    );
    wait_for_state(&h.orchestrator, "cam1", StreamState::Running).await;

    let reply = h.channel.last_json(&topics.response).unwrap();
    assert_eq!(reply["accepted"], true);

    let status = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(status) = h.channel.last_json(&topics.status)
                && status["active_streams"] == 1
                && status["streams"][0]["state"] == "RUNNING"
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status["healthy"], true);
    assert!(h.channel.last_json(&topics.health).is_some());
    assert!(h.channel.last_json(&topics.metrics).is_some());

    let report = h.orchestrator.stop().await;
    assert_eq!(report.total_workers, 1);
    assert_eq!(report.graceful_stops, 1);
    assert_eq!(h.pipeline.active_handles(), 0);
}

#[tokio::test]
async fn inference_detections_reach_the_status() {
    let pipeline = SimulatedPipelineEngine::new();
    let mut config = app_config(4);
    config.inference.skip_frames = 0;
    let collaborators = Collaborators {
        pipeline: Arc::new(pipeline.clone()),
        inference: Arc::new(SimulatedInferenceEngine::street_scene()),
        sink: Arc::new(CountingSink::new()),
        channel: Arc::new(LoopbackChannel::new()),
    };
    let orchestrator = Orchestrator::new(config, collaborators).unwrap();

    orchestrator
        .handle_command(MqttCommand::start(
            stream("cam1").with_inference("yolov5s", 0.5),
        ))
        .unwrap();
    wait_for_state(&orchestrator, "cam1", StreamState::Running).await;

    let status = tokio::time::timeout(WAIT, async {
        let mut sequence = 0;
        loop {
            pipeline.emit_frame(
                "cam1",
                rtsp_gateway::engine::Frame {
                    sequence,
                    pts_ms: sequence * 33,
                    width: 1920,
                    height: 1080,
                    data: bytes::Bytes::from_static(&[0u8; 16]),
                },
            );
            sequence += 1;
            let status = orchestrator.registry().snapshot("cam1").unwrap();
            if !status.last_detections.is_empty() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(status.last_detections.iter().all(|d| d.confidence >= 0.5));
    assert!(status.metrics.objects_detected > 0);
}
