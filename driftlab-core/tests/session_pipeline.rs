use std::f32::consts::PI;
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::{Duration, Instant};

use driftlab_core::buffering::MeteringProducer;
use driftlab_core::ipc::events::{EngineStatus, EngineStatusEvent, EventType};
use driftlab_core::{
    DriftError, EngineConfig, MeteringSource, ReplayHandle, ReplaySource, SessionConfig,
    SleepEngine,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

struct DeniedSource;

impl MeteringSource for DeniedSource {
    fn start(
        &mut self,
        _producer: MeteringProducer,
        _running: Arc<AtomicBool>,
    ) -> driftlab_core::Result<()> {
        Err(DriftError::PermissionDenied)
    }

    fn rotate(&mut self) -> driftlab_core::Result<Option<std::path::PathBuf>> {
        Ok(None)
    }

    fn stop(&mut self) {}

    fn describe(&self) -> String {
        "denied".into()
    }
}

fn quiet(seconds: usize) -> Vec<f32> {
    vec![30.0; seconds * 10]
}

/// One 1 s bump to 40 dB every 5 s on a 30 dB floor.
fn snoring(seconds: usize) -> Vec<f32> {
    (0..seconds * 10)
        .map(|i| if i % 50 < 10 { 40.0 } else { 30.0 })
        .collect()
}

fn breathing(bpm: f32, seconds: usize) -> Vec<f32> {
    (0..seconds * 10)
        .map(|i| 30.0 + 2.5 * (2.0 * PI * (bpm / 60.0) * (i as f32 / 10.0)).sin())
        .collect()
}

fn wait_until_analysed(engine: &SleepEngine, handle: &ReplayHandle, total: usize) {
    let start = Instant::now();
    while !handle.is_finished() || engine.pipeline_diagnostics_snapshot().samples_in < total {
        if start.elapsed() >= Duration::from_secs(10) {
            panic!(
                "timed out: analysed {} of {total}",
                engine.pipeline_diagnostics_snapshot().samples_in
            );
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn drain_status(rx: &mut broadcast::Receiver<EngineStatusEvent>) -> Vec<EngineStatus> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev.status),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
        }
    }
}

fn session(id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(id);
    config.smart_fade_enabled = false;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snoring_is_reported_once_per_cooldown() {
    let engine = SleepEngine::new(EngineConfig::default()).expect("engine");
    let mut script = quiet(60);
    script.extend(snoring(150));
    script.extend(quiet(30));
    let total = script.len();

    let replay = ReplaySource::from_values(script);
    let handle = replay.handle();
    engine
        .start(session("snore-night"), Box::new(replay))
        .expect("replay source opens");
    wait_until_analysed(&engine, &handle, total);
    let report = engine.stop().expect("session report");

    let snores: Vec<_> = report
        .events
        .iter()
        .filter(|e| e.kind == EventType::Snoring)
        .collect();
    assert_eq!(snores.len(), 1, "events: {:?}", report.events);
    assert_eq!(report.events.len(), 1);
    assert_eq!(snores[0].id, "snore-night-0");
    assert!(snores[0].confidence >= 0.5 && snores[0].confidence <= 0.9);

    let diagnostics = engine.pipeline_diagnostics_snapshot();
    assert_eq!(diagnostics.events_emitted, 1);
    assert!(diagnostics.detections_suppressed >= 4);
    assert_eq!(report.samples_analyzed, total as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_analyses_the_partial_final_breathing_window() {
    let engine = SleepEngine::new(EngineConfig::default()).expect("engine");
    let script = breathing(12.0, 90);
    let total = script.len();

    let replay = ReplaySource::from_values(script);
    let handle = replay.handle();
    engine
        .start(session("breath-night"), Box::new(replay))
        .expect("replay source opens");
    wait_until_analysed(&engine, &handle, total);
    let report = engine.stop().expect("session report");

    let trend = &report.breath_trend;
    assert_eq!(trend.snapshots.len(), 2);
    assert_eq!(trend.snapshots[0].offset_ms, 60_000);
    assert_eq!(trend.snapshots[1].offset_ms, 90_000);
    assert!((trend.avg_breathing_rate - 12.0).abs() <= 0.5);
    assert_eq!(trend.disturbance_count, 0);

    let efficiency = report.sleep_efficiency.expect("sonar enabled by default");
    assert!((efficiency.total_time_in_bed_minutes - 1.5).abs() < 1e-9);
    assert_eq!(efficiency.movement_timeline.len(), 18);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_statuses_and_double_start() {
    let engine = SleepEngine::new(EngineConfig::default()).expect("engine");
    let mut status_rx = engine.subscribe_status();

    let replay = ReplaySource::from_values(quiet(5));
    let handle = replay.handle();
    engine
        .start(session("life"), Box::new(replay))
        .expect("first start");
    assert!(engine.is_running());

    let second = engine.start(session("life-2"), Box::new(ReplaySource::from_values(quiet(1))));
    assert!(matches!(second, Err(DriftError::AlreadyRunning)));

    wait_until_analysed(&engine, &handle, 50);
    let report = engine.stop().expect("report");
    assert_eq!(report.session_id, "life");
    assert!(report.ended_at >= report.started_at);
    assert!(!engine.is_running());
    assert_eq!(engine.status(), EngineStatus::Stopped);

    assert_eq!(
        drain_status(&mut status_rx),
        vec![
            EngineStatus::Starting,
            EngineStatus::Recording,
            EngineStatus::Stopping,
            EngineStatus::Stopped,
        ]
    );
    assert!(matches!(engine.stop(), Err(DriftError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_source_fails_start_and_engine_recovers() {
    let engine = SleepEngine::new(EngineConfig::default()).expect("engine");

    let err = engine
        .start(session("denied"), Box::new(DeniedSource))
        .expect_err("permission denied");
    assert!(err.is_fatal());
    assert!(!engine.is_running());
    assert_eq!(engine.status(), EngineStatus::Error);

    let replay = ReplaySource::from_values(quiet(2));
    let handle = replay.handle();
    engine
        .start(session("retry"), Box::new(replay))
        .expect("engine usable after a failed start");
    wait_until_analysed(&engine, &handle, 20);
    assert_eq!(engine.stop().expect("report").samples_analyzed, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sensor_readings_become_partner_and_climate_events() {
    let engine = SleepEngine::new(EngineConfig::default()).expect("engine");
    let mut events = engine.subscribe_events();
    let mut config = session("sensors");
    config.thermostat_f = Some(68.0);

    let replay = ReplaySource::from_values(quiet(10));
    let handle = replay.handle();
    engine.start(config, Box::new(replay)).expect("start");
    wait_until_analysed(&engine, &handle, 100);

    engine
        .submit_sensor(driftlab_core::SensorInput::Accelerometer {
            x: 0.3,
            y: 0.0,
            z: 1.2,
        })
        .expect("sensor accepted");
    engine
        .submit_sensor(
            serde_json::from_str(r#"{"sensor":"event","type":"temp_high","value":74.0,"severity":"medium"}"#)
                .expect("sensor json"),
        )
        .expect("sensor accepted");

    let start = Instant::now();
    let mut received = Vec::new();
    while received.len() < 2 {
        match events.try_recv() {
            Ok(ev) => received.push(ev),
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= Duration::from_secs(2) {
                    panic!("timed out waiting for sensor events");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("event channel error: {e}"),
        }
    }
    let report = engine.stop().expect("report");

    assert_eq!(received[0].kind, EventType::Movement);
    assert_eq!(received[1].kind, EventType::TempHigh);
    assert_eq!(
        serde_json::to_value(&received[1].reading).expect("reading json")["deltaF"],
        serde_json::json!(6.0)
    );
    assert_eq!(report.events, received);
}
