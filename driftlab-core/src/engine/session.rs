//! One night of analysis, driven by the metering sample clock.
//!
//! Every metering value advances session time by one sample period. The
//! periodic analyses fire on sample-count boundaries, always in this order
//! within one sample:
//!
//! | cadence     | analysis                                         |
//! |-------------|--------------------------------------------------|
//! | every value | EMA + history, baseline recompute every 60 s     |
//! | 1 s         | rule detectors over the 30 s window              |
//! | 30 s        | sleep-onset window, may start the fade           |
//! | 5 s         | sonar movement classification                    |
//! | 3 s         | fade ramp                                        |
//! | 5 min       | recording rotation                               |
//!
//! The breathing trend consumes every value and closes its own 60 s windows.
//! Because time is counted in samples, a replayed night produces exactly
//! the same events as the live one.

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{pipeline::PipelineDiagnostics, EngineConfig, SessionCommand, SessionConfig};
use crate::{
    breathing::{BreathTrendAnalyzer, SleepOnsetDetector},
    capture::{LevelCapture, MeteringSource},
    detect::{Detection, LevelFrame, RuleEngine, SensorTranslator},
    fade::{self, SmartFadeController},
    ipc::events::{
        BreathingState, CaptureSegmentEvent, DetectedEvent, LevelEvent, SessionReport,
        SmartFadeEvent, SonarState,
    },
    sonar::{self, SonarClassifier},
};

const RULE_TICK: Duration = Duration::from_secs(1);
const ONSET_WINDOW: Duration = Duration::from_secs(30);
const TREND_WINDOW: Duration = Duration::from_secs(60);

/// Broadcast senders for everything a session publishes.
#[derive(Clone)]
pub struct SessionChannels {
    pub events: broadcast::Sender<DetectedEvent>,
    pub levels: broadcast::Sender<LevelEvent>,
    pub breathing: broadcast::Sender<BreathingState>,
    pub sonar: broadcast::Sender<SonarState>,
    pub fade: broadcast::Sender<SmartFadeEvent>,
    pub segments: broadcast::Sender<CaptureSegmentEvent>,
}

impl SessionChannels {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: broadcast::channel(capacity).0,
            levels: broadcast::channel(capacity).0,
            breathing: broadcast::channel(capacity).0,
            sonar: broadcast::channel(capacity).0,
            fade: broadcast::channel(capacity).0,
            segments: broadcast::channel(capacity).0,
        }
    }
}

/// Cadences in samples.
#[derive(Debug, Clone, Copy)]
struct Cadence {
    rule: u64,
    onset: u64,
    sonar: u64,
    fade: u64,
}

fn due(samples: u64, every: u64) -> bool {
    every > 0 && samples % every == 0
}

pub struct NightSession {
    session_id: String,
    started_at: DateTime<Utc>,
    sample_period_ms: u64,
    rule_window_samples: usize,
    cadence: Cadence,
    capture: LevelCapture,
    rules: RuleEngine,
    sensors: SensorTranslator,
    onset: SleepOnsetDetector,
    trend: BreathTrendAnalyzer,
    sonar: Option<SonarClassifier>,
    fade: Option<SmartFadeController>,
    channels: SessionChannels,
    diagnostics: Arc<PipelineDiagnostics>,
    events: Vec<DetectedEvent>,
    next_seq: u64,
    now_ms: u64,
    fresh_since_rule_tick: usize,
}

impl NightSession {
    pub fn new(
        config: &EngineConfig,
        session: &SessionConfig,
        channels: SessionChannels,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        let started_at = Utc::now();
        let rate = config.sample_rate_hz as f32;
        let samples_for_ms = |ms: u64| config.samples_for(Duration::from_millis(ms)).max(1);

        info!(
            session_id = %session.session_id,
            sensitivity = %session.sensitivity,
            sonar = session.sonar_enabled,
            smart_fade = session.smart_fade_enabled,
            "night session created"
        );

        Self {
            session_id: session.session_id.clone(),
            started_at,
            sample_period_ms: config.sample_period_ms(),
            rule_window_samples: config.samples_for(config.rule_window) as usize,
            cadence: Cadence {
                rule: config.samples_for(RULE_TICK).max(1),
                onset: config.samples_for(ONSET_WINDOW).max(1),
                sonar: samples_for_ms(sonar::ANALYSIS_INTERVAL_MS),
                fade: samples_for_ms(fade::TICK_INTERVAL_MS),
            },
            capture: LevelCapture::new(config),
            rules: RuleEngine::new(session.sensitivity),
            sensors: SensorTranslator::new(session.thermostat_f),
            onset: SleepOnsetDetector::new(rate, config.samples_for(ONSET_WINDOW) as usize),
            trend: BreathTrendAnalyzer::new(
                rate,
                config.samples_for(TREND_WINDOW) as usize,
                started_at,
            ),
            sonar: session
                .sonar_enabled
                .then(|| SonarClassifier::new(started_at)),
            fade: session
                .smart_fade_enabled
                .then(|| SmartFadeController::new(started_at)),
            channels,
            diagnostics,
            events: Vec::new(),
            next_seq: 0,
            now_ms: 0,
            fresh_since_rule_tick: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Session time of the newest sample.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn events(&self) -> &[DetectedEvent] {
        &self.events
    }

    pub fn baseline_db(&self) -> f32 {
        self.capture.baseline_db()
    }

    /// Advance the session by one metering value.
    pub fn ingest(&mut self, raw_db: f32, source: &mut dyn MeteringSource) {
        self.now_ms += self.sample_period_ms;
        let now = self.now_ms;

        let reading = self.capture.ingest(raw_db);
        let samples = self.capture.samples_seen();
        let _ = self.channels.levels.send(LevelEvent {
            seq: samples,
            current_db: reading.current_db,
            baseline_db: reading.baseline_db,
        });

        self.onset.push_sample(raw_db);
        if let Some(snapshot) = self.trend.push_sample(raw_db, now) {
            self.diagnostics.trend_windows.fetch_add(1, Ordering::Relaxed);
            if let Some(sonar) = self.sonar.as_mut() {
                sonar.set_breathing_rate(snapshot.breathing_rate);
            }
        }
        if let Some(sonar) = self.sonar.as_mut() {
            sonar.push_sample(raw_db);
        }
        self.fresh_since_rule_tick += 1;

        if due(samples, self.cadence.rule) {
            self.run_rules();
        }
        if due(samples, self.cadence.onset) {
            self.run_onset();
        }
        if due(samples, self.cadence.sonar) {
            self.run_sonar();
        }
        if due(samples, self.cadence.fade) {
            if let Some(event) = self.fade.as_mut().and_then(|f| f.tick(now)) {
                let _ = self.channels.fade.send(event);
            }
        }
        if self.capture.rotation_due() {
            self.rotate(source);
        }
    }

    /// Apply a host command at the current session time.
    pub fn apply(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::UserInteraction => {
                debug!(offset_ms = self.now_ms, "user interaction");
                self.onset.reset_onset();
                if let Some(event) = self
                    .fade
                    .as_mut()
                    .and_then(|f| f.on_user_interaction(self.now_ms))
                {
                    let _ = self.channels.fade.send(event);
                }
            }
            SessionCommand::Sensor(input) => {
                // The translator's own cooldowns only pre-filter; the
                // per-type gate is shared with the audio detectors.
                let Some(detection) = self.sensors.translate(input, self.now_ms) else {
                    return;
                };
                match self.rules.admit(detection, self.now_ms) {
                    Some(detection) => self.emit(detection),
                    None => {
                        self.diagnostics
                            .detections_suppressed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Close the session: a partial breathing window is analysed once and
    /// every summary is built.
    pub fn finalize(self, ended_at: DateTime<Utc>) -> SessionReport {
        let time_in_bed_ms = self.now_ms;
        let sleep_efficiency = self
            .sonar
            .as_ref()
            .map(|sonar| sonar.sleep_efficiency(time_in_bed_ms));
        let breath_trend = self.trend.finalize(time_in_bed_ms);

        info!(
            events = self.events.len(),
            samples = self.capture.samples_seen(),
            bdi = breath_trend.bdi,
            sleep_efficiency = sleep_efficiency.as_ref().map(|s| s.sleep_efficiency),
            "night session finalised"
        );

        SessionReport {
            session_id: self.session_id,
            started_at: self.started_at,
            ended_at,
            samples_analyzed: self.capture.samples_seen(),
            events: self.events,
            breath_trend,
            sleep_efficiency,
        }
    }

    fn run_rules(&mut self) {
        let window = self.capture.snapshot(self.rule_window_samples);
        let frame = LevelFrame {
            now_ms: self.now_ms,
            baseline_db: self.capture.baseline_db(),
            window: &window,
            fresh: self.fresh_since_rule_tick,
            sample_period_ms: self.sample_period_ms,
        };
        self.fresh_since_rule_tick = 0;
        self.diagnostics.rule_ticks.fetch_add(1, Ordering::Relaxed);

        let suppressed_before = self.rules.suppressed();
        let detections = self.rules.evaluate(&frame);
        let suppressed = self.rules.suppressed() - suppressed_before;
        if suppressed > 0 {
            self.diagnostics
                .detections_suppressed
                .fetch_add(suppressed as usize, Ordering::Relaxed);
        }
        for detection in detections {
            self.emit(detection);
        }
    }

    fn run_onset(&mut self) {
        let Some(outcome) = self.onset.analyze() else {
            return;
        };
        self.diagnostics.onset_windows.fetch_add(1, Ordering::Relaxed);
        let state = outcome.state(self.now_ms);
        debug!(
            rate_bpm = state.rate,
            regularity = state.regularity,
            consecutive = outcome.consecutive_sleep_windows,
            "onset window analysed"
        );
        let _ = self.channels.breathing.send(state);

        if !outcome.onset_detected {
            return;
        }
        if let Some(event) = self
            .fade
            .as_mut()
            .and_then(|f| f.on_sleep_onset(self.now_ms))
        {
            let _ = self.channels.fade.send(event);
        }
    }

    fn run_sonar(&mut self) {
        let Some(sonar) = self.sonar.as_mut() else {
            return;
        };
        if let Some(state) = sonar.analyze(self.now_ms) {
            self.diagnostics.sonar_ticks.fetch_add(1, Ordering::Relaxed);
            let _ = self.channels.sonar.send(state);
        }
    }

    fn rotate(&mut self, source: &mut dyn MeteringSource) {
        match self.capture.rotate(source, self.now_ms) {
            Some(segment) => {
                self.diagnostics.rotations.fetch_add(1, Ordering::Relaxed);
                let _ = self.channels.segments.send(CaptureSegmentEvent {
                    index: segment.index,
                    start_offset_ms: segment.start_offset_ms,
                    end_offset_ms: segment.end_offset_ms,
                    path: segment.path,
                });
            }
            None => {
                self.diagnostics
                    .rotation_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn emit(&mut self, detection: Detection) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = DetectedEvent {
            id: format!("{}-{}", self.session_id, seq),
            session_id: self.session_id.clone(),
            seq,
            timestamp: self.started_at + ChronoDuration::milliseconds(self.now_ms as i64),
            offset_ms: self.now_ms,
            category: detection.kind.category(),
            kind: detection.kind,
            severity: detection.severity,
            duration_seconds: detection.duration_seconds,
            confidence: detection.confidence,
            reading: detection.reading,
        };
        info!(
            event_id = %event.id,
            kind = detection.kind.as_str(),
            severity = ?detection.severity,
            offset_ms = self.now_ms,
            "event detected"
        );
        self.diagnostics.events_emitted.fetch_add(1, Ordering::Relaxed);
        let _ = self.channels.events.send(event.clone());
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    use tokio::sync::broadcast::error::TryRecvError;

    use crate::breathing::test_signals::breathing;
    use crate::buffering::MeteringProducer;
    use crate::detect::{SensorInput, Sensitivity};
    use crate::error::{DriftError, Result};
    use crate::ipc::events::{EventCategory, EventType, FadePhase, Severity};

    struct TestSource {
        fail_rotation: bool,
        rotations: u32,
    }

    impl MeteringSource for TestSource {
        fn start(&mut self, _producer: MeteringProducer, _running: Arc<AtomicBool>) -> Result<()> {
            Ok(())
        }

        fn rotate(&mut self) -> Result<Option<PathBuf>> {
            if self.fail_rotation {
                Err(DriftError::Rotation("disk full".into()))
            } else {
                self.rotations += 1;
                Ok(Some(PathBuf::from(format!("segment-{:04}.wav", self.rotations - 1))))
            }
        }

        fn stop(&mut self) {}

        fn describe(&self) -> String {
            "test".into()
        }
    }

    struct Night {
        session: NightSession,
        source: TestSource,
        channels: SessionChannels,
        diagnostics: Arc<PipelineDiagnostics>,
    }

    impl Night {
        fn new(config: EngineConfig, session: SessionConfig) -> Self {
            let channels = SessionChannels::new(4_096);
            let diagnostics = Arc::new(PipelineDiagnostics::default());
            Self {
                session: NightSession::new(
                    &config,
                    &session,
                    channels.clone(),
                    Arc::clone(&diagnostics),
                ),
                source: TestSource {
                    fail_rotation: false,
                    rotations: 0,
                },
                channels,
                diagnostics,
            }
        }

        fn quiet_session() -> SessionConfig {
            let mut config = SessionConfig::new("night");
            config.sonar_enabled = false;
            config
        }

        fn feed(&mut self, values: &[f32]) {
            for &v in values {
                self.session.ingest(v, &mut self.source);
            }
        }

        fn hold(&mut self, level: f32, seconds: usize) {
            self.feed(&vec![level; seconds * 10]);
        }
    }

    fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(v) => out.push(v),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
            }
        }
    }

    #[test]
    fn cadences_follow_the_sample_clock() {
        let mut night = Night::new(EngineConfig::default(), Night::quiet_session());
        let mut levels = night.channels.levels.subscribe();
        let mut breathing_rx = night.channels.breathing.subscribe();

        night.hold(30.0, 60);

        assert_eq!(night.session.now_ms(), 60_000);
        assert_eq!(drain(&mut levels).len(), 600);
        let states = drain(&mut breathing_rx);
        assert_eq!(
            states.iter().map(|s| s.offset_ms).collect::<Vec<_>>(),
            vec![30_000, 60_000]
        );
        let snap = night.diagnostics.snapshot();
        assert_eq!(snap.rule_ticks, 60);
        assert_eq!(snap.trend_windows, 1);
    }

    #[test]
    fn baseline_settles_on_the_quiet_floor() {
        let mut night = Night::new(EngineConfig::default(), Night::quiet_session());
        night.hold(42.0, 59);
        assert_eq!(night.session.baseline_db(), 30.0);
        night.hold(42.0, 1);
        assert!((night.session.baseline_db() - 42.0).abs() < 1e-3);
    }

    #[test]
    fn repeated_spikes_inside_cooldown_yield_one_event() {
        let mut night = Night::new(EngineConfig::default(), Night::quiet_session());
        let mut events = night.channels.events.subscribe();

        night.hold(30.0, 60);
        night.hold(60.0, 3);
        night.hold(30.0, 10);
        night.hold(60.0, 3);
        night.hold(30.0, 20);

        let emitted = drain(&mut events);
        assert_eq!(emitted.len(), 1);
        let event = &emitted[0];
        assert_eq!(event.kind, EventType::LoudEvent);
        assert_eq!(event.category, EventCategory::Noise);
        assert_eq!(event.id, "night-0");
        assert_eq!(night.diagnostics.snapshot().detections_suppressed, 1);

        night.hold(30.0, 120);
        night.hold(60.0, 3);
        night.hold(30.0, 5);
        let later = drain(&mut events);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].seq, 1);
        assert_eq!(later[0].id, "night-1");
    }

    fn light_on() -> SessionCommand {
        SessionCommand::Sensor(SensorInput::Event {
            kind: EventType::LightOn,
            value: 120.0,
            severity: Severity::Medium,
            confidence: 0.8,
        })
    }

    #[test]
    fn sensor_events_of_another_type_pass_the_gate() {
        let mut night = Night::new(EngineConfig::default(), Night::quiet_session());
        night.hold(30.0, 60);
        night.hold(60.0, 3);
        night.session.apply(SessionCommand::Sensor(SensorInput::Accelerometer {
            x: 0.0,
            y: 0.0,
            z: 1.6,
        }));

        let kinds: Vec<_> = night.session.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventType::LoudEvent, EventType::Movement]);
        assert_eq!(night.session.events()[1].category, EventCategory::Partner);
    }

    #[test]
    fn sensor_events_share_the_per_type_cooldown() {
        let mut night = Night::new(EngineConfig::default(), Night::quiet_session());
        night.hold(30.0, 60);
        night.hold(60.0, 3);
        assert_eq!(night.session.events().len(), 1);

        night.hold(30.0, 1);
        for _ in 0..3 {
            night.session.apply(SessionCommand::Sensor(SensorInput::Event {
                kind: EventType::LoudEvent,
                value: 75.0,
                severity: Severity::High,
                confidence: 0.9,
            }));
        }
        night.hold(30.0, 1);
        for _ in 0..3 {
            night.session.apply(light_on());
        }

        let kinds: Vec<_> = night.session.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventType::LoudEvent, EventType::LightOn]);
        assert_eq!(night.diagnostics.snapshot().detections_suppressed, 5);

        night.hold(30.0, 119);
        night.session.apply(light_on());
        assert_eq!(night.session.events().len(), 2);
        night.hold(30.0, 1);
        night.session.apply(light_on());
        assert_eq!(night.session.events().len(), 3);
        assert_eq!(night.session.events()[2].kind, EventType::LightOn);
    }

    #[test]
    fn accelerometer_movement_respects_the_longer_gate() {
        let mut night = Night::new(EngineConfig::default(), Night::quiet_session());
        let shake = SessionCommand::Sensor(SensorInput::Accelerometer {
            x: 0.0,
            y: 0.0,
            z: 1.6,
        });
        night.hold(30.0, 10);
        night.session.apply(shake);
        night.hold(30.0, 61);
        night.session.apply(shake);
        assert_eq!(night.session.events().len(), 1);

        night.hold(30.0, 60);
        night.session.apply(shake);
        assert_eq!(night.session.events().len(), 2);
    }

    #[test]
    fn onset_starts_fade_and_interaction_restores_it() {
        let mut night = Night::new(EngineConfig::default(), SessionConfig::new("night"));
        let mut fade_rx = night.channels.fade.subscribe();

        night.feed(&breathing(10.0, 60, 30.0));
        let started = drain(&mut fade_rx);
        assert!(started.first().is_some_and(|e| e.is_fading));

        night.feed(&breathing(10.0, 150, 30.0));
        night.session.apply(SessionCommand::UserInteraction);
        let until_cancel = drain(&mut fade_rx);
        let cancelled = until_cancel.last().expect("cancel event");
        assert_eq!(cancelled.phase, FadePhase::Restoring);
        assert_eq!(cancelled.volume, 0.5);

        night.feed(&breathing(10.0, 30, 30.0));
        let restored = drain(&mut fade_rx);
        let done = restored.last().expect("restore ticks");
        assert_eq!(done.phase, FadePhase::Idle);
        assert_eq!(done.volume, 1.0);
        assert!(!done.fade_complete);
    }

    #[test]
    fn fade_disabled_session_never_fades() {
        let mut session = Night::quiet_session();
        session.smart_fade_enabled = false;
        let mut night = Night::new(EngineConfig::default(), session);
        let mut fade_rx = night.channels.fade.subscribe();
        night.feed(&breathing(10.0, 90, 30.0));
        assert!(drain(&mut fade_rx).is_empty());
    }

    #[test]
    fn rotation_closes_segments_and_survives_failures() {
        let mut config = EngineConfig::default();
        config.rotation_interval = Duration::from_secs(10);
        let mut night = Night::new(config, Night::quiet_session());
        let mut segments = night.channels.segments.subscribe();

        night.hold(30.0, 10);
        night.source.fail_rotation = true;
        night.hold(30.0, 10);
        night.source.fail_rotation = false;
        night.hold(30.0, 10);

        let closed = drain(&mut segments);
        assert_eq!(closed.len(), 2);
        assert_eq!((closed[0].start_offset_ms, closed[0].end_offset_ms), (0, 10_000));
        assert_eq!((closed[1].start_offset_ms, closed[1].end_offset_ms), (10_000, 30_000));
        assert_eq!(closed[1].index, 1);
        assert_eq!(closed[0].path, Some(PathBuf::from("segment-0000.wav")));
        assert_eq!(closed[1].path, Some(PathBuf::from("segment-0001.wav")));
        assert_eq!(night.diagnostics.snapshot().rotation_failures, 1);
    }

    #[test]
    fn finalize_analyses_partial_window_and_reports_efficiency() {
        let mut night = Night::new(EngineConfig::default(), SessionConfig::new("night"));
        night.feed(&breathing(12.0, 45, 30.0));

        let report = night.session.finalize(Utc::now());
        assert_eq!(report.samples_analyzed, 450);
        assert_eq!(report.breath_trend.snapshots.len(), 1);
        assert!((report.breath_trend.avg_breathing_rate - 12.0).abs() <= 0.5);
        let efficiency = report.sleep_efficiency.expect("sonar enabled");
        assert!((efficiency.total_time_in_bed_minutes - 0.75).abs() < 1e-9);
        assert_eq!(efficiency.movement_timeline.len(), 9);
    }

    #[test]
    fn sensitivity_changes_what_counts_as_loud() {
        let mut low = Night::quiet_session();
        low.sensitivity = Sensitivity::Low;
        let mut high = Night::quiet_session();
        high.sensitivity = Sensitivity::High;

        let mut quiet_night = Night::new(EngineConfig::default(), low);
        let mut touchy_night = Night::new(EngineConfig::default(), high);
        for night in [&mut quiet_night, &mut touchy_night] {
            night.hold(30.0, 60);
            night.hold(48.0, 3);
            night.hold(30.0, 5);
        }
        assert!(quiet_night.session.events().is_empty());
        assert_eq!(touchy_night.session.events().len(), 1);
        assert_eq!(touchy_night.session.events()[0].kind, EventType::LoudEvent);
    }
}
