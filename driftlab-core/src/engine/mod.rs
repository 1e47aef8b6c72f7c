//! `SleepEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! SleepEngine::new()
//!     └─► start(session, source) → source open, pipeline spawned, status = Recording
//!         └─► stop()             → running=false, source stopped, ring drained,
//!                                  session finalised, SessionReport returned
//! ```
//!
//! `start()`/`stop()` are idempotent: calling them in the wrong state returns
//! an error rather than panicking.
//!
//! ## Threading
//!
//! Some metering sources own handles that must stay on the thread that
//! created them (`cpal::Stream` is `!Send` on Windows/macOS). The source is
//! therefore started *inside* the `spawn_blocking` closure and a sync
//! oneshot channel propagates open errors back to the `start()` caller.
//! Every periodic analysis runs on that one pipeline thread, driven by the
//! sample clock (see [`session::NightSession`]).

pub mod pipeline;
pub mod session;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    buffering::create_metering_ring,
    capture::MeteringSource,
    detect::{SensorInput, Sensitivity},
    error::{DriftError, Result},
    ipc::events::{
        BreathingState, CaptureSegmentEvent, DetectedEvent, EngineStatus, EngineStatusEvent,
        LevelEvent, SessionReport, SmartFadeEvent, SonarState,
    },
};

pub use pipeline::{DiagnosticsSnapshot, PipelineDiagnostics, SessionCommand};
pub use session::{NightSession, SessionChannels};

/// How long `stop()` waits for the pipeline to hand back its report.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Pending user interactions and sensor readings.
const COMMAND_QUEUE_CAP: usize = 256;

/// Engine-wide tuning shared by every session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Metering rate in Hz. Every cadence is counted in samples of this
    /// clock. Default: 10 (one value per 100 ms).
    pub sample_rate_hz: u32,
    /// EMA weight of the newest sample. Default: 0.3.
    pub ema_alpha: f32,
    /// Percentile of the level history used as the ambient baseline.
    /// Default: 20.
    pub baseline_percentile: f64,
    /// Default: 60 s.
    pub baseline_interval: Duration,
    /// Baseline before the first recompute. Default: 30 dB.
    pub initial_baseline_db: f32,
    /// Smoothed level history. Default: 6000 samples (≈10 min at 10 Hz).
    pub level_buffer_capacity: usize,
    /// History handed to the rule detectors on each tick. Default: 30 s.
    pub rule_window: Duration,
    /// Recording handle rotation. Default: 5 min.
    pub rotation_interval: Duration,
    /// Per-channel broadcast capacity for slow subscribers. Default: 1024.
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10,
            ema_alpha: 0.3,
            baseline_percentile: 20.0,
            baseline_interval: Duration::from_secs(60),
            initial_baseline_db: 30.0,
            level_buffer_capacity: crate::buffering::bounded::DEFAULT_CAPACITY,
            rule_window: Duration::from_secs(30),
            rotation_interval: Duration::from_secs(5 * 60),
            broadcast_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Number of samples covering `period` on the metering clock.
    pub fn samples_for(&self, period: Duration) -> u64 {
        (period.as_millis() as u64).saturating_mul(self.sample_rate_hz as u64) / 1000
    }

    pub fn sample_period_ms(&self) -> u64 {
        1000 / self.sample_rate_hz.max(1) as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 || self.sample_rate_hz > 1000 {
            return Err(DriftError::InvalidConfig(format!(
                "sample_rate_hz must be in 1..=1000, got {}",
                self.sample_rate_hz
            )));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(DriftError::InvalidConfig(format!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        if !(0.0..=100.0).contains(&self.baseline_percentile) {
            return Err(DriftError::InvalidConfig(format!(
                "baseline_percentile must be in [0, 100], got {}",
                self.baseline_percentile
            )));
        }
        if self.level_buffer_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(DriftError::InvalidConfig(
                "buffer and broadcast capacities must be non-zero".into(),
            ));
        }
        if self.samples_for(self.baseline_interval) == 0 || self.samples_for(self.rule_window) == 0 {
            return Err(DriftError::InvalidConfig(
                "baseline interval and rule window must span at least one sample".into(),
            ));
        }
        Ok(())
    }
}

/// Per-night settings supplied by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Opaque identifier, echoed into every event id.
    pub session_id: String,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    /// Thermostat setting in °F, used as the climate reference.
    #[serde(default)]
    pub thermostat_f: Option<f32>,
    #[serde(default = "default_true")]
    pub sonar_enabled: bool,
    #[serde(default = "default_true")]
    pub smart_fade_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sensitivity: Sensitivity::default(),
            thermostat_f: None,
            sonar_enabled: true,
            smart_fade_enabled: true,
        }
    }
}

/// The top-level engine handle.
///
/// `SleepEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc<SleepEngine>` to share between the host and
/// event-forwarding tasks.
pub struct SleepEngine {
    config: EngineConfig,
    /// `true` while the source and pipeline are active.
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    session_id: Mutex<Option<String>>,
    channels: SessionChannels,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    commands: Mutex<Option<crossbeam_channel::Sender<SessionCommand>>>,
    report_rx: Mutex<Option<std::sync::mpsc::Receiver<SessionReport>>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl SleepEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let channels = SessionChannels::new(config.broadcast_capacity);
        let (status_tx, _) = broadcast::channel(config.broadcast_capacity);
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            session_id: Mutex::new(None),
            channels,
            status_tx,
            commands: Mutex::new(None),
            report_rx: Mutex::new(None),
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a night session on `source`.
    ///
    /// Blocks until the source is confirmed open (or fails), then returns.
    /// The pipeline keeps running in a background blocking thread. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    /// - `DriftError::AlreadyRunning` if a session is active.
    /// - Permission / availability errors from the source; the session
    ///   never starts and the status becomes `Error`.
    pub fn start(&self, session: SessionConfig, mut source: Box<dyn MeteringSource>) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DriftError::AlreadyRunning);
        }

        self.diagnostics.reset();
        *self.session_id.lock() = Some(session.session_id.clone());
        self.set_status(EngineStatus::Starting, None);

        let (producer, consumer) = create_metering_ring();
        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_QUEUE_CAP);
        let (report_tx, report_rx) = std::sync::mpsc::channel::<SessionReport>();
        // Sync oneshot: pipeline thread signals open success/failure to start().
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<String>>();

        let night = NightSession::new(
            &self.config,
            &session,
            self.channels.clone(),
            Arc::clone(&self.diagnostics),
        );
        let running = Arc::clone(&self.running);
        let status_tx = self.status_tx.clone();
        let status = Arc::clone(&self.status);
        let diagnostics = Arc::clone(&self.diagnostics);

        tokio::task::spawn_blocking(move || {
            // Source handles may be thread-affine: open them on THIS thread.
            match source.start(producer, Arc::clone(&running)) {
                Ok(()) => {
                    let _ = open_tx.send(Ok(source.describe()));
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }

            pipeline::run(pipeline::PipelineContext {
                session: night,
                source,
                consumer,
                running,
                commands: command_rx,
                status_tx,
                status,
                diagnostics,
                report_tx,
            });
        });

        match open_rx.recv() {
            Ok(Ok(description)) => {
                *self.commands.lock() = Some(command_tx);
                *self.report_rx.lock() = Some(report_rx);
                self.set_status(EngineStatus::Recording, None);
                info!(session_id = %session.session_id, source = %description, "session started");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(session_id = %session.session_id, error = %e, "failed to open metering source");
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message was sent; the blocking task died.
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("pipeline failed to start".into()));
                Err(DriftError::Other(anyhow::anyhow!(
                    "pipeline task died unexpectedly"
                )))
            }
        }
    }

    /// Stop the session and wait for its final report.
    ///
    /// The source stops first, samples still queued in the ring are
    /// analysed, and a partial final breathing window is evaluated once.
    ///
    /// # Errors
    /// - `DriftError::NotRunning` if no session is active.
    pub fn stop(&self) -> Result<SessionReport> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(DriftError::NotRunning);
        }
        let report_rx = self.report_rx.lock().take().ok_or(DriftError::NotRunning)?;
        self.commands.lock().take();

        self.set_status(EngineStatus::Stopping, None);
        self.running.store(false, Ordering::SeqCst);
        info!("session stop requested");

        report_rx.recv_timeout(STOP_TIMEOUT).map_err(|e| {
            self.set_status(EngineStatus::Error, Some("pipeline did not finish".into()));
            DriftError::Other(anyhow::anyhow!("waiting for session report: {e}"))
        })
    }

    /// Forward a user interaction: resets onset progress and cancels an
    /// active fade.
    pub fn record_user_interaction(&self) -> Result<()> {
        self.send_command(SessionCommand::UserInteraction)
    }

    /// Hand one external sensor reading to the session.
    pub fn submit_sensor(&self, input: SensorInput) -> Result<()> {
        self.send_command(SessionCommand::Sensor(input))
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DetectedEvent> {
        self.channels.events.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.channels.levels.subscribe()
    }

    pub fn subscribe_breathing(&self) -> broadcast::Receiver<BreathingState> {
        self.channels.breathing.subscribe()
    }

    pub fn subscribe_sonar(&self) -> broadcast::Receiver<SonarState> {
        self.channels.sonar.subscribe()
    }

    pub fn subscribe_fade(&self) -> broadcast::Receiver<SmartFadeEvent> {
        self.channels.fade.subscribe()
    }

    pub fn subscribe_segments(&self) -> broadcast::Receiver<CaptureSegmentEvent> {
        self.channels.segments.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn pipeline_diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn send_command(&self, command: SessionCommand) -> Result<()> {
        let guard = self.commands.lock();
        let tx = guard.as_ref().ok_or(DriftError::NotRunning)?;
        match tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(dropped)) => {
                warn!(?dropped, "command queue full, dropping");
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(DriftError::NotRunning),
        }
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            session_id: self.session_id.lock().clone(),
            detail,
        });
    }
}
