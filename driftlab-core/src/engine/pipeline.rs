//! Blocking pipeline loop.
//!
//! ## Pipeline stages (per iteration)
//!
//! ```text
//! 1. Apply queued commands (user interaction, sensor readings)
//! 2. Drain ring buffer → up to DRAIN_CHUNK metering values
//! 3. NightSession::ingest per value (baseline → rules → onset → sonar →
//!    fade → rotation, each on its own sample-count cadence)
//! 4. Broadcast whatever the session emitted
//! ```
//!
//! On stop the source is stopped first, the ring is drained so no queued
//! sample is lost, the session is finalised and its report is sent back to
//! `SleepEngine::stop()`.
//!
//! This entire loop runs in `spawn_blocking`, keeping the Tokio async
//! executor free for the host's I/O.

use std::sync::OnceLock;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use super::session::NightSession;
use crate::{
    buffering::{Consumer, MeteringConsumer},
    capture::MeteringSource,
    detect::SensorInput,
    ipc::events::{EngineStatus, EngineStatusEvent, SessionReport},
};

/// Requests from the host, applied between drained chunks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCommand {
    UserInteraction,
    Sensor(SensorInput),
}

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub rule_ticks: AtomicUsize,
    pub events_emitted: AtomicUsize,
    pub detections_suppressed: AtomicUsize,
    pub onset_windows: AtomicUsize,
    pub trend_windows: AtomicUsize,
    pub sonar_ticks: AtomicUsize,
    pub rotations: AtomicUsize,
    pub rotation_failures: AtomicUsize,
    pub commands_applied: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.rule_ticks.store(0, Ordering::Relaxed);
        self.events_emitted.store(0, Ordering::Relaxed);
        self.detections_suppressed.store(0, Ordering::Relaxed);
        self.onset_windows.store(0, Ordering::Relaxed);
        self.trend_windows.store(0, Ordering::Relaxed);
        self.sonar_ticks.store(0, Ordering::Relaxed);
        self.rotations.store(0, Ordering::Relaxed);
        self.rotation_failures.store(0, Ordering::Relaxed);
        self.commands_applied.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            rule_ticks: self.rule_ticks.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            detections_suppressed: self.detections_suppressed.load(Ordering::Relaxed),
            onset_windows: self.onset_windows.load(Ordering::Relaxed),
            trend_windows: self.trend_windows.load(Ordering::Relaxed),
            sonar_ticks: self.sonar_ticks.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            rotation_failures: self.rotation_failures.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub rule_ticks: usize,
    pub events_emitted: usize,
    pub detections_suppressed: usize,
    pub onset_windows: usize,
    pub trend_windows: usize,
    pub sonar_ticks: usize,
    pub rotations: usize,
    pub rotation_failures: usize,
    pub commands_applied: usize,
}

/// All context the pipeline needs, passed as one struct so the closure stays tidy.
pub struct PipelineContext {
    pub session: NightSession,
    /// Already started; stopped by the pipeline on exit.
    pub source: Box<dyn MeteringSource>,
    pub consumer: MeteringConsumer,
    pub running: Arc<AtomicBool>,
    pub commands: crossbeam_channel::Receiver<SessionCommand>,
    pub status_tx: broadcast::Sender<EngineStatusEvent>,
    pub status: Arc<Mutex<EngineStatus>>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub report_tx: std::sync::mpsc::Sender<SessionReport>,
}

/// Metering values drained from the ring per iteration (6.4 s at 10 Hz).
const DRAIN_CHUNK: usize = 64;

/// Minimum sleep when the ring is empty (avoids busy-wait burning a core).
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

/// Run the blocking pipeline until `ctx.running` becomes false, then
/// finalise the session and send its report.
pub fn run(mut ctx: PipelineContext) {
    let span = info_span!("session", session_id = %ctx.session.session_id());
    let _enter = span.enter();
    info!(source = %ctx.source.describe(), "pipeline started");

    let mut raw = vec![0f32; DRAIN_CHUNK];

    loop {
        apply_commands(&mut ctx);

        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(std::time::Duration::from_millis(empty_sleep_ms()));
            continue;
        }
        ingest_chunk(&mut ctx, &raw[..n]);
    }

    // Producer first, then whatever it already queued.
    ctx.source.stop();
    let mut drained = 0usize;
    loop {
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            break;
        }
        ingest_chunk(&mut ctx, &raw[..n]);
        drained += n;
    }
    apply_commands(&mut ctx);
    if drained > 0 {
        debug!(drained, "analysed samples queued before stop");
    }

    let PipelineContext {
        session,
        status_tx,
        status,
        diagnostics,
        report_tx,
        ..
    } = ctx;

    let session_id = session.session_id().to_string();
    let report = session.finalize(Utc::now());

    let snap = diagnostics.snapshot();
    info!(
        samples_in = snap.samples_in,
        rule_ticks = snap.rule_ticks,
        events_emitted = snap.events_emitted,
        detections_suppressed = snap.detections_suppressed,
        onset_windows = snap.onset_windows,
        trend_windows = snap.trend_windows,
        sonar_ticks = snap.sonar_ticks,
        rotations = snap.rotations,
        rotation_failures = snap.rotation_failures,
        commands_applied = snap.commands_applied,
        "pipeline stopped"
    );

    *status.lock() = EngineStatus::Stopped;
    let _ = status_tx.send(EngineStatusEvent {
        status: EngineStatus::Stopped,
        session_id: Some(session_id),
        detail: None,
    });
    if report_tx.send(report).is_err() {
        warn!("session report receiver dropped before stop completed");
    }
}

fn ingest_chunk(ctx: &mut PipelineContext, samples: &[f32]) {
    ctx.diagnostics
        .samples_in
        .fetch_add(samples.len(), Ordering::Relaxed);
    for &value in samples {
        ctx.session.ingest(value, ctx.source.as_mut());
    }
}

fn apply_commands(ctx: &mut PipelineContext) {
    while let Ok(command) = ctx.commands.try_recv() {
        ctx.diagnostics
            .commands_applied
            .fetch_add(1, Ordering::Relaxed);
        ctx.session.apply(command);
    }
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("DRIFTLAB_PIPELINE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}
