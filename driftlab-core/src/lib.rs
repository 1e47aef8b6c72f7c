//! # driftlab-core
//!
//! Overnight sleep-environment analysis engine.
//!
//! ## Architecture
//!
//! ```text
//! MeteringSource → SPSC RingBuffer → Pipeline(spawn_blocking)
//!  (mic / replay)                         │
//!                                   NightSession::ingest
//!                                         │
//!          ┌──────────────┬───────────────┼───────────────┬──────────────┐
//!     LevelCapture   RuleEngine     SleepOnset /     SonarClassifier  SmartFade
//!     (baseline)     (1 Hz)         BreathTrend      (5 s)            (3 s)
//!                                         │
//!                        broadcast::Sender<DetectedEvent, ...>
//! ```
//!
//! The metering callback never allocates. All analysis happens on the
//! pipeline thread, clocked by the metering samples themselves.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod breathing;
pub mod buffering;
pub mod capture;
pub mod detect;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod fade;
pub mod ipc;
pub mod sonar;

// Convenience re-exports for downstream crates
pub use capture::{MeteringSource, ReplayHandle, ReplaySource, SegmentRecorder};
pub use detect::{SensorInput, Sensitivity};
pub use engine::{EngineConfig, SessionConfig, SleepEngine};
pub use error::{DriftError, Result};
pub use ipc::events::{
    BreathTrendSummary, BreathingState, CaptureSegmentEvent, DetectedEvent, EngineStatus,
    EngineStatusEvent, LevelEvent, SessionReport, SleepEfficiencyData, SmartFadeEvent,
    SonarState,
};

#[cfg(feature = "audio-cpal")]
pub use capture::MicrophoneSource;
