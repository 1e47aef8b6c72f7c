//! Level capture and ambient baseline estimation.
//!
//! # Data path
//!
//! ```text
//! MeteringSource (own thread) → SPSC ring → pipeline thread → LevelCapture::ingest
//! ```
//!
//! A [`MeteringSource`] delivers one dB-like scalar per sample period. The
//! pipeline hands each value to [`LevelCapture`], which smooths it with an
//! EMA, keeps the smoothed history in a [`BoundedSampleBuffer`] and rewrites
//! the baseline (20th percentile of that history) once per baseline interval.
//! `LevelCapture` is the only writer of the history and of the baseline;
//! detectors only ever receive copies via [`LevelCapture::snapshot`].
//!
//! Rotation swaps the source's underlying recording handle at a fixed
//! interval so no single artifact grows without bound. The microphone source
//! writes each segment through a [`SegmentRecorder`]. A failed rotation is
//! logged and the current segment simply keeps growing.

#[cfg(feature = "audio-cpal")]
pub mod microphone;
pub mod recorder;
pub mod replay;

#[cfg(feature = "audio-cpal")]
pub use microphone::MicrophoneSource;
pub use recorder::SegmentRecorder;
pub use replay::{ReplayHandle, ReplaySource};

use std::path::PathBuf;
use std::sync::{atomic::AtomicBool, Arc};

use tracing::{debug, info, warn};

use crate::{
    buffering::{BoundedSampleBuffer, MeteringProducer},
    engine::EngineConfig,
    error::Result,
};

/// External microphone metering contract.
///
/// Implementors push one metering value per sample period into the producer
/// from their own thread (or audio callback) until `running` goes false or
/// [`stop`](MeteringSource::stop) is called. A source that cannot start
/// because of permissions or a missing device returns a fatal error from
/// [`start`](MeteringSource::start).
pub trait MeteringSource: Send + 'static {
    /// Begin delivering samples.
    fn start(&mut self, producer: MeteringProducer, running: Arc<AtomicBool>) -> Result<()>;

    /// Swap the underlying recording handle and return the path of the
    /// closed artifact. Sources that record nothing return `Ok(None)`.
    /// Errors are transient: the current artifact keeps growing.
    fn rotate(&mut self) -> Result<Option<PathBuf>>;

    /// Stop delivering samples and release the device.
    fn stop(&mut self);

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Result of ingesting one metering sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    /// EMA-smoothed level.
    pub current_db: f32,
    /// Baseline in effect after this sample.
    pub baseline_db: f32,
    /// True when this sample triggered a baseline recompute.
    pub baseline_updated: bool,
}

/// A recording artifact closed by a successful rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSegment {
    pub index: u32,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
    pub path: Option<PathBuf>,
}

pub struct LevelCapture {
    alpha: f32,
    smoothed: Option<f32>,
    levels: BoundedSampleBuffer<f32>,
    baseline_db: f32,
    baseline_percentile: f64,
    baseline_interval_samples: u64,
    rotation_interval_samples: u64,
    samples_seen: u64,
    segment_index: u32,
    segment_start_ms: u64,
    samples_since_rotation: u64,
}

impl LevelCapture {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            alpha: config.ema_alpha,
            smoothed: None,
            levels: BoundedSampleBuffer::new(config.level_buffer_capacity),
            baseline_db: config.initial_baseline_db,
            baseline_percentile: config.baseline_percentile,
            baseline_interval_samples: config.samples_for(config.baseline_interval).max(1),
            rotation_interval_samples: config.samples_for(config.rotation_interval),
            samples_seen: 0,
            segment_index: 0,
            segment_start_ms: 0,
            samples_since_rotation: 0,
        }
    }

    /// Smooth and store one raw metering value, recomputing the baseline on
    /// interval boundaries before the value is visible to any detector.
    pub fn ingest(&mut self, raw_db: f32) -> LevelReading {
        let current_db = match self.smoothed {
            Some(prev) => self.alpha * raw_db + (1.0 - self.alpha) * prev,
            None => raw_db,
        };
        self.smoothed = Some(current_db);
        self.levels.push(current_db);
        self.samples_seen += 1;
        self.samples_since_rotation += 1;

        let baseline_updated = self.samples_seen % self.baseline_interval_samples == 0;
        if baseline_updated {
            self.recompute_baseline();
        }

        LevelReading {
            current_db,
            baseline_db: self.baseline_db,
            baseline_updated,
        }
    }

    fn recompute_baseline(&mut self) {
        let percentile = self
            .levels
            .percentile(self.baseline_percentile, |v| *v as f64) as f32;
        debug!(
            previous_db = self.baseline_db,
            baseline_db = percentile,
            held = self.levels.len(),
            "baseline recomputed"
        );
        self.baseline_db = percentile;
    }

    pub fn baseline_db(&self) -> f32 {
        self.baseline_db
    }

    /// Latest smoothed level, if any sample arrived yet.
    pub fn current_db(&self) -> Option<f32> {
        self.smoothed
    }

    /// Copy of the `n` most recent smoothed levels, oldest first.
    pub fn snapshot(&self, n: usize) -> Vec<f32> {
        self.levels.tail(n)
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn rotation_due(&self) -> bool {
        self.rotation_interval_samples > 0
            && self.samples_since_rotation >= self.rotation_interval_samples
    }

    /// Ask the source to swap its recording handle.
    ///
    /// On success the current segment is closed and returned. On failure the
    /// error is logged and the segment keeps growing until the next attempt.
    pub fn rotate(&mut self, source: &mut dyn MeteringSource, now_ms: u64) -> Option<CaptureSegment> {
        self.samples_since_rotation = 0;
        match source.rotate() {
            Ok(path) => {
                let segment = CaptureSegment {
                    index: self.segment_index,
                    start_offset_ms: self.segment_start_ms,
                    end_offset_ms: now_ms,
                    path,
                };
                self.segment_index += 1;
                self.segment_start_ms = now_ms;
                info!(
                    segment = segment.index,
                    start_ms = segment.start_offset_ms,
                    end_ms = segment.end_offset_ms,
                    path = ?segment.path,
                    "capture segment rotated"
                );
                Some(segment)
            }
            Err(e) => {
                warn!(
                    segment = self.segment_index,
                    error = %e,
                    "rotation failed, extending current segment"
                );
                None
            }
        }
    }
}
