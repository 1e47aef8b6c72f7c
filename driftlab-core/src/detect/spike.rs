//! Loud-event detector.
//!
//! Enters an "above threshold" state when the smoothed level crosses
//! `baseline + delta`; once that state has lasted the minimum duration it
//! fires a single `loud_event`. The level must drop back below the threshold
//! before the detector re-arms.

use super::{margin_confidence, Detection, EventDetector, LevelFrame};
use crate::ipc::events::{EventType, Reading, Severity};

const SPIKE_MIN_DURATION_MS: u64 = 2_000;

/// Above-threshold run tracker shared by the spike and sustained detectors.
#[derive(Debug, Clone)]
pub(crate) struct ThresholdRun {
    delta_db: f32,
    min_duration_ms: u64,
    above_since: Option<u64>,
    peak_db: f32,
    fired: bool,
}

/// A run that just reached its minimum duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CompletedRun {
    pub duration_ms: u64,
    pub peak_db: f32,
}

impl ThresholdRun {
    pub fn new(delta_db: f32, min_duration_ms: u64) -> Self {
        Self {
            delta_db,
            min_duration_ms,
            above_since: None,
            peak_db: f32::NEG_INFINITY,
            fired: false,
        }
    }

    pub fn delta_db(&self) -> f32 {
        self.delta_db
    }

    pub fn step(&mut self, t_ms: u64, level_db: f32, baseline_db: f32) -> Option<CompletedRun> {
        if level_db <= baseline_db + self.delta_db {
            self.reset();
            return None;
        }

        let since = *self.above_since.get_or_insert(t_ms);
        self.peak_db = self.peak_db.max(level_db);
        let duration_ms = t_ms.saturating_sub(since);
        if self.fired || duration_ms < self.min_duration_ms {
            return None;
        }
        self.fired = true;
        Some(CompletedRun {
            duration_ms,
            peak_db: self.peak_db,
        })
    }

    pub fn reset(&mut self) {
        self.above_since = None;
        self.peak_db = f32::NEG_INFINITY;
        self.fired = false;
    }
}

#[derive(Debug, Clone)]
pub struct SpikeDetector {
    run: ThresholdRun,
}

impl SpikeDetector {
    pub fn new(delta_db: f32) -> Self {
        Self {
            run: ThresholdRun::new(delta_db, SPIKE_MIN_DURATION_MS),
        }
    }
}

impl EventDetector for SpikeDetector {
    fn kind(&self) -> EventType {
        EventType::LoudEvent
    }

    fn evaluate(&mut self, frame: &LevelFrame<'_>) -> Option<Detection> {
        let mut found = None;
        for (t_ms, level) in frame.fresh_samples() {
            if let Some(run) = self.run.step(t_ms, level, frame.baseline_db) {
                let over_baseline = run.peak_db - frame.baseline_db;
                found = Some(Detection {
                    kind: EventType::LoudEvent,
                    severity: Severity::from_delta_db(over_baseline),
                    duration_seconds: run.duration_ms as f32 / 1000.0,
                    confidence: margin_confidence(0.6, over_baseline - self.run.delta_db()),
                    reading: Reading::Decibel {
                        level_db: run.peak_db,
                    },
                });
            }
        }
        found
    }

    fn reset(&mut self) {
        self.run.reset();
    }
}
