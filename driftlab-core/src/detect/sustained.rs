//! Sustained-noise detector: the spike state machine with a lower threshold
//! and a 30 s minimum duration.

use super::{margin_confidence, spike::ThresholdRun, Detection, EventDetector, LevelFrame};
use crate::ipc::events::{EventType, Reading, Severity};

const SUSTAINED_MIN_DURATION_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct SustainedNoiseDetector {
    run: ThresholdRun,
}

impl SustainedNoiseDetector {
    pub fn new(delta_db: f32) -> Self {
        Self {
            run: ThresholdRun::new(delta_db, SUSTAINED_MIN_DURATION_MS),
        }
    }
}

impl EventDetector for SustainedNoiseDetector {
    fn kind(&self) -> EventType {
        EventType::SustainedNoise
    }

    fn evaluate(&mut self, frame: &LevelFrame<'_>) -> Option<Detection> {
        let mut found = None;
        for (t_ms, level) in frame.fresh_samples() {
            if let Some(run) = self.run.step(t_ms, level, frame.baseline_db) {
                let over_baseline = run.peak_db - frame.baseline_db;
                found = Some(Detection {
                    kind: EventType::SustainedNoise,
                    severity: Severity::from_delta_db(over_baseline),
                    duration_seconds: run.duration_ms as f32 / 1000.0,
                    confidence: margin_confidence(0.7, over_baseline - self.run.delta_db()),
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
