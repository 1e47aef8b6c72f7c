//! Rule-based event detection.
//!
//! The [`EventDetector`] trait is the extensibility point: each detector is a
//! small state machine fed the same [`LevelFrame`] once per rule tick. The
//! [`RuleEngine`] owns the detectors and applies one central per-type
//! cooldown, so a given event type is never emitted twice within the
//! cooldown window no matter which detector logic re-triggers it.

pub mod sensor;
pub mod snoring;
pub mod spike;
pub mod sustained;

pub use sensor::{SensorInput, SensorTranslator};
pub use snoring::SnoringDetector;
pub use spike::SpikeDetector;
pub use sustained::SustainedNoiseDetector;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ipc::events::{EventType, Reading, Severity};

/// Central per-type cooldown.
pub const EVENT_COOLDOWN_MS: u64 = 120_000;

/// Detector sensitivity preset. Scales all three audio thresholds together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

/// dB above baseline required by each detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub spike_db: f32,
    pub sustained_db: f32,
    pub snore_db: f32,
}

impl Sensitivity {
    pub fn thresholds(self) -> Thresholds {
        match self {
            Sensitivity::Low => Thresholds {
                spike_db: 25.0,
                sustained_db: 15.0,
                snore_db: 12.0,
            },
            Sensitivity::Medium => Thresholds {
                spike_db: 20.0,
                sustained_db: 10.0,
                snore_db: 8.0,
            },
            Sensitivity::High => Thresholds {
                spike_db: 15.0,
                sustained_db: 7.0,
                snore_db: 5.0,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            other => Err(format!("unknown sensitivity '{other}'")),
        }
    }
}

/// Read-only view handed to detectors on each rule tick.
#[derive(Debug, Clone, Copy)]
pub struct LevelFrame<'a> {
    /// Session time of the newest sample in `window`.
    pub now_ms: u64,
    pub baseline_db: f32,
    /// Smoothed levels over the rule window, oldest first.
    pub window: &'a [f32],
    /// How many of the newest samples in `window` arrived since the last tick.
    pub fresh: usize,
    pub sample_period_ms: u64,
}

impl<'a> LevelFrame<'a> {
    /// Samples that arrived since the previous tick, oldest first, paired
    /// with their session time.
    pub fn fresh_samples(&self) -> impl Iterator<Item = (u64, f32)> + 'a {
        let window: &'a [f32] = self.window;
        let len = window.len();
        let fresh = self.fresh.min(len);
        let now_ms = self.now_ms;
        let period = self.sample_period_ms;
        window[len - fresh..]
            .iter()
            .enumerate()
            .map(move |(i, &level)| {
                let age = (fresh - 1 - i) as u64 * period;
                (now_ms.saturating_sub(age), level)
            })
    }
}

/// What a detector found; turned into a `DetectedEvent` by the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub kind: EventType,
    pub severity: Severity,
    pub duration_seconds: f32,
    pub confidence: f32,
    pub reading: Reading,
}

/// Trait for all rule detectors.
pub trait EventDetector: Send + 'static {
    /// The single event type this detector emits.
    fn kind(&self) -> EventType;

    /// Advance over the frame's fresh samples.
    fn evaluate(&mut self, frame: &LevelFrame<'_>) -> Option<Detection>;

    /// Drop all timers and buffered history.
    fn reset(&mut self);
}

/// Per-type emission gate shared by every detector.
#[derive(Debug, Clone)]
pub struct CooldownGate {
    window_ms: u64,
    last_emitted: HashMap<EventType, u64>,
    suppressed: u64,
}

impl CooldownGate {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_emitted: HashMap::new(),
            suppressed: 0,
        }
    }

    /// Record and allow an emission, or refuse it while the type is cooling down.
    pub fn admit(&mut self, kind: EventType, now_ms: u64) -> bool {
        if let Some(&last) = self.last_emitted.get(&kind) {
            if now_ms.saturating_sub(last) < self.window_ms {
                self.suppressed += 1;
                return false;
            }
        }
        self.last_emitted.insert(kind, now_ms);
        true
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn clear(&mut self) {
        self.last_emitted.clear();
        self.suppressed = 0;
    }
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new(EVENT_COOLDOWN_MS)
    }
}

/// The three audio detectors behind one cooldown gate.
pub struct RuleEngine {
    detectors: Vec<Box<dyn EventDetector>>,
    gate: CooldownGate,
}

impl RuleEngine {
    pub fn new(sensitivity: Sensitivity) -> Self {
        let t = sensitivity.thresholds();
        Self::with_detectors(vec![
            Box::new(SpikeDetector::new(t.spike_db)),
            Box::new(SustainedNoiseDetector::new(t.sustained_db)),
            Box::new(SnoringDetector::new(t.snore_db)),
        ])
    }

    pub fn with_detectors(detectors: Vec<Box<dyn EventDetector>>) -> Self {
        Self {
            detectors,
            gate: CooldownGate::default(),
        }
    }

    /// Run every detector over the frame and return what passes the gate.
    pub fn evaluate(&mut self, frame: &LevelFrame<'_>) -> Vec<Detection> {
        let mut admitted = Vec::new();
        for i in 0..self.detectors.len() {
            let Some(detection) = self.detectors[i].evaluate(frame) else {
                continue;
            };
            if let Some(detection) = self.admit(detection, frame.now_ms) {
                admitted.push(detection);
            }
        }
        admitted
    }

    /// Pass a detection produced elsewhere (the sensor feed) through the
    /// same per-type gate.
    pub fn admit(&mut self, detection: Detection, now_ms: u64) -> Option<Detection> {
        if self.gate.admit(detection.kind, now_ms) {
            return Some(detection);
        }
        debug!(
            kind = detection.kind.as_str(),
            now_ms, "detection suppressed by cooldown"
        );
        None
    }

    pub fn suppressed(&self) -> u64 {
        self.gate.suppressed()
    }

    pub fn reset(&mut self) {
        for detector in self.detectors.iter_mut() {
            detector.reset();
        }
        self.gate.clear();
    }
}

/// Shared confidence curve: grows with how far the peak cleared the
/// detector's threshold.
pub(crate) fn margin_confidence(base: f32, margin_db: f32) -> f32 {
    (base + margin_db.max(0.0) / 50.0).min(0.95)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::LevelFrame;

    pub const PERIOD_MS: u64 = 100;

    /// Feeds a level script through a detector one rule tick (10 samples) at
    /// a time, the way the session does.
    pub struct FrameDriver {
        pub levels: Vec<f32>,
        pub baseline_db: f32,
        window_len: usize,
    }

    impl FrameDriver {
        pub fn new(baseline_db: f32) -> Self {
            Self {
                levels: Vec::new(),
                baseline_db,
                window_len: 300,
            }
        }

        /// Append `seconds` of a constant level.
        pub fn hold(&mut self, level: f32, seconds: f32) -> &mut Self {
            let n = (seconds * 10.0).round() as usize;
            self.levels.extend(std::iter::repeat(level).take(n));
            self
        }

        /// Call `f` with one frame per tick over the whole script.
        pub fn ticks<F>(&self, mut f: F)
        where
            F: FnMut(&LevelFrame<'_>),
        {
            let mut end = 0;
            while end < self.levels.len() {
                let next = (end + 10).min(self.levels.len());
                let start = next.saturating_sub(self.window_len);
                let frame = LevelFrame {
                    now_ms: (next as u64 - 1) * PERIOD_MS,
                    baseline_db: self.baseline_db,
                    window: &self.levels[start..next],
                    fresh: next - end,
                    sample_period_ms: PERIOD_MS,
                };
                f(&frame);
                end = next;
            }
        }
    }
}
