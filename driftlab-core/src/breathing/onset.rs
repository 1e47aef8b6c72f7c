//! Live sleep-onset detection.
//!
//! Every 30 s the newest window of raw metering is analysed with the live
//! estimator. A window "looks like sleep" when the rate is in (0, 14) BPM
//! and regularity exceeds 0.4. Two consecutive sleep-like windows signal
//! onset; any other window resets the count.

use super::{round_to, BreathingEstimator, BreathingReading};
use crate::{buffering::BoundedSampleBuffer, ipc::events::BreathingState};

const SLEEP_ONSET_BPM: f32 = 14.0;
const REGULARITY_THRESHOLD: f32 = 0.4;
const CONSECUTIVE_WINDOWS_NEEDED: u32 = 2;
/// Fraction of a window that must be filled before analysis runs.
const MIN_FILL: f32 = 0.8;

/// Outcome of one onset analysis window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetOutcome {
    pub reading: BreathingReading,
    pub consecutive_sleep_windows: u32,
    pub onset_detected: bool,
}

impl OnsetOutcome {
    /// Published form: rate to 0.1 BPM, regularity to 0.01.
    pub fn state(&self, offset_ms: u64) -> BreathingState {
        BreathingState {
            rate: round_to(self.reading.rate_bpm, 1),
            regularity: round_to(self.reading.regularity, 2),
            sleep_onset_detected: self.onset_detected,
            offset_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SleepOnsetDetector {
    estimator: BreathingEstimator,
    samples: BoundedSampleBuffer<f32>,
    window_samples: usize,
    consecutive: u32,
}

impl SleepOnsetDetector {
    pub fn new(sample_rate_hz: f32, window_samples: usize) -> Self {
        let window_samples = window_samples.max(1);
        Self {
            estimator: BreathingEstimator::live(sample_rate_hz),
            samples: BoundedSampleBuffer::new(window_samples * 2),
            window_samples,
            consecutive: 0,
        }
    }

    pub fn push_sample(&mut self, db: f32) {
        self.samples.push(db);
    }

    /// Analyse the newest window. `None` while less than 80% of a window
    /// has been collected.
    pub fn analyze(&mut self) -> Option<OnsetOutcome> {
        if (self.samples.len() as f32) < self.window_samples as f32 * MIN_FILL {
            return None;
        }
        let reading = self.estimator.estimate(&self.samples.tail(self.window_samples));
        let looks_like_sleep = reading.has_signal()
            && reading.rate_bpm < SLEEP_ONSET_BPM
            && reading.regularity > REGULARITY_THRESHOLD;

        if looks_like_sleep {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }

        Some(OnsetOutcome {
            reading,
            consecutive_sleep_windows: self.consecutive,
            onset_detected: self.consecutive >= CONSECUTIVE_WINDOWS_NEEDED,
        })
    }

    /// Forget progress towards onset (the user interacted).
    pub fn reset_onset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_sleep_windows(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breathing::test_signals::breathing;

    fn feed(detector: &mut SleepOnsetDetector, samples: &[f32]) {
        for &s in samples {
            detector.push_sample(s);
        }
    }

    #[test]
    fn needs_eighty_percent_of_a_window() {
        let mut detector = SleepOnsetDetector::new(10.0, 300);
        feed(&mut detector, &breathing(10.0, 23, 40.0));
        assert!(detector.analyze().is_none());
        feed(&mut detector, &breathing(10.0, 1, 40.0));
        assert!(detector.analyze().is_some());
    }

    #[test]
    fn two_slow_regular_windows_signal_onset() {
        let mut detector = SleepOnsetDetector::new(10.0, 300);
        let trace = breathing(10.0, 60, 40.0);

        feed(&mut detector, &trace[..300]);
        let first = detector.analyze().expect("full window");
        assert!((first.reading.rate_bpm - 10.0).abs() <= 0.5);
        assert!(!first.onset_detected);

        feed(&mut detector, &trace[300..]);
        let second = detector.analyze().expect("full window");
        assert!(second.onset_detected);
        assert_eq!(second.consecutive_sleep_windows, 2);

        let state = second.state(60_000);
        assert!(state.sleep_onset_detected);
        assert_eq!(state.offset_ms, 60_000);
    }

    #[test]
    fn fast_breathing_or_interaction_resets_the_count() {
        let mut detector = SleepOnsetDetector::new(10.0, 300);
        feed(&mut detector, &breathing(10.0, 30, 40.0));
        assert_eq!(detector.analyze().map(|o| o.consecutive_sleep_windows), Some(1));

        detector.reset_onset();
        feed(&mut detector, &breathing(10.0, 30, 40.0));
        let after_reset = detector.analyze().expect("window");
        assert_eq!(after_reset.consecutive_sleep_windows, 1);
        assert!(!after_reset.onset_detected);

        feed(&mut detector, &breathing(20.0, 30, 40.0));
        let awake = detector.analyze().expect("window");
        assert_eq!(awake.consecutive_sleep_windows, 0);
    }

    #[test]
    fn silence_is_not_sleep() {
        let mut detector = SleepOnsetDetector::new(10.0, 300);
        feed(&mut detector, &[35.0; 600]);
        let outcome = detector.analyze().expect("window");
        assert_eq!(outcome.reading.rate_bpm, 0.0);
        assert_eq!(outcome.consecutive_sleep_windows, 0);
    }
}
