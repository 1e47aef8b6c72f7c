//! Breathing cycle estimation.
//!
//! ## Algorithm (per window)
//!
//! 1. Zero-mean the raw metering window.
//! 2. Smooth with a 5-sample (≈500 ms) centered moving average.
//! 3. Autocorrelate over the lag range of the target BPM band.
//! 4. Best lag → rate (BPM); correlation strength → regularity.
//!
//! The same estimator runs at two cadences: [`onset::SleepOnsetDetector`]
//! (30 s windows, 8–24 BPM, live) and [`trend::BreathTrendAnalyzer`]
//! (60 s windows, 6–30 BPM, whole night).
//!
//! A window without a clear periodic signal yields a zero reading. Rate `0`
//! means "no reading", never apnea.

pub mod onset;
pub mod trend;

pub use onset::{OnsetOutcome, SleepOnsetDetector};
pub use trend::BreathTrendAnalyzer;

use crate::dsp;

/// Moving-average width applied before autocorrelation.
const SMOOTHING_SAMPLES: usize = 5;

/// Result of analysing one window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BreathingReading {
    /// Breaths per minute, `0.0` when no periodic signal was found.
    pub rate_bpm: f32,
    /// Autocorrelation strength in [0, 1].
    pub regularity: f32,
    /// RMS of the raw window (signal-strength proxy).
    pub amplitude: f32,
}

impl BreathingReading {
    pub fn has_signal(&self) -> bool {
        self.rate_bpm > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct BreathingEstimator {
    sample_rate_hz: f32,
    min_lag: usize,
    max_lag: usize,
}

impl BreathingEstimator {
    pub fn new(min_bpm: f32, max_bpm: f32, sample_rate_hz: f32) -> Self {
        let (min_lag, max_lag) = dsp::bpm_range_to_lags(min_bpm, max_bpm, sample_rate_hz);
        Self {
            sample_rate_hz,
            min_lag,
            max_lag,
        }
    }

    /// Live band: close-range microphones give a cleaner, tighter signal.
    pub fn live(sample_rate_hz: f32) -> Self {
        Self::new(8.0, 24.0, sample_rate_hz)
    }

    /// Whole-night band.
    pub fn overnight(sample_rate_hz: f32) -> Self {
        Self::new(6.0, 30.0, sample_rate_hz)
    }

    pub fn lag_range(&self) -> (usize, usize) {
        (self.min_lag, self.max_lag)
    }

    pub fn estimate(&self, raw: &[f32]) -> BreathingReading {
        let amplitude = crate::buffering::chunk::rms(raw);
        let smoothed = dsp::moving_average(&dsp::zero_mean_normalize(raw), SMOOTHING_SAMPLES);
        let periodicity = dsp::autocorrelate(&smoothed, self.min_lag, self.max_lag);
        if periodicity.is_none() {
            return BreathingReading {
                amplitude,
                ..BreathingReading::default()
            };
        }
        BreathingReading {
            rate_bpm: dsp::lag_to_bpm(periodicity.lag, self.sample_rate_hz),
            regularity: periodicity.strength,
            amplitude,
        }
    }
}

pub(crate) fn round_to(value: f32, decimals: i32) -> f32 {
    let scale = 10f32.powi(decimals);
    (value * scale).round() / scale
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_and_overnight_lag_ranges() {
        assert_eq!(BreathingEstimator::live(10.0).lag_range(), (25, 75));
        assert_eq!(BreathingEstimator::overnight(10.0).lag_range(), (20, 100));
    }

    #[test]
    fn estimates_rate_of_synthetic_breathing() {
        let reading = BreathingEstimator::live(10.0).estimate(&test_signals::breathing(12.0, 30, 35.0));
        assert!(reading.has_signal());
        assert!((reading.rate_bpm - 12.0).abs() <= 0.5, "rate={}", reading.rate_bpm);
        assert!(reading.regularity > 0.4);
        assert!(reading.amplitude > 30.0);
    }

    #[test]
    fn flat_window_is_no_reading() {
        let reading = BreathingEstimator::overnight(10.0).estimate(&[40.0; 600]);
        assert!(!reading.has_signal());
        assert_eq!(reading.regularity, 0.0);
        assert!((reading.amplitude - 40.0).abs() < 1e-4);
    }

    #[test]
    fn rounding_helper() {
        assert_eq!(round_to(12.34, 1), 12.3);
        assert_eq!(round_to(0.456, 2), 0.46);
    }
}
