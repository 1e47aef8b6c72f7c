//! Signal-processing primitives shared by the breathing and sonar analysers.
//!
//! All functions are pure and allocation-bounded by their input length.
//! Periodicity is found with a direct-lag autocorrelation search rather than
//! an FFT: the breathing band (6–30 BPM) maps to at most ~100 lags at 10 Hz,
//! and the direct search reports "no signal" instead of a spurious peak when
//! the window carries no energy.

use std::f32::consts::PI;

/// Correlation below this is treated as "no periodic signal".
pub const MIN_PERIODIC_STRENGTH: f32 = 0.15;

/// Maximum FIR kernel length used by [`bandpass_filter`].
const MAX_KERNEL_LEN: usize = 65;

/// Subtract the arithmetic mean. Empty in, empty out.
pub fn zero_mean_normalize(buffer: &[f32]) -> Vec<f32> {
    if buffer.is_empty() {
        return Vec::new();
    }
    let mean = mean(buffer);
    buffer.iter().map(|v| v - mean).collect()
}

/// Centered moving average, window clamped at both edges.
///
/// Output length always equals input length; edge samples average over the
/// part of the window that exists instead of padding.
pub fn moving_average(data: &[f32], window_size: usize) -> Vec<f32> {
    let half = window_size / 2;
    let n = data.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n - 1);
            let sum: f32 = data[lo..=hi].iter().sum();
            sum / (hi - lo + 1) as f32
        })
        .collect()
}

/// Result of an autocorrelation search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Periodicity {
    /// Best-matching lag in samples. `0` means no periodic signal was found.
    pub lag: usize,
    /// Normalized correlation at `lag`, in [0, 1].
    pub strength: f32,
}

impl Periodicity {
    pub const NONE: Periodicity = Periodicity {
        lag: 0,
        strength: 0.0,
    };

    pub fn is_none(&self) -> bool {
        self.lag == 0
    }
}

/// Find the dominant period in `samples` within `[min_lag, max_lag]`.
///
/// Correlation at each lag is normalized by the total window energy. Returns
/// [`Periodicity::NONE`] when the window has no energy or the best
/// correlation is below [`MIN_PERIODIC_STRENGTH`]; callers must not read that
/// as a genuine slow rate.
pub fn autocorrelate(samples: &[f32], min_lag: usize, max_lag: usize) -> Periodicity {
    let n = samples.len();
    let energy: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    if energy == 0.0 {
        return Periodicity::NONE;
    }

    let mut best_lag = 0usize;
    let mut best_corr = f64::NEG_INFINITY;

    for lag in min_lag.max(1)..=max_lag {
        if lag >= n {
            break;
        }
        let corr: f64 = samples[..n - lag]
            .iter()
            .zip(&samples[lag..])
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum::<f64>()
            / energy;
        if corr > best_corr {
            best_corr = corr;
            best_lag = lag;
        }
    }

    if best_lag == 0 || best_corr < MIN_PERIODIC_STRENGTH as f64 {
        return Periodicity::NONE;
    }

    Periodicity {
        lag: best_lag,
        strength: best_corr.clamp(0.0, 1.0) as f32,
    }
}

/// Convert an autocorrelation lag (samples) into cycles per minute.
pub fn lag_to_bpm(lag: usize, sample_rate_hz: f32) -> f32 {
    if lag == 0 {
        return 0.0;
    }
    (sample_rate_hz * 60.0) / lag as f32
}

/// Lag range `(min_lag, max_lag)` covering `[min_bpm, max_bpm]` at `sample_rate_hz`.
pub fn bpm_range_to_lags(min_bpm: f32, max_bpm: f32, sample_rate_hz: f32) -> (usize, usize) {
    let min_lag = ((sample_rate_hz * 60.0) / max_bpm).floor() as usize;
    let max_lag = ((sample_rate_hz * 60.0) / min_bpm).ceil() as usize;
    (min_lag.max(1), max_lag.max(1))
}

/// Windowed-sinc FIR bandpass (Hamming window, kernel normalized by its
/// absolute sum) isolating `center_hz ± bandwidth_hz / 2`.
pub fn bandpass_filter(
    buffer: &[f32],
    center_hz: f32,
    bandwidth_hz: f32,
    sample_rate_hz: f32,
) -> Vec<f32> {
    let n = buffer.len();
    if n == 0 || sample_rate_hz <= 0.0 {
        return Vec::new();
    }

    let low_cutoff = (center_hz - bandwidth_hz / 2.0) / sample_rate_hz;
    let high_cutoff = (center_hz + bandwidth_hz / 2.0) / sample_rate_hz;

    let kernel_len = n.min(MAX_KERNEL_LEN);
    let half = kernel_len / 2;
    let mut kernel: Vec<f32> = (0..kernel_len)
        .map(|i| {
            let m = i as f32 - half as f32;
            let tap = if i == half {
                2.0 * (high_cutoff - low_cutoff)
            } else {
                let hp = (2.0 * PI * high_cutoff * m).sin() / (PI * m);
                let lp = (2.0 * PI * low_cutoff * m).sin() / (PI * m);
                hp - lp
            };
            tap * hamming(i, kernel_len)
        })
        .collect();

    let k_sum: f32 = kernel.iter().map(|k| k.abs()).sum();
    if k_sum > 0.0 {
        for k in kernel.iter_mut() {
            *k /= k_sum;
        }
    }

    (0..n)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .filter_map(|(j, k)| {
                    let idx = (i + j).checked_sub(half)?;
                    buffer.get(idx).map(|s| s * k)
                })
                .sum()
        })
        .collect()
}

/// Sine tone in [-1, 1] lasting `duration_ms` at `sample_rate`.
pub fn generate_sine_wave(freq_hz: f32, duration_ms: u32, sample_rate: u32) -> Vec<f32> {
    let num_samples = (duration_ms as u64 * sample_rate as u64 / 1000) as usize;
    let omega = 2.0 * std::f64::consts::PI * freq_hz as f64 / sample_rate.max(1) as f64;
    (0..num_samples)
        .map(|i| (omega * i as f64).sin() as f32)
        .collect()
}

/// Amplitude statistics of a zero-mean signal.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SignalStats {
    pub rms: f32,
    pub variance: f32,
    pub max_abs: f32,
}

/// RMS, variance (mean square) and peak magnitude of an already-centered signal.
pub fn signal_stats(centered: &[f32]) -> SignalStats {
    if centered.is_empty() {
        return SignalStats::default();
    }
    let variance = centered.iter().map(|v| v * v).sum::<f32>() / centered.len() as f32;
    let max_abs = centered.iter().fold(0f32, |acc, v| acc.max(v.abs()));
    SignalStats {
        rms: variance.sqrt(),
        variance,
        max_abs,
    }
}

pub fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn hamming(i: usize, len: usize) -> f32 {
    if len < 2 {
        return 1.0;
    }
    0.54 - 0.46 * ((2.0 * PI * i as f32) / (len - 1) as f32).cos()
}
