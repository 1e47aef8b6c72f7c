//! Contactless movement and coarse sleep staging.
//!
//! A quiet 18.5 kHz pilot tone is played and its reflection is summarised
//! into a scalar proxy stream, one value per metering sample. Every 5 s the
//! classifier looks at the last 10 s of that proxy:
//!
//! | movement | condition (on the zero-mean proxy)           |
//! |----------|-----------------------------------------------|
//! | absent   | rms < 0.02 (no reflection, user out of bed)   |
//! | major    | peak > 0.6 or variance > 0.3 (sitting up)     |
//! | minor    | peak > 0.15 or variance > 0.05 (tossing)      |
//! | still    | otherwise                                     |
//!
//! Sleep state: major or absent → awake; still for ≥ 5 min → deep;
//! still or minor → light.
//!
//! When only metering levels are available (no PCM), the proxy is the
//! metering stream itself. That is an amplitude-dynamics approximation, not
//! Doppler sensing. [`SonarClassifier::push_reflection_block`] is the real
//! path: it band-limits reflected PCM around the pilot before taking its
//! level. The session pipeline only carries metering values, so nothing in
//! this crate calls it or [`pilot_tone`]; they are the entry points for a
//! host that plays the pilot and captures raw PCM.
//!
//! The breathing rate carried in [`SonarState`] is display-only and never
//! influences classification.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::{
    buffering::{chunk::PcmBlock, BoundedSampleBuffer},
    dsp,
    ipc::events::{MovementLevel, MovementSample, SleepEfficiencyData, SleepState, SonarState},
};

pub const PILOT_FREQ_HZ: f32 = 18_500.0;
pub const PILOT_BANDWIDTH_HZ: f32 = 500.0;
pub const PILOT_VOLUME: f32 = 0.1;

/// Classification cadence.
pub const ANALYSIS_INTERVAL_MS: u64 = 5_000;

const ANALYSIS_SAMPLES: usize = 100;
const MIN_SAMPLES: usize = 50;
const PROXY_CAPACITY: usize = 300;
/// 16 hours of 5 s classifications. Display only: sleep statistics are
/// tallied as the night goes and cover the whole session.
const TIMELINE_CAPACITY: usize = 11_520;

const ABSENCE_RMS: f32 = 0.02;
const MAJOR_PEAK: f32 = 0.6;
const MAJOR_VARIANCE: f32 = 0.3;
const MINOR_PEAK: f32 = 0.15;
const MINOR_VARIANCE: f32 = 0.05;
const DEEP_STILLNESS_MS: u64 = 5 * 60_000;

/// Pilot tone at playback volume, for a host that drives the speaker.
/// Not played by the session pipeline.
pub fn pilot_tone(duration_ms: u32, sample_rate: u32) -> Vec<f32> {
    dsp::generate_sine_wave(PILOT_FREQ_HZ, duration_ms, sample_rate)
        .into_iter()
        .map(|s| s * PILOT_VOLUME)
        .collect()
}

pub fn classify_movement(stats: dsp::SignalStats) -> MovementLevel {
    if stats.rms < ABSENCE_RMS {
        MovementLevel::Absent
    } else if stats.max_abs > MAJOR_PEAK || stats.variance > MAJOR_VARIANCE {
        MovementLevel::Major
    } else if stats.max_abs > MINOR_PEAK || stats.variance > MINOR_VARIANCE {
        MovementLevel::Minor
    } else {
        MovementLevel::Still
    }
}

pub fn classify_sleep_state(movement: MovementLevel, still_for_ms: u64) -> SleepState {
    match movement {
        MovementLevel::Major | MovementLevel::Absent => SleepState::Awake,
        MovementLevel::Still if still_for_ms >= DEEP_STILLNESS_MS => SleepState::Deep,
        MovementLevel::Still | MovementLevel::Minor => SleepState::Light,
    }
}

pub struct SonarClassifier {
    started_at: DateTime<Utc>,
    proxy: BoundedSampleBuffer<f32>,
    timeline: BoundedSampleBuffer<MovementSample>,
    state: SonarState,
    still_since_ms: Option<u64>,
    tally: SleepTally,
}

impl SonarClassifier {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            proxy: BoundedSampleBuffer::new(PROXY_CAPACITY),
            timeline: BoundedSampleBuffer::new(TIMELINE_CAPACITY),
            state: SonarState {
                breathing_rate: 0.0,
                movement_level: MovementLevel::Still,
                sleep_state: SleepState::Awake,
                last_movement_offset_ms: None,
            },
            still_since_ms: None,
            tally: SleepTally::default(),
        }
    }

    /// Feed one proxy value (one per metering sample).
    pub fn push_sample(&mut self, value: f32) {
        self.proxy.push(value);
    }

    /// Band-limit a block of reflected PCM around the pilot and feed its
    /// level into the proxy stream. Returns the band level.
    ///
    /// Hook for a PCM-capable host: the session pipeline feeds
    /// [`push_sample`](Self::push_sample) instead.
    pub fn push_reflection_block(&mut self, block: &PcmBlock) -> f32 {
        let band = dsp::bandpass_filter(
            &block.samples,
            PILOT_FREQ_HZ,
            PILOT_BANDWIDTH_HZ,
            block.sample_rate as f32,
        );
        let level = crate::buffering::chunk::rms(&band);
        self.proxy.push(level);
        level
    }

    /// Display-only breathing rate.
    pub fn set_breathing_rate(&mut self, bpm: f32) {
        self.state.breathing_rate = bpm;
    }

    pub fn state(&self) -> SonarState {
        self.state
    }

    /// Classify the newest 10 s. `None` until 5 s of proxy exist.
    pub fn analyze(&mut self, now_ms: u64) -> Option<SonarState> {
        if self.proxy.len() < MIN_SAMPLES {
            return None;
        }
        let centered = dsp::zero_mean_normalize(&self.proxy.tail(ANALYSIS_SAMPLES));
        let stats = dsp::signal_stats(&centered);
        let movement = classify_movement(stats);

        if movement == MovementLevel::Still {
            self.still_since_ms.get_or_insert(now_ms);
        } else {
            self.still_since_ms = None;
            self.state.last_movement_offset_ms = Some(now_ms);
        }
        let still_for_ms = self
            .still_since_ms
            .map_or(0, |since| now_ms.saturating_sub(since));
        let sleep_state = classify_sleep_state(movement, still_for_ms);

        debug!(
            ?movement,
            ?sleep_state,
            rms = stats.rms,
            variance = stats.variance,
            peak = stats.max_abs,
            "sonar classified"
        );

        self.state.movement_level = movement;
        self.state.sleep_state = sleep_state;
        self.tally.record(sleep_state, now_ms);
        self.timeline.push(MovementSample {
            timestamp: self.started_at + ChronoDuration::milliseconds(now_ms as i64),
            offset_ms: now_ms,
            movement_level: movement,
            sleep_state,
        });
        Some(self.state)
    }

    pub fn movement_timeline(&self) -> Vec<MovementSample> {
        self.timeline.all()
    }

    /// Sleep statistics for the whole session. The attached timeline is
    /// the bounded recent history.
    pub fn sleep_efficiency(&self, time_in_bed_ms: u64) -> SleepEfficiencyData {
        self.tally
            .summarize(self.timeline.all(), time_in_bed_ms, ANALYSIS_INTERVAL_MS)
    }
}

/// Running sleep counters, one `record` per classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SleepTally {
    pub first_sleep_ms: Option<u64>,
    pub sleep_samples: u64,
    pub awake_after_onset: u64,
}

impl SleepTally {
    pub fn record(&mut self, state: SleepState, offset_ms: u64) {
        if state.is_asleep() {
            self.first_sleep_ms.get_or_insert(offset_ms);
            self.sleep_samples += 1;
        } else if self.first_sleep_ms.is_some() {
            self.awake_after_onset += 1;
        }
    }

    /// Unrounded minutes, each classification covering `sample_interval_ms`.
    pub fn summarize(
        &self,
        timeline: Vec<MovementSample>,
        time_in_bed_ms: u64,
        sample_interval_ms: u64,
    ) -> SleepEfficiencyData {
        let minutes = |ms: u64| ms as f64 / 60_000.0;
        let total_time_in_bed_minutes = minutes(time_in_bed_ms);
        let total_sleep_minutes = minutes(self.sleep_samples * sample_interval_ms);
        let sleep_efficiency = if total_time_in_bed_minutes > 0.0 {
            total_sleep_minutes / total_time_in_bed_minutes * 100.0
        } else {
            0.0
        };

        SleepEfficiencyData {
            total_time_in_bed_minutes,
            total_sleep_minutes,
            sleep_onset_latency_minutes: self
                .first_sleep_ms
                .map_or(total_time_in_bed_minutes, minutes),
            wake_after_sleep_onset_minutes: minutes(self.awake_after_onset * sample_interval_ms),
            sleep_efficiency,
            movement_timeline: timeline,
        }
    }
}

/// Sleep statistics from a complete movement timeline.
pub fn sleep_efficiency(
    timeline: Vec<MovementSample>,
    time_in_bed_ms: u64,
    sample_interval_ms: u64,
) -> SleepEfficiencyData {
    let mut tally = SleepTally::default();
    for sample in &timeline {
        tally.record(sample.sleep_state, sample.offset_ms);
    }
    tally.summarize(timeline, time_in_bed_ms, sample_interval_ms)
}
