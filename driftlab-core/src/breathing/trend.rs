//! Whole-night breathing trend and Breathing Disturbance Index (BDI).
//!
//! Raw metering is analysed in 60 s windows. After each window the newest
//! 10% is carried into the next one, so windows start every 54 s. Each window
//! becomes a [`BreathingSnapshot`]; at finalize the snapshots are folded into
//! a [`BreathTrendSummary`].
//!
//! A window counts as one disturbance when any of these hold:
//! - breath gap: rate in (0, 6) BPM
//! - regularity below 0.2 for longer than 15 s (the second and later
//!   consecutive low-regularity windows)
//! - rate differs from the previous window by more than 6 BPM
//!
//! Windows without a reading (rate 0) are never disturbances, and they break
//! both the low-regularity run and the rate-change comparison.
//!
//! BDI is an estimate from ambient audio, not a medical measurement.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use super::{round_to, BreathingEstimator, BreathingReading};
use crate::{
    buffering::BoundedSampleBuffer,
    ipc::events::{
        BdiSeverity, BreathTrendSummary, BreathingPhase, BreathingSnapshot, PhaseInterval,
    },
};

const BREATH_GAP_MAX_BPM: f32 = 6.0;
const LOW_REGULARITY_THRESHOLD: f32 = 0.2;
const LOW_REGULARITY_DURATION_S: f32 = 15.0;
const RATE_CHANGE_THRESHOLD_BPM: f32 = 6.0;
/// Share of each window carried into the next one.
const OVERLAP_FRACTION: f32 = 0.1;
/// A trailing window is analysed at finalize only when at least this full.
const MIN_FINAL_FILL: f32 = 0.5;

const QUIET_MIN_REGULARITY: f32 = 0.5;
const QUIET_MAX_BPM: f32 = 16.0;

pub struct BreathTrendAnalyzer {
    estimator: BreathingEstimator,
    started_at: DateTime<Utc>,
    sample_rate_hz: f32,
    window_samples: usize,
    samples: BoundedSampleBuffer<f32>,
    /// Samples that belong to the window being filled, overlap included.
    fill: usize,
    window_count: u32,
    low_regularity_windows: u32,
    last_rate: f32,
    disturbance_count: u32,
    disturbance_windows: u32,
    snapshots: Vec<BreathingSnapshot>,
}

impl BreathTrendAnalyzer {
    pub fn new(sample_rate_hz: f32, window_samples: usize, started_at: DateTime<Utc>) -> Self {
        let window_samples = window_samples.max(1);
        Self {
            estimator: BreathingEstimator::overnight(sample_rate_hz),
            started_at,
            sample_rate_hz,
            window_samples,
            samples: BoundedSampleBuffer::new(window_samples),
            fill: 0,
            window_count: 0,
            low_regularity_windows: 0,
            last_rate: 0.0,
            disturbance_count: 0,
            disturbance_windows: 0,
            snapshots: Vec::new(),
        }
    }

    /// Feed one raw metering value. Returns the snapshot when this sample
    /// completed a window.
    pub fn push_sample(&mut self, db: f32, offset_ms: u64) -> Option<BreathingSnapshot> {
        self.samples.push(db);
        self.fill += 1;
        if self.fill < self.window_samples {
            return None;
        }
        let window = self.samples.tail(self.window_samples);
        let snapshot = self.analyze_window(&window, offset_ms);
        self.fill = self.overlap_samples();
        Some(snapshot)
    }

    /// Rate of the newest snapshot, `0.0` before the first window.
    pub fn latest_rate(&self) -> f32 {
        self.snapshots.last().map_or(0.0, |s| s.breathing_rate)
    }

    pub fn snapshots(&self) -> &[BreathingSnapshot] {
        &self.snapshots
    }

    /// Analyse a trailing partial window if it is at least half full, then
    /// build the summary.
    pub fn finalize(mut self, offset_ms: u64) -> BreathTrendSummary {
        let pending = if self.window_count == 0 {
            self.fill
        } else {
            self.fill.saturating_sub(self.overlap_samples())
        };
        let min_fill = (self.window_samples as f32 * MIN_FINAL_FILL).ceil() as usize;
        if pending > 0 && self.fill >= min_fill {
            let window = self.samples.tail(self.fill);
            self.analyze_window(&window, offset_ms);
        }
        self.build_summary()
    }

    fn overlap_samples(&self) -> usize {
        (self.window_samples as f32 * OVERLAP_FRACTION).floor() as usize
    }

    fn analyze_window(&mut self, raw: &[f32], offset_ms: u64) -> BreathingSnapshot {
        self.window_count += 1;
        let reading = self.estimator.estimate(raw);
        let disturbance = self.classify_disturbance(&reading);
        if disturbance {
            self.disturbance_count += 1;
            self.disturbance_windows += 1;
        }

        debug!(
            window = self.window_count,
            rate_bpm = reading.rate_bpm,
            regularity = reading.regularity,
            disturbance,
            "breath trend window"
        );

        let snapshot = BreathingSnapshot {
            timestamp: self.started_at + ChronoDuration::milliseconds(offset_ms as i64),
            offset_ms,
            breathing_rate: round_to(reading.rate_bpm, 1),
            regularity: round_to(reading.regularity, 2),
            avg_amplitude: round_to(reading.amplitude, 1),
            disturbance_detected: disturbance,
        };
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    fn classify_disturbance(&mut self, reading: &BreathingReading) -> bool {
        // Rate 0 means "no reading", not a breathing gap.
        if !reading.has_signal() {
            self.low_regularity_windows = 0;
            self.last_rate = 0.0;
            return false;
        }

        let gap = reading.rate_bpm < BREATH_GAP_MAX_BPM;

        let window_s = self.window_samples as f32 / self.sample_rate_hz;
        let low_regularity = if reading.regularity < LOW_REGULARITY_THRESHOLD {
            self.low_regularity_windows += 1;
            // The run is measured from the start of its second window.
            (self.low_regularity_windows - 1) as f32 * window_s > LOW_REGULARITY_DURATION_S
        } else {
            self.low_regularity_windows = 0;
            false
        };

        let rate_change = self.last_rate > 0.0
            && (reading.rate_bpm - self.last_rate).abs() > RATE_CHANGE_THRESHOLD_BPM;
        self.last_rate = reading.rate_bpm;

        gap || low_regularity || rate_change
    }

    fn build_summary(self) -> BreathTrendSummary {
        let valid: Vec<&BreathingSnapshot> = self
            .snapshots
            .iter()
            .filter(|s| s.breathing_rate > 0.0)
            .collect();
        if valid.is_empty() {
            return BreathTrendSummary::empty(self.snapshots);
        }

        let n = valid.len() as f32;
        let avg_rate = valid.iter().map(|s| s.breathing_rate).sum::<f32>() / n;
        let min_rate = valid
            .iter()
            .map(|s| s.breathing_rate)
            .fold(f32::INFINITY, f32::min);
        let max_rate = valid
            .iter()
            .map(|s| s.breathing_rate)
            .fold(f32::NEG_INFINITY, f32::max);
        let avg_regularity = valid.iter().map(|s| s.regularity).sum::<f32>() / n;

        let window_s = self.window_samples as f32 / self.sample_rate_hz;
        let recording_hours = self.window_count as f32 * window_s / 3600.0;
        let disturbance_minutes = self.disturbance_windows as f32 * window_s / 60.0;
        let bdi = if recording_hours > 0.0 {
            round_to(self.disturbance_count as f32 / recording_hours, 1)
        } else {
            0.0
        };

        BreathTrendSummary {
            avg_breathing_rate: round_to(avg_rate, 1),
            min_breathing_rate: round_to(min_rate, 1),
            max_breathing_rate: round_to(max_rate, 1),
            avg_regularity: round_to(avg_regularity, 2),
            disturbance_count: self.disturbance_count,
            disturbance_minutes: disturbance_minutes.round(),
            bdi,
            bdi_severity: BdiSeverity::from_bdi(bdi),
            recording_hours: round_to(recording_hours, 1),
            phases: build_phases(&self.snapshots),
            snapshots: self.snapshots,
        }
    }
}

fn classify_phase(snapshot: &BreathingSnapshot) -> BreathingPhase {
    if snapshot.disturbance_detected {
        BreathingPhase::Disturbed
    } else if snapshot.regularity > QUIET_MIN_REGULARITY && snapshot.breathing_rate < QUIET_MAX_BPM {
        BreathingPhase::Quiet
    } else {
        BreathingPhase::Active
    }
}

/// Run-length coalesce consecutive snapshots of the same phase.
fn build_phases(snapshots: &[BreathingSnapshot]) -> Vec<PhaseInterval> {
    let Some(first) = snapshots.first() else {
        return Vec::new();
    };

    let mut phases = Vec::new();
    let mut current = classify_phase(first);
    let mut start = first.timestamp;

    for snapshot in &snapshots[1..] {
        let phase = classify_phase(snapshot);
        if phase != current {
            phases.push(PhaseInterval {
                phase: current,
                start_time: start,
                end_time: snapshot.timestamp,
            });
            current = phase;
            start = snapshot.timestamp;
        }
    }

    let end_time = snapshots.last().map_or(start, |s| s.timestamp);
    phases.push(PhaseInterval {
        phase: current,
        start_time: start,
        end_time,
    });
    phases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breathing::test_signals::breathing;

    fn analyzer() -> BreathTrendAnalyzer {
        BreathTrendAnalyzer::new(10.0, 600, Utc::now())
    }

    fn feed(analyzer: &mut BreathTrendAnalyzer, samples: &[f32], offset: &mut u64) -> Vec<BreathingSnapshot> {
        samples
            .iter()
            .filter_map(|&s| {
                *offset += 100;
                analyzer.push_sample(s, *offset)
            })
            .collect()
    }

    fn snapshot(rate: f32, regularity: f32, disturbed: bool, minute: i64) -> BreathingSnapshot {
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        BreathingSnapshot {
            timestamp: t0 + ChronoDuration::minutes(minute),
            offset_ms: minute as u64 * 60_000,
            breathing_rate: rate,
            regularity,
            avg_amplitude: 40.0,
            disturbance_detected: disturbed,
        }
    }

    #[test]
    fn windows_carry_ten_percent_overlap() {
        let mut a = analyzer();
        let mut offset = 0;
        let trace = breathing(12.0, 200, 40.0);
        let snaps = feed(&mut a, &trace, &mut offset);
        // First window at 600 samples, then every 540: 600, 1140, 1680.
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps[0].offset_ms, 60_000);
        assert_eq!(snaps[1].offset_ms, 114_000);
        assert!((snaps[0].breathing_rate - 12.0).abs() <= 0.5);
        assert!(snaps.iter().all(|s| !s.disturbance_detected));
    }

    #[test]
    fn steady_night_is_normal() {
        let mut a = analyzer();
        let mut offset = 0;
        feed(&mut a, &breathing(12.0, 600, 40.0), &mut offset);
        let summary = a.finalize(offset);
        assert_eq!(summary.disturbance_count, 0);
        assert_eq!(summary.bdi, 0.0);
        assert_eq!(summary.bdi_severity, BdiSeverity::Normal);
        assert!((summary.avg_breathing_rate - 12.0).abs() <= 0.5);
        assert!(summary.recording_hours > 0.0);
        assert_eq!(summary.phases.len(), 1);
        assert_eq!(summary.phases[0].phase, BreathingPhase::Quiet);
    }

    #[test]
    fn rate_jump_counts_one_disturbance() {
        let mut a = analyzer();
        let mut offset = 0;
        let snaps_slow = feed(&mut a, &breathing(10.0, 60, 40.0), &mut offset);
        assert_eq!(snaps_slow.len(), 1);
        // Fill the next window (540 new samples) with fast breathing.
        let snaps_fast = feed(&mut a, &breathing(24.0, 54, 40.0), &mut offset);
        assert_eq!(snaps_fast.len(), 1);
        assert!(snaps_fast[0].disturbance_detected);

        let summary = a.finalize(offset);
        assert_eq!(summary.disturbance_count, 1);
        assert_eq!(summary.disturbance_minutes, 1.0);
    }

    #[test]
    fn silent_night_yields_neutral_summary() {
        let mut a = analyzer();
        let mut offset = 0;
        feed(&mut a, &[38.0; 3_000], &mut offset);
        let summary = a.finalize(offset);
        assert_eq!(summary.avg_breathing_rate, 0.0);
        assert_eq!(summary.bdi_severity, BdiSeverity::Normal);
        assert!(summary.phases.is_empty());
        assert!(!summary.snapshots.is_empty());
        assert!(summary.snapshots.iter().all(|s| !s.disturbance_detected));
    }

    #[test]
    fn partial_final_window_needs_half_a_window() {
        let mut short = analyzer();
        let mut offset = 0;
        feed(&mut short, &breathing(12.0, 29, 40.0), &mut offset);
        assert!(short.finalize(offset).snapshots.is_empty());

        let mut half = analyzer();
        let mut offset = 0;
        feed(&mut half, &breathing(12.0, 30, 40.0), &mut offset);
        let summary = half.finalize(offset);
        assert_eq!(summary.snapshots.len(), 1);
        assert!((summary.avg_breathing_rate - 12.0).abs() <= 0.5);
    }

    #[test]
    fn overlap_alone_is_not_a_final_window() {
        let mut a = analyzer();
        let mut offset = 0;
        feed(&mut a, &breathing(12.0, 60, 40.0), &mut offset);
        assert_eq!(a.finalize(offset).snapshots.len(), 1);
    }

    #[test]
    fn low_regularity_counts_from_second_window() {
        let mut a = analyzer();
        let weak = BreathingReading {
            rate_bpm: 14.0,
            regularity: 0.1,
            amplitude: 30.0,
        };
        assert!(!a.classify_disturbance(&weak));
        assert!(a.classify_disturbance(&weak));
        assert!(a.classify_disturbance(&weak));

        // A window with no reading breaks the run.
        assert!(!a.classify_disturbance(&BreathingReading::default()));
        assert!(!a.classify_disturbance(&weak));
    }

    #[test]
    fn missing_reading_is_not_a_breath_gap() {
        let mut a = analyzer();
        let steady = BreathingReading {
            rate_bpm: 12.0,
            regularity: 0.8,
            amplitude: 30.0,
        };
        assert!(!a.classify_disturbance(&steady));
        // Rate 0 sits below the gap threshold but carries no reading.
        assert!(!a.classify_disturbance(&BreathingReading::default()));
        // The next real reading is not compared against the missing one.
        let fast = BreathingReading {
            rate_bpm: 20.0,
            ..steady
        };
        assert!(!a.classify_disturbance(&fast));
    }

    #[test]
    fn breath_gap_rate_is_a_disturbance() {
        let mut a = analyzer();
        let gap = BreathingReading {
            rate_bpm: 5.0,
            regularity: 0.6,
            amplitude: 30.0,
        };
        assert!(a.classify_disturbance(&gap));
    }

    #[test]
    fn phases_are_run_length_coalesced() {
        let snaps = vec![
            snapshot(12.0, 0.7, false, 0),
            snapshot(12.5, 0.8, false, 1),
            snapshot(20.0, 0.6, false, 2),
            snapshot(9.0, 0.3, true, 3),
            snapshot(12.0, 0.7, false, 4),
        ];
        let phases = build_phases(&snaps);
        let kinds: Vec<BreathingPhase> = phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            kinds,
            vec![
                BreathingPhase::Quiet,
                BreathingPhase::Active,
                BreathingPhase::Disturbed,
                BreathingPhase::Quiet
            ]
        );
        assert_eq!(phases[0].start_time, snaps[0].timestamp);
        assert_eq!(phases[0].end_time, snaps[2].timestamp);
        assert_eq!(phases[3].start_time, phases[3].end_time);
    }
}
