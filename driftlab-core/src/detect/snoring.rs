//! Snoring detector.
//!
//! A "peak" is an up-crossing of `baseline + delta`. Peaks closer than
//! 1 s to the previous one are the same breath and are dropped. The last
//! ten peaks are kept; peaks older than 30 s expire on every tick. Once at
//! least four peaks remain and every interval between them lies in
//! [3 s, 8 s] with a standard deviation under 1.5 s, the pattern is rhythmic
//! enough to call snoring; the peak buffer is then cleared.

use std::collections::VecDeque;

use super::{Detection, EventDetector, LevelFrame};
use crate::ipc::events::{EventType, Reading, Severity};

const MAX_PEAKS: usize = 10;
const MIN_PEAKS: usize = 4;
const PEAK_DEDUP_MS: u64 = 1_000;
const PEAK_EXPIRY_MS: u64 = 30_000;
const MIN_INTERVAL_MS: u64 = 3_000;
const MAX_INTERVAL_MS: u64 = 8_000;
const MAX_INTERVAL_STD_DEV_S: f32 = 1.5;

#[derive(Debug, Clone, Copy)]
struct Peak {
    at_ms: u64,
    level_db: f32,
}

#[derive(Debug, Clone)]
pub struct SnoringDetector {
    delta_db: f32,
    peaks: VecDeque<Peak>,
    was_above: bool,
    last_crossing_ms: Option<u64>,
}

impl SnoringDetector {
    pub fn new(delta_db: f32) -> Self {
        Self {
            delta_db,
            peaks: VecDeque::with_capacity(MAX_PEAKS),
            was_above: false,
            last_crossing_ms: None,
        }
    }

    /// Currently buffered peak times.
    pub fn peak_times(&self) -> Vec<u64> {
        self.peaks.iter().map(|p| p.at_ms).collect()
    }

    fn record_crossing(&mut self, at_ms: u64, level_db: f32) {
        if let Some(last) = self.last_crossing_ms {
            if at_ms.saturating_sub(last) < PEAK_DEDUP_MS {
                return;
            }
        }
        self.last_crossing_ms = Some(at_ms);
        if self.peaks.len() == MAX_PEAKS {
            self.peaks.pop_front();
        }
        self.peaks.push_back(Peak { at_ms, level_db });
    }

    fn expire(&mut self, now_ms: u64) {
        while let Some(front) = self.peaks.front() {
            if now_ms.saturating_sub(front.at_ms) > PEAK_EXPIRY_MS {
                self.peaks.pop_front();
            } else {
                break;
            }
        }
    }

    /// Interval standard deviation in seconds when the peaks are rhythmic.
    fn rhythm(&self) -> Option<f32> {
        if self.peaks.len() < MIN_PEAKS {
            return None;
        }
        let intervals: Vec<u64> = self
            .peaks
            .iter()
            .zip(self.peaks.iter().skip(1))
            .map(|(a, b)| b.at_ms.saturating_sub(a.at_ms))
            .collect();
        if !intervals
            .iter()
            .all(|i| (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(i))
        {
            return None;
        }

        let secs: Vec<f32> = intervals.iter().map(|&i| i as f32 / 1000.0).collect();
        let mean = secs.iter().sum::<f32>() / secs.len() as f32;
        let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / secs.len() as f32;
        let std_dev = variance.sqrt();
        (std_dev < MAX_INTERVAL_STD_DEV_S).then_some(std_dev)
    }
}

impl EventDetector for SnoringDetector {
    fn kind(&self) -> EventType {
        EventType::Snoring
    }

    fn evaluate(&mut self, frame: &LevelFrame<'_>) -> Option<Detection> {
        let threshold = frame.baseline_db + self.delta_db;
        for (t_ms, level) in frame.fresh_samples() {
            let above = level > threshold;
            if above && !self.was_above {
                self.record_crossing(t_ms, level);
            }
            if above {
                if let Some(last) = self.peaks.back_mut() {
                    if last.at_ms + PEAK_DEDUP_MS > t_ms {
                        last.level_db = last.level_db.max(level);
                    }
                }
            }
            self.was_above = above;
        }

        self.expire(frame.now_ms);
        let std_dev = self.rhythm()?;

        let first = self.peaks.front()?.at_ms;
        let last = self.peaks.back()?.at_ms;
        let loudest = self
            .peaks
            .iter()
            .fold(f32::NEG_INFINITY, |acc, p| acc.max(p.level_db));
        let detection = Detection {
            kind: EventType::Snoring,
            severity: Severity::from_delta_db(loudest - frame.baseline_db),
            duration_seconds: last.saturating_sub(first) as f32 / 1000.0,
            confidence: (0.9 - 0.4 * std_dev / MAX_INTERVAL_STD_DEV_S).clamp(0.5, 0.9),
            reading: Reading::Decibel { level_db: loudest },
        };
        self.peaks.clear();
        Some(detection)
    }

    fn reset(&mut self) {
        self.peaks.clear();
        self.was_above = false;
        self.last_crossing_ms = None;
    }
}
