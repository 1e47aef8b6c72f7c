//! Translation of the external sensor feed into detections.
//!
//! Sensor readings arrive irregularly from platform collaborators and never
//! feed the audio detectors. They are translated here at the orchestration
//! layer. Accelerometer and barometer readings carry their own cooldowns;
//! every translated detection then goes through the session's per-type
//! [`CooldownGate`](super::CooldownGate) like the audio detectors do.
//!
//! - accelerometer: delta of the acceleration magnitude from 1 g
//! - barometer: pressure drift against a slowly tracking baseline
//! - pre-classified events (light, climate) are mapped to typed readings

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Detection;
use crate::ipc::events::{EventCategory, EventType, Reading, Severity};

const MOVEMENT_THRESHOLD_G: f32 = 0.15;
const SIGNIFICANT_MOVEMENT_G: f32 = 0.4;
const MOVEMENT_COOLDOWN_MS: u64 = 60_000;

const PRESSURE_CHANGE_HPA: f32 = 5.0;
const PRESSURE_COOLDOWN_MS: u64 = 300_000;
const PRESSURE_BASELINE_WEIGHT: f32 = 0.95;

/// One reading from the external sensor feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sensor", rename_all = "snake_case")]
pub enum SensorInput {
    /// Acceleration in g on each axis.
    Accelerometer { x: f32, y: f32, z: f32 },
    /// Atmospheric pressure in hPa.
    Pressure { hpa: f32 },
    /// Already classified by the platform (light on/off, temperature alerts).
    Event {
        #[serde(rename = "type")]
        kind: EventType,
        value: f32,
        severity: Severity,
        #[serde(default = "default_event_confidence")]
        confidence: f32,
    },
}

fn default_event_confidence() -> f32 {
    0.7
}

#[derive(Debug, Clone, Default)]
pub struct SensorTranslator {
    thermostat_f: Option<f32>,
    last_movement_ms: Option<u64>,
    pressure_baseline: Option<f32>,
    last_pressure_ms: Option<u64>,
}

impl SensorTranslator {
    pub fn new(thermostat_f: Option<f32>) -> Self {
        Self {
            thermostat_f,
            ..Self::default()
        }
    }

    pub fn translate(&mut self, input: SensorInput, now_ms: u64) -> Option<Detection> {
        match input {
            SensorInput::Accelerometer { x, y, z } => self.movement(x, y, z, now_ms),
            SensorInput::Pressure { hpa } => self.pressure(hpa, now_ms),
            SensorInput::Event {
                kind,
                value,
                severity,
                confidence,
            } => Some(Detection {
                kind,
                severity,
                duration_seconds: 1.0,
                confidence: confidence.clamp(0.0, 1.0),
                reading: self.reading_for(kind, value),
            }),
        }
    }

    fn movement(&mut self, x: f32, y: f32, z: f32, now_ms: u64) -> Option<Detection> {
        let magnitude = (x * x + y * y + z * z).sqrt();
        let delta = (magnitude - 1.0).abs();
        if delta < MOVEMENT_THRESHOLD_G {
            return None;
        }
        if cooling_down(self.last_movement_ms, now_ms, MOVEMENT_COOLDOWN_MS) {
            return None;
        }
        self.last_movement_ms = Some(now_ms);
        debug!(delta_g = delta, "movement detected");

        Some(Detection {
            kind: EventType::Movement,
            severity: if delta >= SIGNIFICANT_MOVEMENT_G {
                Severity::Medium
            } else {
                Severity::Low
            },
            duration_seconds: 1.0,
            confidence: (0.4 + delta * 0.5).min(0.9),
            reading: Reading::NotApplicable,
        })
    }

    fn pressure(&mut self, hpa: f32, now_ms: u64) -> Option<Detection> {
        let Some(baseline) = self.pressure_baseline else {
            self.pressure_baseline = Some(hpa);
            return None;
        };
        self.pressure_baseline =
            Some(baseline * PRESSURE_BASELINE_WEIGHT + hpa * (1.0 - PRESSURE_BASELINE_WEIGHT));

        if (hpa - baseline).abs() < PRESSURE_CHANGE_HPA
            || cooling_down(self.last_pressure_ms, now_ms, PRESSURE_COOLDOWN_MS)
        {
            return None;
        }
        self.last_pressure_ms = Some(now_ms);

        // Phones carry no thermometer; the thermostat setting is the only
        // temperature available.
        let reading = match self.thermostat_f {
            Some(fahrenheit) => Reading::Temperature {
                fahrenheit,
                delta_f: None,
            },
            None => Reading::NotApplicable,
        };
        Some(Detection {
            kind: EventType::TempChange,
            severity: Severity::Low,
            duration_seconds: 1.0,
            confidence: 0.5,
            reading,
        })
    }

    fn reading_for(&self, kind: EventType, value: f32) -> Reading {
        match kind.category() {
            EventCategory::Light => Reading::Lux { lux: value },
            EventCategory::Climate => Reading::Temperature {
                fahrenheit: value,
                delta_f: self.thermostat_f.map(|t| value - t),
            },
            EventCategory::Noise => Reading::Decibel { level_db: value },
            EventCategory::Partner => Reading::NotApplicable,
        }
    }
}

fn cooling_down(last: Option<u64>, now_ms: u64, window_ms: u64) -> bool {
    last.is_some_and(|last| now_ms.saturating_sub(last) < window_ms)
}
