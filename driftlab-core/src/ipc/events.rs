//! Output types handed to collaborators (persistence, UI, playback layer).
//!
//! All types derive `serde::Serialize` + `serde::Deserialize`. Field names are
//! camelCase on the wire; enum values are lowercase / snake_case strings.
//! Serialization itself is the persistence layer's concern; these shapes are
//! the contract.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Detected events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Noise,
    Climate,
    Light,
    Partner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LoudEvent,
    SustainedNoise,
    Snoring,
    Movement,
    LightOn,
    LightOff,
    LightSpike,
    TempChange,
    TempHigh,
    TempLow,
}

impl EventType {
    pub fn category(self) -> EventCategory {
        match self {
            EventType::LoudEvent | EventType::SustainedNoise | EventType::Snoring => {
                EventCategory::Noise
            }
            EventType::Movement => EventCategory::Partner,
            EventType::LightOn | EventType::LightOff | EventType::LightSpike => {
                EventCategory::Light
            }
            EventType::TempChange | EventType::TempHigh | EventType::TempLow => {
                EventCategory::Climate
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::LoudEvent => "loud_event",
            EventType::SustainedNoise => "sustained_noise",
            EventType::Snoring => "snoring",
            EventType::Movement => "movement",
            EventType::LightOn => "light_on",
            EventType::LightOff => "light_off",
            EventType::LightSpike => "light_spike",
            EventType::TempChange => "temp_change",
            EventType::TempHigh => "temp_high",
            EventType::TempLow => "temp_low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Tier by how far a level rose above the ambient baseline.
    pub fn from_delta_db(delta_db: f32) -> Self {
        if delta_db >= 40.0 {
            Severity::High
        } else if delta_db >= 25.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Numeric reading attached to an event. Detectors state explicitly which
/// reading applies instead of leaving optional fields unset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reading {
    NotApplicable,
    #[serde(rename_all = "camelCase")]
    Decibel { level_db: f32 },
    #[serde(rename_all = "camelCase")]
    Lux { lux: f32 },
    #[serde(rename_all = "camelCase")]
    Temperature {
        fahrenheit: f32,
        /// Difference from the thermostat setting, when one was supplied.
        delta_f: Option<f32>,
    },
}

/// A categorized disruption. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedEvent {
    /// `"{session_id}-{seq}"`.
    pub id: String,
    pub session_id: String,
    /// Monotonically increasing per session.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Session time of emission.
    pub offset_ms: u64,
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub severity: Severity,
    pub duration_seconds: f32,
    /// In [0.0, 1.0].
    pub confidence: f32,
    pub reading: Reading,
}

// ---------------------------------------------------------------------------
// Level stream
// ---------------------------------------------------------------------------

/// Emitted for every metering sample: smoothed level plus current baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    pub seq: u64,
    pub current_db: f32,
    pub baseline_db: f32,
}

/// A recording artifact closed by a capture rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSegmentEvent {
    pub index: u32,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
    /// Finalized file, when the source records one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Breathing
// ---------------------------------------------------------------------------

/// Live breathing reading published every onset window (30 s).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreathingState {
    /// Breaths per minute; `0.0` means no clear signal.
    pub rate: f32,
    pub regularity: f32,
    /// True once sleep-like breathing held for the required windows.
    pub sleep_onset_detected: bool,
    pub offset_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreathingSnapshot {
    pub timestamp: DateTime<Utc>,
    pub offset_ms: u64,
    pub breathing_rate: f32,
    pub regularity: f32,
    pub avg_amplitude: f32,
    pub disturbance_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreathingPhase {
    Quiet,
    Active,
    Disturbed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseInterval {
    pub phase: BreathingPhase,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BdiSeverity {
    Normal,
    Mild,
    Moderate,
    Severe,
}

impl BdiSeverity {
    pub fn from_bdi(bdi: f32) -> Self {
        if bdi < 5.0 {
            BdiSeverity::Normal
        } else if bdi < 15.0 {
            BdiSeverity::Mild
        } else if bdi < 30.0 {
            BdiSeverity::Moderate
        } else {
            BdiSeverity::Severe
        }
    }
}

/// Whole-night breathing aggregate. Built once at finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreathTrendSummary {
    pub avg_breathing_rate: f32,
    pub min_breathing_rate: f32,
    pub max_breathing_rate: f32,
    pub avg_regularity: f32,
    pub disturbance_count: u32,
    pub disturbance_minutes: f32,
    /// Disturbances per hour of recording.
    pub bdi: f32,
    pub bdi_severity: BdiSeverity,
    pub recording_hours: f32,
    pub phases: Vec<PhaseInterval>,
    pub snapshots: Vec<BreathingSnapshot>,
}

impl BreathTrendSummary {
    /// Neutral summary for a night without a single valid reading.
    pub fn empty(snapshots: Vec<BreathingSnapshot>) -> Self {
        Self {
            avg_breathing_rate: 0.0,
            min_breathing_rate: 0.0,
            max_breathing_rate: 0.0,
            avg_regularity: 0.0,
            disturbance_count: 0,
            disturbance_minutes: 0.0,
            bdi: 0.0,
            bdi_severity: BdiSeverity::Normal,
            recording_hours: 0.0,
            phases: Vec::new(),
            snapshots,
        }
    }
}

// ---------------------------------------------------------------------------
// Sonar / movement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementLevel {
    Still,
    Minor,
    Major,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepState {
    Awake,
    Light,
    Deep,
}

impl SleepState {
    pub fn is_asleep(self) -> bool {
        matches!(self, SleepState::Light | SleepState::Deep)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonarState {
    /// Display only; set from the breathing trend, never used to classify.
    pub breathing_rate: f32,
    pub movement_level: MovementLevel,
    pub sleep_state: SleepState,
    pub last_movement_offset_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementSample {
    pub timestamp: DateTime<Utc>,
    pub offset_ms: u64,
    pub movement_level: MovementLevel,
    pub sleep_state: SleepState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepEfficiencyData {
    pub total_time_in_bed_minutes: f64,
    pub total_sleep_minutes: f64,
    pub sleep_onset_latency_minutes: f64,
    pub wake_after_sleep_onset_minutes: f64,
    /// Percentage of time in bed spent asleep.
    pub sleep_efficiency: f64,
    pub movement_timeline: Vec<MovementSample>,
}

// ---------------------------------------------------------------------------
// Smart fade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FadePhase {
    Idle,
    Fading,
    Restoring,
}

/// Playback-volume instruction for the audio layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartFadeEvent {
    pub phase: FadePhase,
    pub is_fading: bool,
    /// Playback volume in [0.0, 1.0].
    pub volume: f32,
    pub triggered_at: Option<DateTime<Utc>>,
    /// Set on the transition that completes a fade-out.
    pub fade_complete: bool,
}

// ---------------------------------------------------------------------------
// Engine status / session report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    pub session_id: Option<String>,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created, no session running.
    Idle,
    /// Opening the metering source.
    Starting,
    /// Session running.
    Recording,
    /// Stop requested, finalizing summaries.
    Stopping,
    /// Session finished; engine may start another.
    Stopped,
    /// Session failed to start.
    Error,
}

/// Produced exactly once per session by `SleepEngine::stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub samples_analyzed: u64,
    pub events: Vec<DetectedEvent>,
    pub breath_trend: BreathTrendSummary,
    /// `None` when sonar was disabled for the session.
    pub sleep_efficiency: Option<SleepEfficiencyData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_event_serializes_with_type_field_and_tagged_reading() {
        let event = DetectedEvent {
            id: "night-1-0".into(),
            session_id: "night-1".into(),
            seq: 0,
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("valid ts"),
            offset_ms: 12_000,
            category: EventCategory::Noise,
            kind: EventType::LoudEvent,
            severity: Severity::High,
            duration_seconds: 2.5,
            confidence: 0.8,
            reading: Reading::Decibel { level_db: 78.0 },
        };

        let json = serde_json::to_value(&event).expect("serialize detected event");
        assert_eq!(json["type"], "loud_event");
        assert_eq!(json["category"], "noise");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["sessionId"], "night-1");
        assert_eq!(json["offsetMs"], 12_000);
        assert_eq!(json["reading"]["kind"], "decibel");
        assert_eq!(json["reading"]["levelDb"], 78.0);

        let round_trip: DetectedEvent =
            serde_json::from_value(json).expect("deserialize detected event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn temperature_reading_keeps_explicit_missing_delta() {
        let json = serde_json::to_value(Reading::Temperature {
            fahrenheit: 74.0,
            delta_f: None,
        })
        .expect("serialize reading");
        assert_eq!(json["kind"], "temperature");
        assert!(json["deltaF"].is_null());
    }

    #[test]
    fn event_types_map_to_categories() {
        assert_eq!(EventType::Snoring.category(), EventCategory::Noise);
        assert_eq!(EventType::Movement.category(), EventCategory::Partner);
        assert_eq!(EventType::LightOn.category(), EventCategory::Light);
        assert_eq!(EventType::TempHigh.category(), EventCategory::Climate);
        assert_eq!(EventType::SustainedNoise.as_str(), "sustained_noise");
    }

    #[test]
    fn severity_tiers_by_delta_over_baseline() {
        assert_eq!(Severity::from_delta_db(41.0), Severity::High);
        assert_eq!(Severity::from_delta_db(40.0), Severity::High);
        assert_eq!(Severity::from_delta_db(25.0), Severity::Medium);
        assert_eq!(Severity::from_delta_db(24.9), Severity::Low);
    }

    #[test]
    fn bdi_severity_boundaries() {
        let cases = [
            (4.9, BdiSeverity::Normal),
            (5.0, BdiSeverity::Mild),
            (14.9, BdiSeverity::Mild),
            (15.0, BdiSeverity::Moderate),
            (29.9, BdiSeverity::Moderate),
            (30.0, BdiSeverity::Severe),
        ];
        for (bdi, expected) in cases {
            assert_eq!(BdiSeverity::from_bdi(bdi), expected, "bdi={bdi}");
        }
    }

    #[test]
    fn engine_status_event_serializes_with_lowercase_status() {
        let event = EngineStatusEvent {
            status: EngineStatus::Recording,
            session_id: Some("night-7".into()),
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "recording");
        assert_eq!(json["sessionId"], "night-7");
    }

    #[test]
    fn fade_phase_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<FadePhase>(r#""Fading""#).is_err());
        assert_eq!(
            serde_json::from_str::<FadePhase>(r#""restoring""#).expect("lowercase phase"),
            FadePhase::Restoring
        );
    }
}
