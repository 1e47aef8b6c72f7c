//! Smart fade: sleep onset hands playback off to passive monitoring.
//!
//! ```text
//! idle ──onset──▶ fading (1 → 0 over 5 min) ──complete──▶ idle
//!                    │
//!               interaction
//!                    ▼
//!                restoring (current → 1 over 30 s) ──▶ idle
//! ```
//!
//! Only the onset detector may start a fade and only user interaction may
//! cancel one. No other detector drives this machine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::info;

use crate::ipc::events::{FadePhase, SmartFadeEvent};

pub const FADE_DURATION_MS: u64 = 5 * 60_000;
pub const RESTORE_DURATION_MS: u64 = 30_000;
/// Ramp re-evaluation cadence.
pub const TICK_INTERVAL_MS: u64 = 3_000;

#[derive(Debug, Clone)]
pub struct SmartFadeController {
    session_started_at: DateTime<Utc>,
    phase: FadePhase,
    volume: f32,
    ramp_from: f32,
    ramp_started_ms: u64,
    triggered_at_ms: Option<u64>,
}

impl SmartFadeController {
    pub fn new(session_started_at: DateTime<Utc>) -> Self {
        Self {
            session_started_at,
            phase: FadePhase::Idle,
            volume: 1.0,
            ramp_from: 1.0,
            ramp_started_ms: 0,
            triggered_at_ms: None,
        }
    }

    pub fn phase(&self) -> FadePhase {
        self.phase
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Start fading out. Ignored unless idle with audible playback.
    pub fn on_sleep_onset(&mut self, now_ms: u64) -> Option<SmartFadeEvent> {
        if self.phase != FadePhase::Idle || self.volume <= 0.0 {
            return None;
        }
        info!(offset_ms = now_ms, "sleep onset, fading playback out");
        self.phase = FadePhase::Fading;
        self.ramp_from = self.volume;
        self.ramp_started_ms = now_ms;
        self.triggered_at_ms = Some(now_ms);
        Some(self.event(false))
    }

    /// Cancel an active fade and ramp back up. A no-op outside `fading`.
    pub fn on_user_interaction(&mut self, now_ms: u64) -> Option<SmartFadeEvent> {
        if self.phase != FadePhase::Fading {
            return None;
        }
        self.volume = self.ramp_volume(now_ms);
        info!(offset_ms = now_ms, volume = self.volume, "fade cancelled, restoring");
        self.phase = FadePhase::Restoring;
        self.ramp_from = self.volume;
        self.ramp_started_ms = now_ms;
        Some(self.event(false))
    }

    /// Advance the active ramp. Emits on every tick while a ramp is running.
    pub fn tick(&mut self, now_ms: u64) -> Option<SmartFadeEvent> {
        if self.phase == FadePhase::Idle {
            return None;
        }
        self.volume = self.ramp_volume(now_ms);
        let finished = match self.phase {
            FadePhase::Fading => self.volume <= 0.0,
            FadePhase::Restoring => self.volume >= 1.0,
            FadePhase::Idle => false,
        };
        if !finished {
            return Some(self.event(false));
        }

        let fade_complete = self.phase == FadePhase::Fading;
        if fade_complete {
            info!(offset_ms = now_ms, "fade complete");
        } else {
            self.triggered_at_ms = None;
        }
        self.phase = FadePhase::Idle;
        Some(self.event(fade_complete))
    }

    pub fn snapshot(&self) -> SmartFadeEvent {
        self.event(false)
    }

    fn ramp_volume(&self, now_ms: u64) -> f32 {
        let elapsed = now_ms.saturating_sub(self.ramp_started_ms) as f64;
        match self.phase {
            FadePhase::Fading => {
                let progress = (elapsed / FADE_DURATION_MS as f64).min(1.0);
                (self.ramp_from as f64 * (1.0 - progress)) as f32
            }
            FadePhase::Restoring => {
                let progress = (elapsed / RESTORE_DURATION_MS as f64).min(1.0);
                let from = self.ramp_from as f64;
                (from + (1.0 - from) * progress) as f32
            }
            FadePhase::Idle => self.volume,
        }
    }

    fn event(&self, fade_complete: bool) -> SmartFadeEvent {
        SmartFadeEvent {
            phase: self.phase,
            is_fading: self.phase == FadePhase::Fading,
            volume: self.volume,
            triggered_at: self
                .triggered_at_ms
                .map(|ms| self.session_started_at + ChronoDuration::milliseconds(ms as i64)),
            fade_complete,
        }
    }
}
