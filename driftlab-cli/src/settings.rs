//! Persistent host settings (JSON file in the app data directory).
//!
//! Precedence, lowest first: built-in defaults, the settings file,
//! `DRIFTLAB_*` environment variables, command-line flags.

use std::fs;
use std::path::{Path, PathBuf};

use driftlab_core::{SessionConfig, Sensitivity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub sensitivity: String,
    pub thermostat_f: Option<f32>,
    pub sonar_enabled: bool,
    pub smart_fade_enabled: bool,
    /// Also stream the 10 Hz level feed.
    pub emit_levels: bool,
    /// Keep the microphone audio as rotating WAV segments.
    pub record_audio: bool,
    /// Parent of the per-session recording folders.
    pub recording_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            sensitivity: "medium".into(),
            thermostat_f: None,
            sonar_enabled: true,
            smart_fade_enabled: true,
            emit_levels: false,
            record_audio: true,
            recording_dir: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.sensitivity = normalize_sensitivity(&self.sensitivity);
        self.thermostat_f = self
            .thermostat_f
            .filter(|t| t.is_finite())
            .map(|t| t.clamp(50.0, 90.0));
        self.preferred_input_device = self
            .preferred_input_device
            .as_ref()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.recording_dir = self
            .recording_dir
            .take()
            .filter(|d| !d.as_os_str().is_empty());
    }

    /// Folder for this session's segments, or `None` when recording is off.
    pub fn session_recording_dir(&self, session_id: &str) -> Option<PathBuf> {
        if !self.record_audio {
            return None;
        }
        let root = self.recording_dir.clone().unwrap_or_else(|| {
            default_settings_path()
                .parent()
                .map(|dir| dir.join("recordings"))
                .unwrap_or_else(|| PathBuf::from("recordings"))
        });
        Some(root.join(session_id))
    }

    /// Apply `DRIFTLAB_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DRIFTLAB_SENSITIVITY") {
            self.sensitivity = v;
        }
        if let Some(v) = lookup("DRIFTLAB_THERMOSTAT_F").and_then(|v| v.trim().parse().ok()) {
            self.thermostat_f = Some(v);
        }
        if let Some(v) = lookup("DRIFTLAB_SONAR").and_then(|v| parse_flag(&v)) {
            self.sonar_enabled = v;
        }
        if let Some(v) = lookup("DRIFTLAB_SMART_FADE").and_then(|v| parse_flag(&v)) {
            self.smart_fade_enabled = v;
        }
        if let Some(v) = lookup("DRIFTLAB_INPUT_DEVICE") {
            self.preferred_input_device = Some(v);
        }
        if let Some(v) = lookup("DRIFTLAB_EMIT_LEVELS").and_then(|v| parse_flag(&v)) {
            self.emit_levels = v;
        }
        if let Some(v) = lookup("DRIFTLAB_RECORD").and_then(|v| parse_flag(&v)) {
            self.record_audio = v;
        }
        if let Some(v) = lookup("DRIFTLAB_RECORDING_DIR") {
            self.recording_dir = Some(PathBuf::from(v));
        }
        self.normalize();
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn session_config(&self, session_id: impl Into<String>) -> SessionConfig {
        SessionConfig {
            session_id: session_id.into(),
            sensitivity: self.sensitivity.parse().unwrap_or_default(),
            thermostat_f: self.thermostat_f,
            sonar_enabled: self.sonar_enabled,
            smart_fade_enabled: self.smart_fade_enabled,
        }
    }
}

pub fn normalize_sensitivity(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" | "relaxed" => Sensitivity::Low.to_string(),
        "high" | "light-sleeper" | "light_sleeper" => Sensitivity::High.to_string(),
        _ => Sensitivity::Medium.to_string(),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("DriftLab")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("driftlab")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_json_falls_back_to_defaults_and_normalizes() {
        let mut settings: AppSettings =
            serde_json::from_str(r#"{"sensitivity":" HIGH ","thermostatF":120.0}"#)
                .expect("partial settings json");
        settings.normalize();
        assert_eq!(settings.sensitivity, "high");
        assert_eq!(settings.thermostat_f, Some(90.0));
        assert!(settings.sonar_enabled);
        assert!(!settings.emit_levels);
        assert!(settings.record_audio);
    }

    #[test]
    fn recording_folder_is_per_session_and_can_be_disabled() {
        let mut settings = AppSettings::default();
        settings.recording_dir = Some(PathBuf::from("/var/driftlab"));
        assert_eq!(
            settings.session_recording_dir("night-1"),
            Some(PathBuf::from("/var/driftlab/night-1"))
        );

        settings.apply_overrides(|key| (key == "DRIFTLAB_RECORD").then(|| "off".to_string()));
        assert_eq!(settings.session_recording_dir("night-1"), None);

        let mut fallback = AppSettings::default();
        fallback.recording_dir = Some(PathBuf::new());
        fallback.normalize();
        let dir = fallback.session_recording_dir("night-2").expect("recording enabled");
        assert!(dir.ends_with("recordings/night-2"));
    }

    #[test]
    fn unknown_sensitivity_becomes_medium() {
        assert_eq!(normalize_sensitivity("extreme"), "medium");
        assert_eq!(normalize_sensitivity("light-sleeper"), "high");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            ("DRIFTLAB_SENSITIVITY", "low"),
            ("DRIFTLAB_SONAR", "off"),
            ("DRIFTLAB_THERMOSTAT_F", "67.5"),
            ("DRIFTLAB_SMART_FADE", "maybe"),
        ]
        .into_iter()
        .collect();
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.sensitivity, "low");
        assert!(!settings.sonar_enabled);
        assert_eq!(settings.thermostat_f, Some(67.5));
        assert!(settings.smart_fade_enabled, "unparseable flag is ignored");

        let session = settings.session_config("night-7");
        assert_eq!(session.sensitivity, Sensitivity::Low);
        assert_eq!(session.session_id, "night-7");
        assert!(!session.sonar_enabled);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("driftlab-settings-does-not-exist.json");
        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn save_then_load_keeps_values() {
        let path = std::env::temp_dir()
            .join(format!("driftlab-settings-{}", std::process::id()))
            .join("settings.json");
        let mut settings = AppSettings::default();
        settings.thermostat_f = Some(68.0);
        settings.emit_levels = true;
        save_settings(&path, &settings).expect("write settings");
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(path.parent().expect("parent dir"));
    }
}
