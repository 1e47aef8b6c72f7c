use thiserror::Error;

/// All errors produced by driftlab-core.
#[derive(Debug, Error)]
pub enum DriftError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("metering source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("recording rotation failed: {0}")]
    Rotation(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("replay source error: {0}")]
    Replay(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriftError {
    /// Permission and availability failures end a session start and need
    /// user action. Everything else is recovered at the component boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriftError::PermissionDenied
                | DriftError::SourceUnavailable(_)
                | DriftError::NoDefaultInputDevice
                | DriftError::AudioDevice(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DriftError>;
