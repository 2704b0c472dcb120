use thiserror::Error;

/// Audio-related errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// No audio device found
    #[error("No audio device found")]
    DeviceNotFound,

    /// Microphone access was refused by the OS or the user
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Failed to build audio stream
    #[error("Failed to build audio stream: {0}")]
    StreamBuildFailed(String),

    /// Audio stream error
    #[error("Audio stream error: {0}")]
    StreamError(String),

    /// Resampling failed
    #[error("Resampling failed: {0}")]
    ResampleFailed(String),

    /// A received payload is not valid base64 PCM16
    #[error("Invalid audio payload: {0}")]
    InvalidPayload(String),

    /// Playback of a chunk failed
    #[error("Playback failed: {0}")]
    PlaybackFailed(String),

    /// Capture or playback is already running
    #[error("Audio {0} already running")]
    AlreadyRunning(&'static str),

    /// Failed to get device configuration
    #[error("Failed to get device configuration: {0}")]
    ConfigError(String),

    /// cpal device enumeration error
    #[cfg(feature = "device")]
    #[error("cpal error: {0}")]
    CpalError(#[from] cpal::DevicesError),

    /// Default config error
    #[cfg(feature = "device")]
    #[error("Default config error: {0}")]
    DefaultConfigError(#[from] cpal::DefaultStreamConfigError),

    /// Stream build error
    #[cfg(feature = "device")]
    #[error("Build stream error: {0}")]
    BuildStreamError(#[from] cpal::BuildStreamError),

    /// Stream play error
    #[cfg(feature = "device")]
    #[error("Play stream error: {0}")]
    PlayStreamError(#[from] cpal::PlayStreamError),
}

impl AudioError {
    /// Failures that need user action (device or permission)
    pub fn is_resource_error(&self) -> bool {
        match self {
            AudioError::DeviceNotFound | AudioError::PermissionDenied(_) => true,
            #[cfg(feature = "device")]
            AudioError::CpalError(_)
            | AudioError::DefaultConfigError(_)
            | AudioError::BuildStreamError(_) => true,
            _ => false,
        }
    }
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
