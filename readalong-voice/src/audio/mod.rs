/// Microphone capture and framing
pub mod capture;

/// PCM16 audio chunks
pub mod chunk;

/// cpal microphone and speaker
#[cfg(feature = "device")]
pub mod device;

/// Audio-related error types
pub mod error;

/// μ-law codec for the WebRTC audio track
#[cfg(feature = "webrtc")]
pub mod g711;

/// PCM16 conversions and levels
pub mod pcm;

/// Serial playback queue
pub mod playback;

/// Audio resampling
pub mod resampler;

// Re-export commonly used types
pub use capture::{CapturePipeline, CapturedFrame, MicrophoneSource, ScriptedMicrophone};
pub use chunk::{AudioChunk, AudioDirection};
#[cfg(feature = "device")]
pub use device::{CpalMicrophone, CpalSink};
pub use error::{AudioError, AudioResult};
pub use playback::{AudioSink, PacedSink, PlaybackEvent, PlaybackQueue};
pub use resampler::AudioResampler;
