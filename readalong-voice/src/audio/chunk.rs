use std::fmt;

use serde::{Deserialize, Serialize};

use crate::audio::error::AudioResult;
use crate::audio::pcm;

/// Which way a chunk travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDirection {
    /// Captured from the microphone, sent to the provider
    Outbound,
    /// Received from the provider, played to the speaker
    Inbound,
}

impl fmt::Display for AudioDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioDirection::Outbound => f.write_str("outbound"),
            AudioDirection::Inbound => f.write_str("inbound"),
        }
    }
}

/// A unit of PCM16 mono audio
///
/// `sequence` is assigned in arrival order by whoever produces the chunk;
/// consumers never reorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub direction: AudioDirection,
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

impl AudioChunk {
    pub fn new(direction: AudioDirection, sequence: u64, bytes: Vec<u8>) -> Self {
        Self {
            direction,
            sequence,
            bytes,
        }
    }

    /// Decode a base64 delta received from the provider
    pub fn from_base64(sequence: u64, payload: &str) -> AudioResult<Self> {
        Ok(Self::new(
            AudioDirection::Inbound,
            sequence,
            pcm::decode_base64(payload)?,
        ))
    }

    pub fn samples(&self) -> Vec<i16> {
        pcm::bytes_to_samples(&self.bytes)
    }

    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        pcm::duration_ms(self.bytes.len(), sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
