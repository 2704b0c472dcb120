use crate::audio::error::{AudioError, AudioResult};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, info};

/// Converts captured audio to the provider's 24 kHz wire rate
///
/// Input of any length is buffered internally and processed in 10 ms
/// chunks. When input and output rates match, samples pass through
/// untouched.
pub struct AudioResampler {
    inner: Option<SincState>,
    pending: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
    chunk_size: usize,
}

struct SincState {
    resampler: SincFixedIn<f32>,
    input_buffer: Vec<Vec<f32>>,
    output_buffer: Vec<Vec<f32>>,
}

impl AudioResampler {
    /// Create a resampler from `input_rate` to `output_rate`
    ///
    /// # Example
    /// ```no_run
    /// use readalong_voice_lib::audio::AudioResampler;
    ///
    /// // 48 kHz microphone to the 24 kHz realtime wire format
    /// let mut resampler = AudioResampler::new(48_000, 24_000).unwrap();
    /// let out = resampler.process(&vec![0.0f32; 960]).unwrap();
    /// assert_eq!(out.len(), 480);
    /// ```
    pub fn new(input_rate: u32, output_rate: u32) -> AudioResult<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(AudioError::ResampleFailed(format!(
                "Invalid sample rates: {input_rate} -> {output_rate}"
            )));
        }

        let chunk_size = (input_rate / 100).max(1) as usize;

        if input_rate == output_rate {
            info!(rate = input_rate, "Resampler in passthrough mode");
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                input_rate,
                output_rate,
                chunk_size,
            });
        }

        let ratio = output_rate as f64 / input_rate as f64;
        debug!(input_rate, output_rate, ratio, chunk_size, "Creating sinc resampler");

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
            .map_err(|e| AudioError::ResampleFailed(format!("Failed to create resampler: {e}")))?;

        let input_buffer = resampler.input_buffer_allocate(true);
        let output_buffer = resampler.output_buffer_allocate(true);

        Ok(Self {
            inner: Some(SincState {
                resampler,
                input_buffer,
                output_buffer,
            }),
            pending: Vec::new(),
            input_rate,
            output_rate,
            chunk_size,
        })
    }

    /// Feed samples of any length; returns whatever complete chunks produced
    ///
    /// Up to one chunk of input may be held back until more arrives.
    pub fn process(&mut self, input: &[f32]) -> AudioResult<Vec<f32>> {
        let Some(state) = self.inner.as_mut() else {
            return Ok(input.to_vec());
        };

        self.pending.extend_from_slice(input);
        let mut output = Vec::new();

        while self.pending.len() >= self.chunk_size {
            state.input_buffer[0].copy_from_slice(&self.pending[..self.chunk_size]);
            self.pending.drain(..self.chunk_size);

            let (_, produced) = state
                .resampler
                .process_into_buffer(&state.input_buffer, &mut state.output_buffer, None)
                .map_err(|e| AudioError::ResampleFailed(e.to_string()))?;

            output.extend_from_slice(&state.output_buffer[0][..produced]);
        }

        Ok(output)
    }

    /// Drop buffered input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(state) = self.inner.as_mut() {
            state.resampler.reset();
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Input samples consumed per internal processing step
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Input samples waiting for a full chunk
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_at_wire_rate() {
        let mut resampler = AudioResampler::new(24_000, 24_000).unwrap();
        assert!(resampler.is_passthrough());

        let input = vec![0.25f32; 333];
        assert_eq!(resampler.process(&input).unwrap(), input);
    }

    #[test]
    fn test_48k_to_24k_halves_length() {
        let mut resampler = AudioResampler::new(48_000, 24_000).unwrap();
        assert_eq!(resampler.chunk_size(), 480);

        let output = resampler.process(&vec![0.0f32; 4800]).unwrap();
        assert_eq!(output.len(), 2400);
        assert_eq!(resampler.pending_len(), 0);
    }

    #[test]
    fn test_partial_chunk_is_buffered() {
        let mut resampler = AudioResampler::new(44_100, 24_000).unwrap();

        let output = resampler.process(&vec![0.0f32; 100]).unwrap();
        assert!(output.is_empty());
        assert_eq!(resampler.pending_len(), 100);

        resampler.reset();
        assert_eq!(resampler.pending_len(), 0);
    }

    #[test]
    fn test_invalid_rate() {
        assert!(matches!(
            AudioResampler::new(0, 24_000),
            Err(AudioError::ResampleFailed(_))
        ));
    }
}
