//! Microphone capture
//!
//! A [`MicrophoneSource`] yields mono f32 blocks at its native rate. The
//! [`CapturePipeline`] resamples them to the wire rate, converts to PCM16
//! and slices fixed-length frames, each tagged with its level in dBFS.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::error::{AudioError, AudioResult};
use crate::audio::pcm;
use crate::audio::resampler::AudioResampler;
use crate::network::protocol::REALTIME_SAMPLE_RATE;

/// Capacity of the raw sample channel between source and pipeline
const RAW_CHANNEL_CAPACITY: usize = 100;

/// Something that can stream microphone samples
///
/// `start` is where the permission prompt and device acquisition happen;
/// refusal is reported as [`AudioError::PermissionDenied`].
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the device and start streaming mono f32 samples
    async fn start(&mut self) -> AudioResult<mpsc::Receiver<Vec<f32>>>;

    /// Release the device; safe to call when not capturing
    fn stop(&mut self);

    /// Native sample rate of the samples yielded by `start`
    fn sample_rate(&self) -> u32;

    fn is_capturing(&self) -> bool;
}

/// One outbound PCM16 frame
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub sequence: u64,
    pub samples: Vec<i16>,
    pub level_dbfs: f32,
}

impl CapturedFrame {
    /// Base64 payload for an `input_audio_buffer.append`
    pub fn to_base64(&self) -> String {
        pcm::encode_samples(&self.samples)
    }
}

/// Resample, convert and frame microphone audio
pub struct CapturePipeline {
    source: Box<dyn MicrophoneSource>,
    output_rate: u32,
    frame_ms: u32,
    processing_task: Option<JoinHandle<()>>,
    stop_signal: Option<oneshot::Sender<()>>,
}

impl CapturePipeline {
    /// Pipeline producing 24 kHz frames of `frame_ms`
    pub fn new(source: Box<dyn MicrophoneSource>, frame_ms: u32) -> Self {
        Self {
            source,
            output_rate: REALTIME_SAMPLE_RATE,
            frame_ms: frame_ms.max(1),
            processing_task: None,
            stop_signal: None,
        }
    }

    /// Start capture and stream frames into `output`
    pub async fn start(&mut self, output: mpsc::Sender<CapturedFrame>) -> AudioResult<()> {
        if self.is_running() {
            return Err(AudioError::AlreadyRunning("capture"));
        }

        let input_rate = self.source.sample_rate();
        let mut resampler = AudioResampler::new(input_rate, self.output_rate)?;
        let frame_samples = pcm::samples_per_frame(self.output_rate, self.frame_ms);

        let input_rx = self.source.start().await?;
        let (stop_tx, stop_rx) = oneshot::channel();

        info!(
            input_rate,
            output_rate = self.output_rate,
            frame_ms = self.frame_ms,
            "Capture pipeline started"
        );

        self.processing_task = Some(tokio::spawn(async move {
            if let Err(e) =
                processing_loop(input_rx, output, stop_rx, &mut resampler, frame_samples).await
            {
                error!("Capture processing loop error: {}", e);
            }
        }));
        self.stop_signal = Some(stop_tx);
        Ok(())
    }

    /// Stop capture and wait for the processing task
    pub async fn stop(&mut self) {
        self.source.stop();

        if let Some(stop_tx) = self.stop_signal.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.processing_task.take() {
            let _ = task.await;
            info!("Capture pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.processing_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn frame_ms(&self) -> u32 {
        self.frame_ms
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.source.stop();
        if let Some(stop_tx) = self.stop_signal.take() {
            let _ = stop_tx.send(());
        }
    }
}

async fn processing_loop(
    mut input_rx: mpsc::Receiver<Vec<f32>>,
    output_tx: mpsc::Sender<CapturedFrame>,
    mut stop_rx: oneshot::Receiver<()>,
    resampler: &mut AudioResampler,
    frame_samples: usize,
) -> AudioResult<()> {
    let mut pcm_buffer: Vec<i16> = Vec::with_capacity(frame_samples * 2);
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            block = input_rx.recv() => {
                let Some(block) = block else {
                    debug!("Microphone channel closed");
                    break;
                };

                let resampled = resampler.process(&block)?;
                if resampled.is_empty() {
                    continue;
                }
                pcm_buffer.extend(pcm::f32_to_i16(&resampled));

                while pcm_buffer.len() >= frame_samples {
                    let samples: Vec<i16> = pcm_buffer.drain(..frame_samples).collect();
                    let frame = CapturedFrame {
                        sequence,
                        level_dbfs: pcm::level_dbfs(&samples),
                        samples,
                    };
                    sequence += 1;

                    if output_tx.send(frame).await.is_err() {
                        warn!("Frame receiver dropped, stopping capture loop");
                        return Ok(());
                    }
                }
            }
            _ = &mut stop_rx => {
                debug!("Capture stop signal received");
                break;
            }
        }
    }

    debug!(frames = sequence, "Capture loop finished");
    Ok(())
}

/// Microphone that replays canned sample blocks
///
/// Used for headless operation and tests. After the script is exhausted the
/// stream stays open (silent) until stopped, like a live microphone.
pub struct ScriptedMicrophone {
    sample_rate: u32,
    blocks: Vec<Vec<f32>>,
    interval: Duration,
    denial: Option<String>,
    task: Option<JoinHandle<()>>,
}

impl ScriptedMicrophone {
    pub fn new(sample_rate: u32, blocks: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            blocks,
            interval: Duration::ZERO,
            denial: None,
            task: None,
        }
    }

    /// A microphone with nothing to say
    pub fn silent(sample_rate: u32) -> Self {
        Self::new(sample_rate, Vec::new())
    }

    /// A microphone whose permission prompt is refused
    pub fn denied(reason: impl Into<String>) -> Self {
        let mut mic = Self::silent(REALTIME_SAMPLE_RATE);
        mic.denial = Some(reason.into());
        mic
    }

    /// Delay before each block
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl MicrophoneSource for ScriptedMicrophone {
    async fn start(&mut self) -> AudioResult<mpsc::Receiver<Vec<f32>>> {
        if let Some(reason) = &self.denial {
            return Err(AudioError::PermissionDenied(reason.clone()));
        }
        if self.task.is_some() {
            return Err(AudioError::AlreadyRunning("microphone"));
        }

        let (tx, rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let blocks = self.blocks.clone();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            for block in blocks {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                if tx.send(block).await.is_err() {
                    return;
                }
            }
            tx.closed().await;
        }));

        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_capturing(&self) -> bool {
        self.task.is_some()
    }
}
