//! Hardware microphone and speaker through cpal
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it until told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, StreamConfig};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::audio::capture::MicrophoneSource;
use crate::audio::chunk::AudioChunk;
use crate::audio::error::{AudioError, AudioResult};
use crate::audio::pcm;
use crate::audio::playback::AudioSink;
use crate::audio::resampler::AudioResampler;
use crate::network::protocol::REALTIME_SAMPLE_RATE;

/// Output ring capacity in seconds of audio
const OUTPUT_BUFFER_SECS: usize = 4;

fn find_input_device(host: &Host, name: Option<&str>) -> AudioResult<Device> {
    match name {
        None => host.default_input_device().ok_or(AudioError::DeviceNotFound),
        Some(wanted) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or(AudioError::DeviceNotFound),
    }
}

/// System microphone
pub struct CpalMicrophone {
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
}

impl CpalMicrophone {
    /// Resolve `device_name` (or the default input) and read its format
    pub fn new(device_name: Option<&str>) -> AudioResult<Self> {
        let host = cpal::default_host();
        let device = find_input_device(&host, device_name)?;
        let config = device.default_input_config()?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate = config.sample_rate().0,
            channels = config.channels(),
            "Microphone resolved"
        );

        Ok(Self {
            device_name: device_name.map(str::to_string),
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            stop_tx: None,
        })
    }
}

fn run_input_stream(
    device_name: Option<&str>,
    channels: u16,
    sample_rate: u32,
    sender: mpsc::Sender<Vec<f32>>,
) -> AudioResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = find_input_device(&host, device_name)?;
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = channels.max(1) as usize;

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect();
            // Never block the audio thread; drop the block when full
            let _ = sender.try_send(mono);
        },
        |err| error!("Microphone stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn start(&mut self) -> AudioResult<mpsc::Receiver<Vec<f32>>> {
        if self.stop_tx.is_some() {
            return Err(AudioError::AlreadyRunning("microphone"));
        }

        let (tx, rx) = mpsc::channel(100);
        let (ready_tx, ready_rx) = oneshot::channel::<AudioResult<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let (channels, sample_rate) = (self.channels, self.sample_rate);

        std::thread::Builder::new()
            .name("readalong-mic".to_string())
            .spawn(move || {
                match run_input_stream(device_name.as_deref(), channels, sample_rate, tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        debug!("Microphone stream released");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamBuildFailed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                info!("Microphone capture started");
                Ok(rx)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::StreamBuildFailed(
                "microphone thread exited".to_string(),
            )),
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
            info!("Microphone capture stopped");
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_capturing(&self) -> bool {
        self.stop_tx.is_some()
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SinkWriter {
    producer: ringbuf::HeapProd<f32>,
    resampler: AudioResampler,
}

/// System speaker fed through a lock-free ring buffer
pub struct CpalSink {
    writer: Mutex<SinkWriter>,
    flush: Arc<AtomicBool>,
    interrupted: AtomicBool,
    device_rate: u32,
    _stop_tx: std::sync::mpsc::Sender<()>,
}

impl CpalSink {
    /// Open the default output device
    pub fn open() -> AudioResult<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::DeviceNotFound)?;
        let supported = device.default_output_config()?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels();

        let ring = HeapRb::<f32>::new(device_rate as usize * OUTPUT_BUFFER_SECS);
        let (producer, consumer) = ring.split();
        let flush = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<AudioResult<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let thread_flush = Arc::clone(&flush);

        std::thread::Builder::new()
            .name("readalong-speaker".to_string())
            .spawn(move || {
                match run_output_stream(channels, device_rate, consumer, thread_flush) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamBuildFailed(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamBuildFailed("speaker thread exited".to_string()))??;

        info!(device_rate, channels, "Speaker output opened");

        Ok(Self {
            writer: Mutex::new(SinkWriter {
                producer,
                resampler: AudioResampler::new(REALTIME_SAMPLE_RATE, device_rate)?,
            }),
            flush,
            interrupted: AtomicBool::new(false),
            device_rate,
            _stop_tx: stop_tx,
        })
    }

    fn buffered(&self) -> usize {
        self.writer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .producer
            .occupied_len()
    }
}

fn run_output_stream(
    channels: u16,
    sample_rate: u32,
    mut consumer: ringbuf::HeapCons<f32>,
    flush: Arc<AtomicBool>,
) -> AudioResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(AudioError::DeviceNotFound)?;
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = channels.max(1) as usize;

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            if flush.swap(false, Ordering::AcqRel) {
                while consumer.try_pop().is_some() {}
            }
            for frame in data.chunks_mut(channels) {
                let sample = consumer.try_pop().unwrap_or(0.0);
                frame.fill(sample);
            }
        },
        |err| error!("Speaker stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, chunk: &AudioChunk) -> AudioResult<()> {
        self.interrupted.store(false, Ordering::SeqCst);

        let samples = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| AudioError::PlaybackFailed("speaker writer poisoned".to_string()))?;
            writer
                .resampler
                .process(&pcm::i16_to_f32(&chunk.samples()))?
        };

        let mut offset = 0;
        while offset < samples.len() {
            if self.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }
            let pushed = self
                .writer
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .producer
                .push_slice(&samples[offset..]);
            offset += pushed;
            if offset < samples.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        // Resolve once the device has consumed what we wrote
        while self.buffered() > 0 && !self.interrupted.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.flush.store(true, Ordering::SeqCst);
        self.writer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .resampler
            .reset();
        debug!(device_rate = self.device_rate, "Speaker output interrupted");
    }
}
