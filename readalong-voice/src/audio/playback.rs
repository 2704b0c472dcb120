//! Serial playback of received audio
//!
//! Chunks are played one at a time in arrival order: the worker awaits
//! [`AudioSink::play`] for a chunk before dequeuing the next, so playback
//! never overlaps no matter how fast deltas arrive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::chunk::AudioChunk;
use crate::audio::error::AudioResult;
use crate::network::protocol::REALTIME_SAMPLE_RATE;

/// Output device abstraction
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `chunk`; resolves once it has finished playing
    async fn play(&self, chunk: &AudioChunk) -> AudioResult<()>;

    /// Cut the currently playing chunk short
    fn interrupt(&self) {}
}

/// Playback edges reported by [`PlaybackQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// First chunk after idle began playing
    Started,
    /// Queue drained and playback went idle
    Finished,
    /// Queue drained while the response was still streaming
    Underrun,
}

struct QueuedChunk {
    generation: u64,
    chunk: AudioChunk,
}

struct Shared {
    generation: AtomicU64,
    streaming: AtomicBool,
    playing: AtomicBool,
    pending: AtomicUsize,
    played: AtomicU64,
}

type EventCallback = Arc<dyn Fn(PlaybackEvent) + Send + Sync>;

/// FIFO playback queue with a single worker task
pub struct PlaybackQueue {
    tx: mpsc::UnboundedSender<QueuedChunk>,
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    worker: JoinHandle<()>,
}

impl PlaybackQueue {
    /// Spawn the worker; `on_event` runs on the worker task
    pub fn new<F>(sink: Arc<dyn AudioSink>, on_event: F) -> Self
    where
        F: Fn(PlaybackEvent) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            streaming: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            played: AtomicU64::new(0),
        });

        let worker = tokio::spawn(playback_worker(
            rx,
            Arc::clone(&sink),
            Arc::clone(&shared),
            Arc::new(on_event),
        ));

        Self {
            tx,
            shared,
            sink,
            worker,
        }
    }

    /// Append a chunk to the back of the queue
    pub fn enqueue(&self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }
        let item = QueuedChunk {
            generation: self.shared.generation.load(Ordering::SeqCst),
            chunk,
        };
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Playback worker gone, dropping chunk");
        }
    }

    /// Mark whether the provider is still sending audio for this response
    pub fn set_streaming(&self, streaming: bool) {
        self.shared.streaming.store(streaming, Ordering::SeqCst);
    }

    /// Drop everything queued and interrupt the current chunk
    pub fn clear(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.sink.interrupt();
        debug!("Playback queue cleared");
    }

    /// Chunks waiting to be played
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Chunks played to completion
    pub fn played(&self) -> u64 {
        self.shared.played.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    /// Stop the worker; queued chunks are discarded
    pub fn shutdown(&self) {
        self.clear();
        self.worker.abort();
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn playback_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedChunk>,
    sink: Arc<dyn AudioSink>,
    shared: Arc<Shared>,
    on_event: EventCallback,
) {
    loop {
        let item = if shared.playing.load(Ordering::SeqCst) {
            match rx.try_recv() {
                Ok(item) => item,
                Err(mpsc::error::TryRecvError::Empty) => {
                    shared.playing.store(false, Ordering::SeqCst);
                    if shared.streaming.load(Ordering::SeqCst) {
                        debug!("Playback buffer underrun");
                        on_event(PlaybackEvent::Underrun);
                    }
                    on_event(PlaybackEvent::Finished);
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        } else {
            match rx.recv().await {
                Some(item) => item,
                None => break,
            }
        };

        shared.pending.fetch_sub(1, Ordering::SeqCst);
        if item.generation != shared.generation.load(Ordering::SeqCst) {
            continue;
        }

        if !shared.playing.swap(true, Ordering::SeqCst) {
            on_event(PlaybackEvent::Started);
        }

        match sink.play(&item.chunk).await {
            Ok(()) => {
                shared.played.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!(sequence = item.chunk.sequence, "Chunk playback failed: {}", e),
        }
    }

    debug!("Playback worker finished");
}

/// Sink that takes real time to "play" a chunk without an output device
pub struct PacedSink {
    sample_rate: u32,
    interrupted: Notify,
}

impl PacedSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            interrupted: Notify::new(),
        }
    }
}

impl Default for PacedSink {
    fn default() -> Self {
        Self::new(REALTIME_SAMPLE_RATE)
    }
}

#[async_trait]
impl AudioSink for PacedSink {
    async fn play(&self, chunk: &AudioChunk) -> AudioResult<()> {
        let duration = Duration::from_millis(chunk.duration_ms(self.sample_rate));
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.interrupted.notified() => {}
        }
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupted.notify_waiters();
    }
}
