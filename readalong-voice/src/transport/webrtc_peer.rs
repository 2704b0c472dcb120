//! WebRTC media engine for the peer transport
//!
//! Each connection attempt gets its own `RTCPeerConnection` carrying one
//! send/receive audio track and the provider's event data channel.
//! Microphone frames from the [`CapturePipeline`] are downsampled to 8 kHz
//! and sent as G.711 μ-law; the remote track is decoded, upsampled to the
//! 24 kHz wire rate and rendered through a [`PlaybackQueue`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::capture::{CapturePipeline, CapturedFrame};
use crate::audio::chunk::{AudioChunk, AudioDirection};
use crate::audio::playback::{AudioSink, PlaybackEvent, PlaybackQueue};
use crate::audio::resampler::AudioResampler;
use crate::audio::{g711, pcm};
use crate::network::protocol::REALTIME_SAMPLE_RATE;
use crate::transport::client::{MicrophoneFactory, TransportContext};
use crate::transport::error::{TransportError, TransportResult};
use crate::transport::peer::{PeerConnection, PeerConnectionFactory, PeerEvent};

/// Label of the provider event data channel
pub const EVENTS_CHANNEL: &str = "oai-events";

/// μ-law clock rate
const RTP_SAMPLE_RATE: u32 = 8_000;

/// Audio per RTP packet
const RTP_FRAME_MS: u32 = 20;

/// Bound on ICE candidate gathering before the offer is sent
const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 256;

fn negotiation(e: impl fmt::Display) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: RTP_SAMPLE_RATE,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Media engine restricted to μ-law audio
fn build_api() -> TransportResult<API> {
    let mut media = MediaEngine::default();
    media
        .register_codec(
            RTCRtpCodecParameters {
                capability: pcmu_capability(),
                payload_type: 0,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(negotiation)?;

    let registry = register_default_interceptors(Registry::new(), &mut media).map_err(negotiation)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds [`WebRtcPeer`]s around a fresh microphone per attempt
pub struct WebRtcPeerFactory {
    microphone: MicrophoneFactory,
    sink: Arc<dyn AudioSink>,
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(microphone: MicrophoneFactory, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            microphone,
            sink,
            ice_servers: Vec::new(),
        }
    }

    /// Use the context's microphone and speaker
    pub fn from_context(ctx: &TransportContext) -> Self {
        Self::new(Arc::clone(&ctx.microphone), Arc::clone(&ctx.sink))
    }

    /// STUN/TURN urls, e.g. `stun:stun.l.google.com:19302`
    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = urls;
        self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self) -> TransportResult<Arc<dyn PeerConnection>> {
        let mut capture = CapturePipeline::new((self.microphone)(), RTP_FRAME_MS);
        let (frame_tx, frame_rx) = mpsc::channel(64);
        capture.start(frame_tx).await?;

        match WebRtcPeer::open(&self.ice_servers, Arc::clone(&self.sink), frame_rx).await {
            Ok(mut peer) => {
                peer.capture = tokio::sync::Mutex::new(Some(capture));
                Ok(Arc::new(peer))
            }
            Err(e) => {
                capture.stop().await;
                Err(e)
            }
        }
    }
}

/// One `RTCPeerConnection` with a microphone track and the event channel
pub struct WebRtcPeer {
    connection: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    capture: tokio::sync::Mutex<Option<CapturePipeline>>,
    playback: Arc<PlaybackQueue>,
    uplink: JoinHandle<()>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    async fn open(
        ice_servers: &[String],
        sink: Arc<dyn AudioSink>,
        frames: mpsc::Receiver<CapturedFrame>,
    ) -> TransportResult<Self> {
        let api = build_api()?;
        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        let connection = Arc::new(api.new_peer_connection(config).await.map_err(negotiation)?);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "microphone".to_owned(),
            "readalong".to_owned(),
        ));
        let sender = connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation)?;
        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
        });

        let channel = connection
            .create_data_channel(EVENTS_CHANNEL, None)
            .await
            .map_err(negotiation)?;
        watch_channel(&channel, &event_tx);
        watch_connection(&connection, &event_tx);

        let playback_events = event_tx.clone();
        let playback = Arc::new(PlaybackQueue::new(sink, move |event| {
            let playing = match event {
                PlaybackEvent::Started => true,
                PlaybackEvent::Finished => false,
                PlaybackEvent::Underrun => return,
            };
            let _ = playback_events.try_send(PeerEvent::RemoteAudio { playing });
        }));
        let renderer = Arc::clone(&playback);
        connection.on_track(Box::new(move |remote: Arc<TrackRemote>, _, _| {
            let renderer = Arc::clone(&renderer);
            Box::pin(async move {
                if remote.kind() == RTPCodecType::Audio {
                    info!(ssrc = remote.ssrc(), "Remote audio track started");
                    tokio::spawn(render_remote(remote, renderer));
                }
            })
        }));

        let uplink = tokio::spawn(send_microphone(frames, track, event_tx));

        Ok(Self {
            connection,
            channel,
            events: Mutex::new(Some(event_rx)),
            capture: tokio::sync::Mutex::new(None),
            playback,
            uplink,
            closed: AtomicBool::new(false),
        })
    }
}

fn watch_channel(channel: &Arc<RTCDataChannel>, events: &mpsc::Sender<PeerEvent>) {
    let opened = events.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            debug!(label = EVENTS_CHANNEL, "Data channel open");
            let _ = opened.send(PeerEvent::ChannelOpen).await;
        })
    }));

    let messages = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let messages = messages.clone();
        Box::pin(async move {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = messages.send(PeerEvent::Message(text)).await;
                }
                Err(_) => debug!("Ignoring binary data channel message"),
            }
        })
    }));

    let closed = events.clone();
    channel.on_close(Box::new(move || {
        let closed = closed.clone();
        Box::pin(async move {
            let _ = closed
                .send(PeerEvent::Closed {
                    reason: Some("data channel closed".to_string()),
                })
                .await;
        })
    }));
}

fn watch_connection(connection: &Arc<RTCPeerConnection>, events: &mpsc::Sender<PeerEvent>) {
    let events = events.clone();
    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            debug!(%state, "Peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = events
                    .send(PeerEvent::Closed {
                        reason: Some(format!("peer connection {state}")),
                    })
                    .await;
            }
        })
    }));
}

/// Microphone frames to 20 ms μ-law samples on the local track
async fn send_microphone(
    mut frames: mpsc::Receiver<CapturedFrame>,
    track: Arc<TrackLocalStaticSample>,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut resampler = match AudioResampler::new(REALTIME_SAMPLE_RATE, RTP_SAMPLE_RATE) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!(error = %e, "Microphone track disabled");
            return;
        }
    };
    let packet_len = pcm::samples_per_frame(RTP_SAMPLE_RATE, RTP_FRAME_MS);
    let mut pending: Vec<i16> = Vec::with_capacity(packet_len * 2);

    while let Some(frame) = frames.recv().await {
        let _ = events.try_send(PeerEvent::LocalLevel(frame.level_dbfs));
        match resampler.process(&pcm::i16_to_f32(&frame.samples)) {
            Ok(samples) => pending.extend(pcm::f32_to_i16(&samples)),
            Err(e) => {
                warn!(error = %e, "Dropping microphone frame");
                continue;
            }
        }

        while pending.len() >= packet_len {
            let packet: Vec<i16> = pending.drain(..packet_len).collect();
            let sample = Sample {
                data: g711::encode(&packet).into(),
                duration: Duration::from_millis(u64::from(RTP_FRAME_MS)),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!(error = %e, "Microphone sample not sent");
            }
        }
    }
    debug!("Microphone track finished");
}

/// Remote μ-law RTP to 24 kHz PCM16 chunks on the playback queue
async fn render_remote(track: Arc<TrackRemote>, playback: Arc<PlaybackQueue>) {
    let mut resampler = match AudioResampler::new(RTP_SAMPLE_RATE, REALTIME_SAMPLE_RATE) {
        Ok(resampler) => resampler,
        Err(e) => {
            warn!(error = %e, "Remote audio disabled");
            return;
        }
    };
    let mut sequence = 0u64;

    while let Ok((packet, _)) = track.read_rtp().await {
        let decoded = g711::decode(&packet.payload);
        let samples = match resampler.process(&pcm::i16_to_f32(&decoded)) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Dropping remote audio packet");
                continue;
            }
        };
        sequence += 1;
        playback.enqueue(AudioChunk::new(
            AudioDirection::Inbound,
            sequence,
            pcm::samples_to_bytes(&pcm::f32_to_i16(&samples)),
        ));
    }
    debug!(chunks = sequence, "Remote audio track ended");
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> TransportResult<String> {
        let offer = self.connection.create_offer(None).await.map_err(negotiation)?;
        let mut gathered = self.connection.gathering_complete_promise().await;
        self.connection
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;

        if tokio::time::timeout(GATHER_TIMEOUT, gathered.recv()).await.is_err() {
            warn!("ICE gathering incomplete, sending partial offer");
        }

        let local = self
            .connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Negotiation("no local description".to_string()))?;
        debug!(bytes = local.sdp.len(), "Created SDP offer");
        Ok(local.sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> TransportResult<()> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string()).map_err(negotiation)?;
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(negotiation)
    }

    async fn send(&self, payload: String) -> TransportResult<()> {
        self.channel
            .send_text(payload)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::ConnectionLost(format!("data channel send failed: {e}")))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut capture) = self.capture.lock().await.take() {
            capture.stop().await;
        }
        self.uplink.abort();
        self.playback.shutdown();
        if let Err(e) = self.connection.close().await {
            debug!(error = %e, "Peer connection close failed");
        }
        info!("Peer connection closed");
    }
}
