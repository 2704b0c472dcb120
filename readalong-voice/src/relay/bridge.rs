//! One client socket bridged to one upstream provider socket
//!
//! A single task owns both sockets and multiplexes four sources: client
//! frames, upstream frames, the batch tick and the heartbeat. Client frames
//! and non-audio upstream frames are forwarded as they arrive; upstream
//! audio deltas wait for the next tick.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::connection::{RealtimeConnection, WsWriter};
use crate::network::protocol::{ClientEvent, FrameKind, classify_frame};
use crate::relay::batching::AudioBatcher;
use crate::relay::registry::ConnectionRegistry;
use crate::relay::usage::{UsageTracker, base64_decoded_len};

/// Timing for one bridge
#[derive(Debug, Clone, Copy)]
pub struct BridgeTiming {
    pub batch_interval: Duration,
    pub heartbeat_interval: Duration,
    pub sample_rate: u32,
}

/// Why a bridge ended
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEnd {
    ClientClosed,
    UpstreamClosed,
    ClientFailed(String),
    UpstreamFailed(String),
    Shutdown,
}

impl fmt::Display for BridgeEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeEnd::ClientClosed => f.write_str("client closed"),
            BridgeEnd::UpstreamClosed => f.write_str("upstream closed"),
            BridgeEnd::ClientFailed(e) => write!(f, "client error: {e}"),
            BridgeEnd::UpstreamFailed(e) => write!(f, "upstream error: {e}"),
            BridgeEnd::Shutdown => f.write_str("relay shutting down"),
        }
    }
}

type ClientWriter = SplitSink<WebSocket, ClientMessage>;

/// Run the bridge until either side closes, then tear it down
///
/// `bootstrap` is sent upstream before any client frame. The registry
/// entry `connection_id` is touched on every frame and removed on exit.
pub async fn run_bridge(
    connection_id: Uuid,
    client: WebSocket,
    upstream: RealtimeConnection,
    bootstrap: ClientEvent,
    registry: ConnectionRegistry,
    timing: BridgeTiming,
    mut shutdown: watch::Receiver<bool>,
) -> BridgeEnd {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let mut batcher = AudioBatcher::new();
    let mut usage = UsageTracker::new(timing.sample_rate);

    let mut batch_tick = tokio::time::interval(timing.batch_interval);
    batch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + timing.heartbeat_interval,
        timing.heartbeat_interval,
    );

    let end = match send_upstream(&mut upstream_tx, &bootstrap).await {
        Err(e) => BridgeEnd::UpstreamFailed(e),
        Ok(()) => loop {
            tokio::select! {
                msg = client_rx.next() => match msg {
                    Some(Ok(ClientMessage::Text(text))) => {
                        let inbound = inbound_audio_len(&text).map(|len| usage.record_inbound(len));
                        registry.add_usage(connection_id, inbound.unwrap_or(0.0), 0.0).await;

                        if let Err(e) = upstream_tx.send(UpstreamMessage::Text(text.into())).await {
                            break BridgeEnd::UpstreamFailed(e.to_string());
                        }
                    }
                    Some(Ok(ClientMessage::Binary(data))) => {
                        warn!(connection_id = %connection_id, bytes = data.len(), "Ignoring binary client frame");
                    }
                    Some(Ok(ClientMessage::Ping(_) | ClientMessage::Pong(_))) => {
                        registry.touch(connection_id).await;
                    }
                    Some(Ok(ClientMessage::Close(_))) | None => break BridgeEnd::ClientClosed,
                    Some(Err(e)) => break BridgeEnd::ClientFailed(e.to_string()),
                },

                msg = upstream_rx.next() => match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        let text = text.as_str().to_owned();
                        match classify_frame(&text) {
                            FrameKind::AudioDelta => {
                                let len = batcher.push(&text);
                                let outbound = usage.record_outbound(len);
                                registry.add_usage(connection_id, 0.0, outbound).await;
                            }
                            FrameKind::AudioTerminator => {
                                registry.touch(connection_id).await;
                                // Pending audio must reach the client before its terminator
                                if let Err(e) = flush_batch(&mut client_tx, &mut batcher).await {
                                    break BridgeEnd::ClientFailed(e);
                                }
                                if let Err(e) = client_tx.send(ClientMessage::Text(text)).await {
                                    break BridgeEnd::ClientFailed(e.to_string());
                                }
                            }
                            FrameKind::Other => {
                                registry.touch(connection_id).await;
                                if let Err(e) = client_tx.send(ClientMessage::Text(text)).await {
                                    break BridgeEnd::ClientFailed(e.to_string());
                                }
                            }
                        }
                    }
                    Some(Ok(UpstreamMessage::Pong(_))) => {
                        debug!(connection_id = %connection_id, "Upstream pong");
                        registry.touch(connection_id).await;
                    }
                    Some(Ok(UpstreamMessage::Close(frame))) => {
                        debug!(connection_id = %connection_id, ?frame, "Upstream close frame");
                        break BridgeEnd::UpstreamClosed;
                    }
                    None => break BridgeEnd::UpstreamClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break BridgeEnd::UpstreamFailed(e.to_string()),
                },

                _ = batch_tick.tick() => {
                    if let Err(e) = flush_batch(&mut client_tx, &mut batcher).await {
                        break BridgeEnd::ClientFailed(e);
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = upstream_tx.send(UpstreamMessage::Ping(Vec::new().into())).await {
                        break BridgeEnd::UpstreamFailed(e.to_string());
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break BridgeEnd::Shutdown;
                    }
                }
            }
        },
    };

    teardown(connection_id, &end, client_tx, upstream_tx, batcher, &registry, &usage).await;
    end
}

async fn send_upstream(upstream_tx: &mut WsWriter, event: &ClientEvent) -> Result<(), String> {
    let json = serde_json::to_string(event).map_err(|e| e.to_string())?;
    upstream_tx
        .send(UpstreamMessage::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

/// Forward every queued audio batch to the client
async fn flush_batch(client_tx: &mut ClientWriter, batcher: &mut AudioBatcher) -> Result<(), String> {
    if batcher.is_empty() {
        return Ok(());
    }
    let deltas = batcher.len();
    let frames = batcher.flush();
    debug!(deltas, frames = frames.len(), "Flushing audio batch");

    for frame in frames {
        client_tx
            .send(ClientMessage::Text(frame))
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Decoded audio length when `text` is an append event
fn inbound_audio_len(text: &str) -> Option<usize> {
    match serde_json::from_str::<ClientEvent>(text).ok()? {
        ClientEvent::AudioAppend { audio } => Some(base64_decoded_len(&audio)),
        _ => None,
    }
}

async fn teardown(
    connection_id: Uuid,
    end: &BridgeEnd,
    mut client_tx: ClientWriter,
    mut upstream_tx: WsWriter,
    mut batcher: AudioBatcher,
    registry: &ConnectionRegistry,
    usage: &UsageTracker,
) {
    let client_open = !matches!(end, BridgeEnd::ClientClosed | BridgeEnd::ClientFailed(_));
    let upstream_open = !matches!(end, BridgeEnd::UpstreamClosed | BridgeEnd::UpstreamFailed(_));

    if client_open {
        if let Err(e) = flush_batch(&mut client_tx, &mut batcher).await {
            debug!(connection_id = %connection_id, "Final flush failed: {}", e);
        }
        let close = ClientMessage::Close(Some(CloseFrame {
            code: match end {
                BridgeEnd::UpstreamFailed(_) => 1011,
                BridgeEnd::Shutdown => 1001,
                _ => 1000,
            },
            reason: Cow::Owned(end.to_string()),
        }));
        if let Err(e) = client_tx.send(close).await {
            debug!(connection_id = %connection_id, "Client close failed: {}", e);
        }
    }
    if upstream_open {
        if let Err(e) = upstream_tx.close().await {
            debug!(connection_id = %connection_id, "Upstream close failed: {}", e);
        }
    }

    let entry = registry.remove(connection_id).await;
    let summary = usage.summary();
    info!(
        connection_id = %connection_id,
        user_id = entry.as_ref().map(|info| info.user_id.as_str()).unwrap_or("unknown"),
        reason = %end,
        duration_secs = summary.duration.as_secs_f64(),
        inbound_tokens = summary.inbound_tokens,
        outbound_tokens = summary.outbound_tokens,
        estimated_cost_usd = summary.estimated_cost_usd,
        "Relay connection closed"
    );
}
