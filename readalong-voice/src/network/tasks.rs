/// Send and receive loops over a split realtime socket
///
/// Each half runs as its own task, connected to the rest of the client by
/// mpsc channels.
use crate::network::connection::{WsReader, WsWriter};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::protocol::{ClientEvent, InboundFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Serialize outgoing client events onto the socket
///
/// Runs until `event_rx` closes, then sends a close frame.
///
/// # Example
/// ```no_run
/// use tokio::sync::mpsc;
/// use readalong_voice_lib::network::{ConnectionConfig, RealtimeConnection};
/// use readalong_voice_lib::network::protocol::ClientEvent;
/// use readalong_voice_lib::network::tasks::sender_task;
///
/// #[tokio::main]
/// async fn main() {
///     let config = ConnectionConfig::new("ws://127.0.0.1:8787/relay");
///     let conn = RealtimeConnection::connect(&config).await.unwrap();
///     let (writer, _reader) = conn.split();
///
///     let (event_tx, event_rx) = mpsc::channel(100);
///     tokio::spawn(sender_task(writer, event_rx));
///     event_tx.send(ClientEvent::ResponseCreate).await.unwrap();
/// }
/// ```
pub async fn sender_task(
    mut ws_writer: WsWriter,
    mut event_rx: mpsc::Receiver<ClientEvent>,
) -> NetworkResult<()> {
    let mut sent = 0u64;

    while let Some(event) = event_rx.recv().await {
        let json = serde_json::to_string(&event).map_err(NetworkError::SerializationError)?;
        ws_writer
            .send(Message::Text(json.into()))
            .await
            .map_err(NetworkError::WebSocketError)?;

        sent += 1;
        if !matches!(event, ClientEvent::AudioAppend { .. }) {
            debug!(event = event.event_type(), "Sent client event");
        }
    }

    info!(sent, "Sender task completed, channel closed");

    if let Err(e) = ws_writer.close().await {
        warn!("Failed to close WebSocket writer: {}", e);
    }
    Ok(())
}

/// Decode provider frames and forward them
///
/// Malformed frames are forwarded as [`InboundFrame::Malformed`] so the
/// consumer decides when repetition becomes fatal.
///
/// # Returns
/// `Ok(())` on a close frame or end of stream, an error on socket failure
pub async fn receiver_task(
    mut ws_reader: WsReader,
    frame_tx: mpsc::Sender<InboundFrame>,
) -> NetworkResult<()> {
    let mut received = 0u64;

    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                received += 1;
                let frame = InboundFrame::decode(&text);
                if let InboundFrame::Malformed(reason) = &frame {
                    warn!("Malformed frame: {}", reason);
                }
                if frame_tx.send(frame).await.is_err() {
                    debug!("Frame receiver dropped");
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                info!("Received close frame: {:?}", frame);
                break;
            }
            Ok(Message::Binary(data)) => {
                warn!("Ignoring binary frame: {} bytes", data.len());
            }
            Ok(_) => {
                // Ping/pong are answered by tungstenite
            }
            Err(e) => {
                warn!("WebSocket error: {}", e);
                return Err(NetworkError::WebSocketError(e));
            }
        }
    }

    info!(received, "Receiver task completed, stream ended");
    Ok(())
}
