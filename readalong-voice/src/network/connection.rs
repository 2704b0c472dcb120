/// WebSocket connection to a realtime endpoint
///
/// The same client opens the upstream provider socket (from the relay) and
/// the relay socket (from the relayed transport); only the URL and headers
/// differ.
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::protocol::{InboundFrame, ServerEvent};
use crate::state::config::ProviderConfig;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use reqwest::Url;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode},
    },
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the WebSocket stream
pub type WsWriter = SplitSink<WsStream, Message>;

/// Read half of the WebSocket stream
pub type WsReader = SplitStream<WsStream>;

/// Where and how to open a realtime socket
///
/// # Example
/// ```
/// use readalong_voice_lib::network::ConnectionConfig;
///
/// let config = ConnectionConfig::new("ws://127.0.0.1:8787/relay")
///     .with_query("jwt", "tok")
///     .with_query("language", "es")
///     .with_timeout(5000);
///
/// let url = config.build_url().unwrap();
/// assert!(url.ends_with("/relay?jwt=tok&language=es"));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// ws:// or wss:// endpoint without query
    pub endpoint: String,

    /// Query parameters, URL-encoded on build
    pub query: Vec<(String, String)>,

    /// Sent as `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,

    /// Send `OpenAI-Beta: realtime=v1`
    pub realtime_beta: bool,

    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: Vec::new(),
            bearer_token: None,
            realtime_beta: false,
            timeout_ms: 10_000,
        }
    }

    /// Upstream provider socket authenticated with the server API key
    pub fn for_provider(provider: &ProviderConfig, model: &str) -> Self {
        Self::new(provider.realtime_url.clone())
            .with_query("model", model)
            .with_bearer(provider.api_key.clone())
            .with_realtime_beta()
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_realtime_beta(mut self) -> Self {
        self.realtime_beta = true;
        self
    }

    /// Set connection timeout in milliseconds
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Build the socket URL with encoded query parameters
    pub fn build_url(&self) -> NetworkResult<String> {
        let url = if self.query.is_empty() {
            Url::parse(&self.endpoint)
        } else {
            Url::parse_with_params(&self.endpoint, &self.query)
        }
        .map_err(|e| NetworkError::InvalidConfig(format!("Invalid URL {}: {}", self.endpoint, e)))?;

        match url.scheme() {
            "ws" | "wss" => Ok(url.to_string()),
            other => Err(NetworkError::InvalidConfig(format!(
                "Unsupported scheme: {other}"
            ))),
        }
    }
}

/// An open realtime socket
#[derive(Debug)]
pub struct RealtimeConnection {
    ws_stream: WsStream,
    is_open: bool,
}

impl RealtimeConnection {
    /// Open the socket described by `config`
    ///
    /// # Errors
    /// `AuthenticationFailed` on HTTP 401/403, `Timeout` when the handshake
    /// exceeds `timeout_ms`, `ConnectionFailed` otherwise.
    pub async fn connect(config: &ConnectionConfig) -> NetworkResult<Self> {
        let url = config.build_url()?;
        debug!(endpoint = %config.endpoint, "Opening realtime socket");

        let mut request = url.into_client_request()?;
        if let Some(token) = &config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| NetworkError::InvalidConfig(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }
        if config.realtime_beta {
            request
                .headers_mut()
                .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
        }

        let timeout = tokio::time::Duration::from_millis(config.timeout_ms);
        let (ws_stream, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| NetworkError::Timeout(config.timeout_ms))?
            .map_err(|e| {
                if let tokio_tungstenite::tungstenite::Error::Http(resp) = &e {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return NetworkError::AuthenticationFailed;
                    }
                    return NetworkError::UnexpectedStatus {
                        status: status.as_u16(),
                    };
                }
                NetworkError::ConnectionFailed(e.to_string())
            })?;

        info!(endpoint = %config.endpoint, status = %response.status(), "Realtime socket open");

        Ok(Self {
            ws_stream,
            is_open: true,
        })
    }

    /// Serialize `message` as JSON and send it as a text frame
    pub async fn send<T: Serialize>(&mut self, message: &T) -> NetworkResult<()> {
        let json = serde_json::to_string(message)?;
        self.send_text(json).await
    }

    /// Send a pre-encoded text frame
    pub async fn send_text(&mut self, text: String) -> NetworkResult<()> {
        if !self.is_open {
            return Err(NetworkError::ConnectionClosed);
        }
        self.ws_stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Receive the next provider event
    ///
    /// Malformed frames are skipped with a warning.
    ///
    /// # Returns
    /// * `Ok(Some(event))` - an event was received
    /// * `Ok(None)` - the connection closed
    pub async fn recv(&mut self) -> NetworkResult<Option<ServerEvent>> {
        while self.is_open {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => match InboundFrame::decode(&text) {
                    InboundFrame::Event(event) => return Ok(Some(event)),
                    InboundFrame::Malformed(reason) => {
                        warn!("Skipping malformed frame: {}", reason);
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!("Received close frame: {:?}", frame);
                    self.is_open = false;
                }
                Some(Ok(Message::Ping(data))) => {
                    self.ws_stream.send(Message::Pong(data)).await?;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(NetworkError::WebSocketError(e));
                }
                None => {
                    self.is_open = false;
                }
            }
        }
        Ok(None)
    }

    /// Send a close frame
    pub async fn close(&mut self) -> NetworkResult<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;
        self.ws_stream.close(None).await?;
        info!("Realtime socket closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Split into independently owned write and read halves
    pub fn split(self) -> (WsWriter, WsReader) {
        self.ws_stream.split()
    }
}
