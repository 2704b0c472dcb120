use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::credentials::{CredentialIssuer, EphemeralCredentialService, credential_routes};
use crate::network::connection::{ConnectionConfig, RealtimeConnection};
use crate::network::protocol::{ClientEvent, REALTIME_SAMPLE_RATE, SessionSettings};
use crate::profile::{Language, Persona, SessionMetadata, VoiceProfile};
use crate::relay::bridge::{BridgeTiming, run_bridge};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::registry::{ConnectionRegistry, RelayConnectionInfo};
use crate::state::AppConfig;

/// Query string of `GET /relay`
#[derive(Debug, Default, Deserialize)]
pub struct RelayQuery {
    /// Ephemeral credential
    pub jwt: Option<String>,
    pub user_id: Option<String>,
    pub language: Option<String>,
    pub model: Option<String>,
    pub persona: Option<String>,
    pub grade: Option<u8>,
    pub activity: Option<String>,
}

/// Resolved parameters of an accepted upgrade
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySession {
    pub user_id: String,
    pub model: String,
    pub profile: VoiceProfile,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: usize,
}

#[derive(Clone)]
struct RelayState {
    config: Arc<AppConfig>,
    registry: ConnectionRegistry,
    issuer: Option<Arc<EphemeralCredentialService>>,
    shutdown: watch::Receiver<bool>,
}

/// WebSocket relay between clients and the realtime provider
///
/// Serves `GET /relay`, `GET /health` and, when an issuer is attached,
/// `POST /credentials`.
pub struct RelayServer {
    config: Arc<AppConfig>,
    registry: ConnectionRegistry,
    issuer: Option<Arc<EphemeralCredentialService>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            registry: ConnectionRegistry::new(),
            issuer: None,
            shutdown_tx,
        }
    }

    /// Issue credentials on `/credentials` and require them on `/relay`
    ///
    /// With an issuer attached, each relay credential is consumed on
    /// upgrade and its bound profile is used for the session.
    pub fn with_issuer(mut self, issuer: Arc<EphemeralCredentialService>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> Router {
        let state = RelayState {
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            issuer: self.issuer.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };

        let mut router = Router::new()
            .route("/relay", get(relay_upgrade))
            .route("/health", get(health))
            .with_state(state);

        if let Some(issuer) = &self.issuer {
            let issuer: Arc<dyn CredentialIssuer> = issuer.clone();
            router = router.merge(credential_routes(issuer));
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Bind the listener and start serving and sweeping
    pub async fn start(self) -> RelayResult<RelayHandle> {
        let addr = format!("{}:{}", self.config.relay.bind, self.config.relay.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let app = self.router();
        let mut stop = self.shutdown_tx.subscribe();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = result {
                error!("Relay server error: {}", e);
            }
        });

        let sweep = tokio::spawn(run_sweep(
            self.registry.clone(),
            self.config.relay.sweep_interval(),
            self.config.relay.inactivity_threshold(),
        ));

        info!(%local_addr, "Relay listening");

        Ok(RelayHandle {
            local_addr,
            registry: self.registry,
            shutdown_tx: self.shutdown_tx,
            server: Some(server),
            sweep,
        })
    }
}

/// A running relay; dropping it stops the server
pub struct RelayHandle {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    shutdown_tx: watch::Sender<bool>,
    server: Option<JoinHandle<()>>,
    sweep: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of the relay endpoint
    pub fn relay_url(&self) -> String {
        format!("ws://{}/relay", self.local_addr)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Close every bridge, stop accepting and clear the registry
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        self.sweep.abort();

        if let Some(server) = self.server.take() {
            if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
                warn!("Relay server did not stop in time");
            }
        }

        let dropped = self.registry.clear().await;
        info!(dropped, "Relay stopped");
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.sweep.abort();
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// Validate an upgrade query without an issuer
///
/// Identity and credential must be present; the profile is resolved from
/// the query's language and metadata.
pub fn resolve_query(query: &RelayQuery, default_model: &str) -> RelayResult<RelaySession> {
    let (_, user_id) = require_identity(query)?;
    let language = parse_language(query)?;

    let persona = query
        .persona
        .as_deref()
        .map(str::parse::<Persona>)
        .transpose()
        .map_err(RelayError::BadRequest)?;
    let metadata = SessionMetadata {
        persona,
        grade: query.grade,
        activity: query.activity.clone(),
    };

    Ok(RelaySession {
        user_id,
        model: query
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| default_model.to_string()),
        profile: VoiceProfile::resolve(language, &metadata),
    })
}

fn require_identity(query: &RelayQuery) -> RelayResult<(String, String)> {
    let jwt = query
        .jwt
        .clone()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RelayError::Unauthorized("missing credential".to_string()))?;
    let user_id = query
        .user_id
        .clone()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RelayError::Unauthorized("missing user identity".to_string()))?;
    Ok((jwt, user_id))
}

fn parse_language(query: &RelayQuery) -> RelayResult<Language> {
    match query.language.as_deref() {
        None | Some("") => Ok(Language::English),
        Some(code) => code
            .parse::<Language>()
            .map_err(|e| RelayError::BadRequest(e.to_string())),
    }
}

fn authorize(state: &RelayState, query: &RelayQuery) -> RelayResult<RelaySession> {
    let Some(issuer) = &state.issuer else {
        return resolve_query(query, &state.config.provider.model);
    };

    let (jwt, user_id) = require_identity(query)?;
    parse_language(query)?;
    let credential = issuer
        .consume(&jwt)
        .map_err(|e| RelayError::Unauthorized(e.to_string()))?;

    Ok(RelaySession {
        user_id,
        model: credential.model.clone(),
        profile: VoiceProfile {
            language: credential.language,
            persona: credential.persona,
            voice: credential.voice.clone(),
            instructions: credential.instructions.clone(),
            turn_detection: credential.turn_detection.clone(),
        },
    })
}

async fn relay_upgrade(
    State(state): State<RelayState>,
    Query(query): Query<RelayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match authorize(&state, &query) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Rejected relay upgrade");
            return e.into_response();
        }
    };

    debug!(user_id = %session.user_id, language = %session.profile.language, "Relay upgrade accepted");
    ws.on_upgrade(move |socket| bridge_connection(socket, state, session))
}

async fn bridge_connection(mut socket: WebSocket, state: RelayState, session: RelaySession) {
    let info = RelayConnectionInfo::new(
        session.user_id.clone(),
        session.profile.language,
        session.model.clone(),
    );
    let connection_id = state.registry.register(info).await;

    let provider = &state.config.provider;
    let upstream_config = ConnectionConfig::for_provider(provider, &session.model)
        .with_timeout(state.config.transport.connect_timeout_ms);

    let upstream = match RealtimeConnection::connect(&upstream_config).await {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "Upstream connect failed");
            let close = Message::Close(Some(CloseFrame {
                code: 1011,
                reason: "upstream unavailable".into(),
            }));
            if let Err(e) = socket.send(close).await {
                debug!("Client close failed: {}", e);
            }
            state.registry.remove(connection_id).await;
            return;
        }
    };
    info!(connection_id = %connection_id, user_id = %session.user_id, model = %session.model, "Relay connection open");

    let bootstrap = ClientEvent::SessionUpdate {
        session: SessionSettings::bootstrap(
            &session.profile,
            &provider.transcription_model,
            state.config.relay.temperature,
            state.config.relay.max_response_output_tokens,
        ),
    };
    let timing = BridgeTiming {
        batch_interval: state.config.relay.batch_interval(),
        heartbeat_interval: state.config.relay.heartbeat_interval(),
        sample_rate: REALTIME_SAMPLE_RATE,
    };

    run_bridge(
        connection_id,
        socket,
        upstream,
        bootstrap,
        state.registry.clone(),
        timing,
        state.shutdown.clone(),
    )
    .await;
}

async fn health(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_connections: state.registry.len().await,
    })
}

/// Log connections idle beyond `threshold`; returns their ids
///
/// Logging only: idle connections are left open.
pub async fn sweep_inactive(registry: &ConnectionRegistry, threshold: Duration) -> Vec<Uuid> {
    let inactive = registry.inactive(threshold).await;
    for (id, idle) in &inactive {
        warn!(connection_id = %id, idle_secs = idle.as_secs(), "Relay connection inactive");
    }
    inactive.into_iter().map(|(id, _)| id).collect()
}

async fn run_sweep(registry: ConnectionRegistry, interval: Duration, threshold: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let inactive = sweep_inactive(&registry, threshold).await;
        debug!(inactive = inactive.len(), "Inactivity sweep done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(jwt: Option<&str>, user: Option<&str>, language: Option<&str>) -> RelayQuery {
        RelayQuery {
            jwt: jwt.map(String::from),
            user_id: user.map(String::from),
            language: language.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_query_requires_identity() {
        let err = resolve_query(&query(None, Some("kid-1"), None), "m").unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));

        let err = resolve_query(&query(Some("ek_1"), Some("  "), None), "m").unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized(_)));
    }

    #[test]
    fn test_resolve_query_language_and_profile() {
        let err = resolve_query(&query(Some("ek_1"), Some("kid-1"), Some("fr")), "m").unwrap_err();
        assert!(matches!(err, RelayError::BadRequest(_)));

        let mut q = query(Some("ek_1"), Some("kid-1"), Some("es-MX"));
        q.persona = Some("coach".to_string());
        q.grade = Some(1);
        let session = resolve_query(&q, "default-model").unwrap();

        assert_eq!(session.model, "default-model");
        assert_eq!(session.profile.language, Language::Spanish);
        assert_eq!(session.profile.persona, Persona::Coach);
        assert_eq!(session.profile.turn_detection.silence_duration_ms, 1300);
    }

    #[test]
    fn test_resolve_query_defaults_to_english() {
        let session = resolve_query(&query(Some("ek_1"), Some("kid-1"), None), "m").unwrap();
        assert_eq!(session.profile.language, Language::English);

        let mut q = query(Some("ek_1"), Some("kid-1"), None);
        q.persona = Some("pirate".to_string());
        assert!(matches!(resolve_query(&q, "m"), Err(RelayError::BadRequest(_))));
    }
}
