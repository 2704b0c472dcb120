//! Realtime voice transports
//!
//! Two interchangeable implementations of [`TransportClient`]:
//!
//! - [`PeerTransport`] negotiates a direct media session with the provider
//! - [`RelayedSocketTransport`] streams PCM16 over a WebSocket to the relay
//!
//! Both drive the same [`ConnectionStateMachine`](crate::state::ConnectionStateMachine)
//! and report through a single [`TransportListener`]. Neither reconnects on
//! its own; that is the owning session's job.

pub mod client;
pub mod error;
mod interpreter;
pub mod peer;
pub mod relayed;
#[cfg(feature = "webrtc")]
pub mod webrtc_peer;

use std::sync::Arc;

pub use client::{
    MicrophoneFactory, NoopListener, TransportClient, TransportContext, TransportKind,
    TransportListener,
};
pub use error::{TransportError, TransportResult};
pub use interpreter::MAX_CONSECUTIVE_MALFORMED;
pub use peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerTransport, SdpExchange};
pub use relayed::RelayedSocketTransport;
#[cfg(feature = "webrtc")]
pub use webrtc_peer::{WebRtcPeer, WebRtcPeerFactory};

use crate::state::AppConfig;

/// Build the transport selected by `kind`
///
/// The peer transport needs a media engine, supplied through `peer_factory`.
pub fn build_transport(
    kind: TransportKind,
    config: &AppConfig,
    ctx: TransportContext,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
) -> TransportResult<Box<dyn TransportClient>> {
    let ctx = ctx
        .with_frame_ms(config.audio.frame_ms)
        .with_connect_timeout(config.transport.connect_timeout());

    match kind {
        TransportKind::Relayed => Ok(Box::new(RelayedSocketTransport::new(
            config.relay.public_url.clone(),
            ctx,
        ))),
        TransportKind::Peer => {
            let factory = match peer_factory {
                Some(factory) => factory,
                None => default_peer_factory(config, &ctx)?,
            };
            Ok(Box::new(PeerTransport::new(
                factory,
                config.provider.calls_url.clone(),
                ctx,
            )))
        }
    }
}

#[cfg(feature = "webrtc")]
fn default_peer_factory(
    config: &AppConfig,
    ctx: &TransportContext,
) -> TransportResult<Arc<dyn PeerConnectionFactory>> {
    Ok(Arc::new(
        WebRtcPeerFactory::from_context(ctx).with_ice_servers(config.transport.ice_servers.clone()),
    ))
}

#[cfg(not(feature = "webrtc"))]
fn default_peer_factory(
    _config: &AppConfig,
    _ctx: &TransportContext,
) -> TransportResult<Arc<dyn PeerConnectionFactory>> {
    Err(TransportError::InvalidConfig(
        "peer transport requires a peer connection factory or the `webrtc` feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_relayed_by_default() {
        let config = AppConfig::default();
        let ctx = TransportContext::new(Arc::new(NoopListener));

        let transport = build_transport(config.transport.kind, &config, ctx, None).unwrap();
        assert_eq!(transport.kind(), TransportKind::Relayed);
        assert!(!transport.is_connected());
    }

    #[cfg(not(feature = "webrtc"))]
    #[test]
    fn test_peer_requires_factory() {
        let config = AppConfig::default();
        let ctx = TransportContext::new(Arc::new(NoopListener));

        let err = build_transport(TransportKind::Peer, &config, ctx, None)
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[cfg(feature = "webrtc")]
    #[test]
    fn test_peer_defaults_to_webrtc_engine() {
        let config = AppConfig::default();
        let ctx = TransportContext::new(Arc::new(NoopListener));

        let transport = build_transport(TransportKind::Peer, &config, ctx, None).unwrap();
        assert_eq!(transport.kind(), TransportKind::Peer);
        assert!(!transport.is_connected());
    }
}
