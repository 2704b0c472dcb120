/// Realtime socket integration tests
///
/// Opens provider sockets against the in-process fake provider.
mod common;

use common::FakeProvider;
use readalong_voice_lib::network::{
    ClientEvent, ConnectionConfig, NetworkError, RealtimeConnection, ServerEvent, SessionSettings,
};
use readalong_voice_lib::profile::TurnDetection;

#[test]
fn test_provider_config_carries_key_and_model() {
    println!("\n=== Provider ConnectionConfig Test ===");

    let mut provider = readalong_voice_lib::state::AppConfig::default().provider;
    provider.api_key = "sk-test".to_string();
    let config = ConnectionConfig::for_provider(&provider, "gpt-4o-realtime-preview");

    assert_eq!(config.bearer_token.as_deref(), Some("sk-test"));
    assert!(config.realtime_beta);
    assert_eq!(config.timeout_ms, 10_000);

    let url = config.build_url().unwrap();
    assert!(url.starts_with(&provider.realtime_url));
    assert!(url.contains("model=gpt-4o-realtime-preview"));
    println!("✓ {url}");
}

#[test]
fn test_non_websocket_scheme_rejected() {
    let err = ConnectionConfig::new("http://127.0.0.1:8787/relay")
        .build_url()
        .unwrap_err();
    assert!(matches!(err, NetworkError::InvalidConfig(_)));

    let err = ConnectionConfig::new("not a url").build_url().unwrap_err();
    assert!(matches!(err, NetworkError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_session_round_trip_with_provider() {
    println!("\n=== Provider Socket Test ===");

    let provider = FakeProvider::start().await;
    let config = ConnectionConfig::new(provider.realtime_url())
        .with_query("model", "fake")
        .with_bearer("sk-test")
        .with_realtime_beta();

    let mut connection = RealtimeConnection::connect(&config).await.unwrap();
    assert!(connection.is_open());

    let created = connection.recv().await.unwrap().unwrap();
    assert!(matches!(created, ServerEvent::SessionCreated { .. }));

    let update = ClientEvent::SessionUpdate {
        session: SessionSettings::turn_detection_only(TurnDetection::default()),
    };
    connection.send(&update).await.unwrap();
    let updated = connection.recv().await.unwrap().unwrap();
    assert_eq!(updated.event_type(), "session.updated");
    println!("✓ session.created then session.updated");

    connection.close().await.unwrap();
    assert!(!connection.is_open());
    assert!(matches!(
        connection.send_text("{}".to_string()).await,
        Err(NetworkError::ConnectionClosed)
    ));

    assert_eq!(provider.authorizations(), vec!["Bearer sk-test".to_string()]);
    assert_eq!(provider.received_types(), vec!["session.update".to_string()]);
}

#[tokio::test]
async fn test_rejected_key_is_authentication_failure() {
    let provider = FakeProvider::start().await;
    provider.reject_auth(true);

    let config = ConnectionConfig::new(provider.realtime_url()).with_bearer("sk-wrong");
    let err = RealtimeConnection::connect(&config).await.unwrap_err();
    assert!(matches!(err, NetworkError::AuthenticationFailed), "{err}");
}

#[tokio::test]
async fn test_closed_port_is_connection_failure() {
    let config = ConnectionConfig::new("ws://127.0.0.1:1/v1/realtime").with_timeout(2_000);
    let err = RealtimeConnection::connect(&config).await.unwrap_err();
    assert!(matches!(err, NetworkError::ConnectionFailed(_)), "{err}");
}
