#![cfg(feature = "webrtc")]

/// WebRTC media engine tests
///
/// Offers from the real engine are posted to the fake provider's calls
/// endpoint and answered by a second in-process peer connection.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FAKE_SDP_ANSWER, FakeProvider, RecordingListener, RecordingSink, issue_credential};
use readalong_voice_lib::audio::{MicrophoneSource, ScriptedMicrophone};
use readalong_voice_lib::transport::{
    PeerConnection, PeerConnectionFactory, SdpExchange, TransportContext, TransportError,
    WebRtcPeerFactory,
};
use webrtc::api::APIBuilder;
use webrtc::api::media_engine::MediaEngine;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

fn factory() -> WebRtcPeerFactory {
    let ctx = TransportContext::new(RecordingListener::new())
        .with_sink(RecordingSink::new(Duration::from_millis(1)));
    WebRtcPeerFactory::from_context(&ctx)
}

/// A plain peer standing in for the provider's media server
async fn remote_peer() -> Arc<RTCPeerConnection> {
    let mut media = MediaEngine::default();
    media.register_default_codecs().unwrap();
    let api = APIBuilder::new().with_media_engine(media).build();
    Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap())
}

async fn answer_for(remote: &RTCPeerConnection, offer: &str) -> String {
    let offer = RTCSessionDescription::offer(offer.to_string()).unwrap();
    remote.set_remote_description(offer).await.unwrap();
    let answer = remote.create_answer(None).await.unwrap();
    let mut gathered = remote.gathering_complete_promise().await;
    remote.set_local_description(answer).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), gathered.recv()).await;
    remote.local_description().await.unwrap().sdp
}

#[tokio::test]
async fn test_offer_carries_microphone_track_and_event_channel() {
    println!("\n=== WebRTC Offer Test ===");

    let provider = FakeProvider::start().await;
    let peer = factory().create().await.unwrap();

    let offer = peer.create_offer().await.unwrap();
    assert!(offer.starts_with("v=0"), "{offer}");
    assert!(offer.contains("m=audio"), "{offer}");
    assert!(offer.contains("PCMU/8000"), "{offer}");
    assert!(offer.contains("m=application"), "{offer}");
    println!("✓ offer has a μ-law audio section and a data channel");

    let credential = issue_credential("en").await;
    let answer = SdpExchange::new(provider.calls_url())
        .exchange(&offer, &credential)
        .await
        .unwrap();
    assert_eq!(answer, FAKE_SDP_ANSWER);
    let offers = provider.sdp_offers();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].1, offer);

    // The stub answer has no media sections to negotiate
    let err = peer.apply_answer(&answer).await.unwrap_err();
    assert!(matches!(err, TransportError::Negotiation(_)), "{err}");
    println!("✓ offer posted; stub answer rejected as a negotiation error");

    peer.close().await;
}

#[tokio::test]
async fn test_answer_from_remote_peer_is_applied() {
    println!("\n=== WebRTC Answer Test ===");

    let peer = factory().create().await.unwrap();
    assert!(peer.take_events().is_some());
    assert!(peer.take_events().is_none());

    let remote = remote_peer().await;
    let offer = peer.create_offer().await.unwrap();
    let answer = answer_for(&remote, &offer).await;
    assert!(answer.contains("PCMU/8000"), "{answer}");

    peer.apply_answer(&answer).await.unwrap();
    println!("✓ remote answer applied");

    peer.close().await;
    peer.close().await;
    remote.close().await.unwrap();
}

#[tokio::test]
async fn test_denied_microphone_is_resource_error() {
    let ctx = TransportContext::new(RecordingListener::new()).with_microphone(|| {
        Box::new(ScriptedMicrophone::denied("blocked by the browser")) as Box<dyn MicrophoneSource>
    });

    match WebRtcPeerFactory::from_context(&ctx).create().await {
        Err(TransportError::Audio(e)) => assert!(e.is_resource_error(), "{e}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connection created without a microphone"),
    }
}
