/// Playback queue integration tests
///
/// Bursts of received audio must play serially in arrival order.
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{RecordingSink, wait_for};
use readalong_voice_lib::audio::{AudioChunk, AudioDirection, PlaybackEvent, PlaybackQueue};

fn chunk(sequence: u64) -> AudioChunk {
    AudioChunk::new(AudioDirection::Inbound, sequence, vec![0u8; 960])
}

fn recorder() -> (Arc<Mutex<Vec<PlaybackEvent>>>, impl Fn(PlaybackEvent) + Send + Sync + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event| sink.lock().unwrap().push(event))
}

#[tokio::test]
async fn test_burst_plays_in_order_without_overlap() {
    println!("\n=== Playback Ordering Test ===");

    let sink = RecordingSink::new(Duration::from_millis(3));
    let (events, on_event) = recorder();
    let queue = PlaybackQueue::new(sink.clone(), on_event);

    for sequence in 0..20 {
        queue.enqueue(chunk(sequence));
    }
    assert!(wait_for(Duration::from_secs(2), || queue.played() == 20).await);

    assert_eq!(sink.played(), (0..20).collect::<Vec<u64>>());
    assert!(!sink.overlapped());
    assert!(
        wait_for(Duration::from_secs(1), || {
            *events.lock().unwrap() == vec![PlaybackEvent::Started, PlaybackEvent::Finished]
        })
        .await
    );
    println!("✓ 20 chunks played serially");
}

#[tokio::test]
async fn test_concurrent_producers_never_overlap() {
    let sink = RecordingSink::new(Duration::from_millis(2));
    let (_events, on_event) = recorder();
    let queue = Arc::new(PlaybackQueue::new(sink.clone(), on_event));

    let mut producers = Vec::new();
    for producer in 0..4u64 {
        let queue = Arc::clone(&queue);
        producers.push(tokio::spawn(async move {
            for i in 0..5 {
                queue.enqueue(chunk(producer * 100 + i));
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    assert!(wait_for(Duration::from_secs(2), || queue.played() == 20).await);
    assert!(!sink.overlapped());

    // Each producer's chunks keep their relative order
    let played = sink.played();
    for producer in 0..4u64 {
        let own: Vec<u64> = played
            .iter()
            .copied()
            .filter(|s| s / 100 == producer)
            .collect();
        assert!(own.windows(2).all(|w| w[0] < w[1]), "{own:?}");
    }
}

#[tokio::test]
async fn test_second_response_restarts_playback() {
    let sink = RecordingSink::new(Duration::from_millis(2));
    let (events, on_event) = recorder();
    let queue = PlaybackQueue::new(sink.clone(), on_event);

    queue.enqueue(chunk(0));
    queue.enqueue(chunk(1));
    assert!(wait_for(Duration::from_secs(1), || !events.lock().unwrap().is_empty() && !queue.is_playing()).await);

    queue.enqueue(chunk(2));
    assert!(
        wait_for(Duration::from_secs(1), || events.lock().unwrap().len() == 4).await,
        "{:?}",
        events.lock().unwrap()
    );
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            PlaybackEvent::Started,
            PlaybackEvent::Finished,
            PlaybackEvent::Started,
            PlaybackEvent::Finished,
        ]
    );
    assert_eq!(sink.played(), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_clear_then_new_audio_plays() {
    println!("\n=== Playback Interrupt Test ===");

    let sink = RecordingSink::new(Duration::from_millis(20));
    let (_events, on_event) = recorder();
    let queue = PlaybackQueue::new(sink.clone(), on_event);

    for sequence in 0..10 {
        queue.enqueue(chunk(sequence));
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.clear();

    queue.enqueue(chunk(100));
    assert!(wait_for(Duration::from_secs(2), || sink.played().contains(&100)).await);

    let played = sink.played();
    assert!(played.len() < 10, "stale audio kept playing: {played:?}");
    assert_eq!(played.last(), Some(&100));
    assert!(!sink.overlapped());
    println!("✓ {} stale chunk(s) played before the barge-in", played.len() - 1);
}
