//! Outbound audio batching
//!
//! Audio deltas from the provider are held and flushed on a fixed tick.
//! Consecutive deltas of the same response item are merged into a single
//! delta, so the client receives fewer, larger chunks. Anything that is not
//! a well-formed delta is kept verbatim in arrival order.

use crate::audio::pcm;
use crate::network::protocol::ServerEvent;

#[derive(Debug)]
enum Pending {
    Audio {
        response_id: String,
        item_id: String,
        bytes: Vec<u8>,
    },
    Raw(String),
}

/// Per-connection queue of audio deltas awaiting the next tick
#[derive(Debug, Default)]
pub struct AudioBatcher {
    pending: Vec<Pending>,
    queued_deltas: usize,
}

impl AudioBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw `response.audio.delta` frame
    ///
    /// Returns the decoded PCM byte length, or 0 when the frame could not
    /// be decoded and was queued as-is.
    pub fn push(&mut self, frame: &str) -> usize {
        self.queued_deltas += 1;

        let Some((response_id, item_id, bytes)) = decode_delta(frame) else {
            self.pending.push(Pending::Raw(frame.to_string()));
            return 0;
        };
        let len = bytes.len();

        if let Some(Pending::Audio {
            response_id: last_response,
            item_id: last_item,
            bytes: last_bytes,
        }) = self.pending.last_mut()
        {
            if *last_response == response_id && *last_item == item_id {
                last_bytes.extend_from_slice(&bytes);
                return len;
            }
        }

        self.pending.push(Pending::Audio {
            response_id,
            item_id,
            bytes,
        });
        len
    }

    /// Number of deltas queued since the last flush
    pub fn len(&self) -> usize {
        self.queued_deltas
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain the queue into frames ready to forward, in arrival order
    pub fn flush(&mut self) -> Vec<String> {
        self.queued_deltas = 0;
        self.pending
            .drain(..)
            .filter_map(|pending| match pending {
                Pending::Raw(frame) => Some(frame),
                Pending::Audio {
                    response_id,
                    item_id,
                    bytes,
                } => {
                    let merged = ServerEvent::AudioDelta {
                        response_id,
                        item_id,
                        delta: pcm::encode_base64(&bytes),
                    };
                    match serde_json::to_string(&merged) {
                        Ok(json) => Some(json),
                        Err(e) => {
                            tracing::warn!("Dropping unencodable audio batch: {}", e);
                            None
                        }
                    }
                }
            })
            .collect()
    }
}

fn decode_delta(frame: &str) -> Option<(String, String, Vec<u8>)> {
    match serde_json::from_str::<ServerEvent>(frame).ok()? {
        ServerEvent::AudioDelta {
            response_id,
            item_id,
            delta,
        } => {
            let bytes = pcm::decode_base64(&delta).ok()?;
            Some((response_id, item_id, bytes))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(item: &str, bytes: &[u8]) -> String {
        json!({
            "type": "response.audio.delta",
            "response_id": "resp_1",
            "item_id": item,
            "delta": pcm::encode_base64(bytes),
        })
        .to_string()
    }

    #[test]
    fn test_merges_consecutive_deltas_of_same_item() {
        let mut batcher = AudioBatcher::new();
        assert_eq!(batcher.push(&delta("item_a", &[1, 2])), 2);
        assert_eq!(batcher.push(&delta("item_a", &[3, 4])), 2);
        batcher.push(&delta("item_b", &[5, 6]));
        assert_eq!(batcher.len(), 3);

        let frames = batcher.flush();
        assert_eq!(frames.len(), 2);
        assert!(batcher.is_empty());
        assert_eq!(batcher.len(), 0);

        let first: ServerEvent = serde_json::from_str(&frames[0]).unwrap();
        match first {
            ServerEvent::AudioDelta { item_id, delta, .. } => {
                assert_eq!(item_id, "item_a");
                assert_eq!(pcm::decode_base64(&delta).unwrap(), vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_undecodable_delta_passes_through_in_order() {
        let mut batcher = AudioBatcher::new();
        batcher.push(&delta("item_a", &[1, 2]));
        let broken = r#"{"type":"response.audio.delta","delta":"%%%"}"#;
        assert_eq!(batcher.push(broken), 0);
        batcher.push(&delta("item_a", &[3, 4]));

        let frames = batcher.flush();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], broken);
    }

    #[test]
    fn test_flush_empty() {
        let mut batcher = AudioBatcher::new();
        assert!(batcher.flush().is_empty());
    }
}
