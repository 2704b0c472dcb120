//! Token and cost estimates from audio duration

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;
use tokio::time::Instant;

/// Audio tokens per second of speech
pub const TOKENS_PER_SECOND: f64 = 100.0;

/// USD per million input (user audio) tokens
pub const INPUT_COST_PER_MILLION: f64 = 100.0;

/// USD per million output (tutor audio) tokens
pub const OUTPUT_COST_PER_MILLION: f64 = 200.0;

/// Estimated tokens for `byte_len` bytes of PCM16 mono at `sample_rate`
pub fn estimate_tokens(byte_len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    let samples = (byte_len / 2) as f64;
    samples / f64::from(sample_rate) * TOKENS_PER_SECOND
}

/// Decoded length of a base64 audio payload
///
/// Payloads that fail to decode are counted at the engine's upper bound.
pub fn base64_decoded_len(payload: &str) -> usize {
    match STANDARD.decode(payload) {
        Ok(bytes) => bytes.len(),
        Err(_) => base64::decoded_len_estimate(payload.len()),
    }
}

/// Per-connection usage totals
#[derive(Debug)]
pub struct UsageTracker {
    sample_rate: u32,
    started: Instant,
    inbound_tokens: f64,
    outbound_tokens: f64,
    inbound_chunks: u64,
    outbound_chunks: u64,
}

/// Final stats logged at teardown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub duration: Duration,
    pub inbound_tokens: f64,
    pub outbound_tokens: f64,
    pub inbound_chunks: u64,
    pub outbound_chunks: u64,
    pub estimated_cost_usd: f64,
}

impl UsageTracker {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            started: Instant::now(),
            inbound_tokens: 0.0,
            outbound_tokens: 0.0,
            inbound_chunks: 0,
            outbound_chunks: 0,
        }
    }

    /// Count user audio forwarded upstream; returns the chunk's estimate
    pub fn record_inbound(&mut self, byte_len: usize) -> f64 {
        let tokens = estimate_tokens(byte_len, self.sample_rate);
        self.inbound_tokens += tokens;
        self.inbound_chunks += 1;
        tokens
    }

    /// Count tutor audio received from upstream; returns the chunk's estimate
    pub fn record_outbound(&mut self, byte_len: usize) -> f64 {
        let tokens = estimate_tokens(byte_len, self.sample_rate);
        self.outbound_tokens += tokens;
        self.outbound_chunks += 1;
        tokens
    }

    pub fn estimated_cost(&self) -> f64 {
        self.inbound_tokens / 1_000_000.0 * INPUT_COST_PER_MILLION
            + self.outbound_tokens / 1_000_000.0 * OUTPUT_COST_PER_MILLION
    }

    pub fn summary(&self) -> UsageSummary {
        UsageSummary {
            duration: self.started.elapsed(),
            inbound_tokens: self.inbound_tokens,
            outbound_tokens: self.outbound_tokens,
            inbound_chunks: self.inbound_chunks,
            outbound_chunks: self.outbound_chunks,
            estimated_cost_usd: self.estimated_cost(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm;

    #[test]
    fn test_one_second_is_about_100_tokens() {
        // 24 kHz mono PCM16 for one second
        let bytes = 24_000 * 2;
        let tokens = estimate_tokens(bytes, 24_000);
        assert!((tokens - 100.0).abs() < 1e-9);

        assert_eq!(estimate_tokens(bytes, 0), 0.0);
        assert!((estimate_tokens(4_800, 24_000) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_base64_decoded_len() {
        for len in [0usize, 1, 2, 3, 4, 5, 960, 48_000] {
            let encoded = pcm::encode_base64(&vec![7u8; len]);
            assert_eq!(base64_decoded_len(&encoded), len, "len {len}");
        }
        // Not valid base64: counted at the upper bound
        assert_eq!(base64_decoded_len("AAA*"), 3);
        assert_eq!(base64_decoded_len("AAAAA"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracker_splits_directions_and_cost() {
        let mut tracker = UsageTracker::new(24_000);

        tracker.record_inbound(48_000);
        tracker.record_outbound(24_000);
        tracker.record_outbound(24_000);
        tokio::time::advance(Duration::from_secs(3)).await;

        let summary = tracker.summary();
        assert_eq!(summary.inbound_chunks, 1);
        assert_eq!(summary.outbound_chunks, 2);
        assert!((summary.inbound_tokens - 100.0).abs() < 1e-9);
        assert!((summary.outbound_tokens - 100.0).abs() < 1e-9);
        // 100 tokens at $100/M plus 100 tokens at $200/M
        assert!((summary.estimated_cost_usd - 0.03).abs() < 1e-12);
        assert_eq!(summary.duration, Duration::from_secs(3));
    }
}
