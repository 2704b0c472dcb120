//! Fixed-schedule reconnection
//!
//! Voice interaction tolerates near-instant retries far better than
//! exponential backoff, so delays follow a short fixed table.

mod manager;

pub use manager::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_SCHEDULE_MS, ReconnectOutcome, ReconnectPolicy,
    ReconnectionManager, RetryableError,
};
