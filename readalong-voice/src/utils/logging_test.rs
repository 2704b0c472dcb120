#[cfg(test)]
mod tests {
    use super::super::logging::{DEFAULT_LOG_FILTER, init_logging};

    #[test]
    fn test_logging_initialization_is_repeatable() {
        // A second subscriber install must not panic
        init_logging();
        init_logging();
        tracing::debug!("logging test event");
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
