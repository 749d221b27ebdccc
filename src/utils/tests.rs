use super::error::{BrokerError, StoreError};
use super::logging;

#[test]
fn test_logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn test_parse_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    assert_eq!(logging::parse_level("trace"), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
}

#[test]
fn test_store_errors_convert_into_broker_errors() {
    let err: BrokerError = StoreError::Closed.into();
    assert!(matches!(err, BrokerError::Store(StoreError::Closed)));
    assert_eq!(err.to_string(), "store pipeline is closed");
}

#[test]
fn test_unknown_message_names_queue() {
    let err = BrokerError::UnknownMessage {
        id: 7,
        queue: "orders".to_string(),
    };
    assert_eq!(err.to_string(), "unknown message id 7, cannot attach to queue orders");
}
