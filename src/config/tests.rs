use serial_test::serial;

use super::load_config;
use super::settings::Settings;
use crate::utils::error::Error;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.endpoint, "mem://local");
    assert_eq!(settings.store_path, "relayq_db");
    assert_eq!(settings.queue.name, "terminal_queue");
    assert!(settings.queue.durable);
    assert_eq!(settings.consumer.prefetch, 1);
    assert_eq!(settings.consumer.delivery_timeout_ms, None);
    assert!(settings.producer.persistent);
    assert_eq!(settings.producer.max_retries, 5);
}

#[test]
#[serial]
fn load_config_uses_defaults_without_sources() {
    let settings = load_config().unwrap();
    assert_eq!(settings.queue.name, "terminal_queue");
    assert_eq!(settings.consumer.prefetch, 1);
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("RELAYQ__ENDPOINT", Some("mem://elsewhere")),
            ("RELAYQ__QUEUE__NAME", Some("overridden")),
            ("RELAYQ__CONSUMER__PREFETCH", Some("4")),
        ],
        || {
            let settings = load_config().unwrap();
            assert_eq!(settings.endpoint, "mem://elsewhere");
            assert_eq!(settings.queue.name, "overridden");
            assert_eq!(settings.consumer.prefetch, 4);
            // untouched fields keep their defaults
            assert!(settings.queue.durable);
        },
    );
}

#[test]
#[serial]
fn zero_prefetch_fails_validation() {
    temp_env::with_vars([("RELAYQ__CONSUMER__PREFETCH", Some("0"))], || {
        let err = load_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    });
}

#[test]
fn validate_rejects_empty_queue_name() {
    let mut settings = Settings::default();
    settings.queue.name = "".to_string();
    assert!(matches!(settings.validate(), Err(Error::Config(_))));
}

#[test]
fn validate_rejects_empty_endpoint() {
    let mut settings = Settings::default();
    settings.endpoint = "  ".to_string();
    assert!(matches!(settings.validate(), Err(Error::Config(_))));
}

#[test]
fn validate_rejects_zero_retries() {
    let mut settings = Settings::default();
    settings.producer.max_retries = 0;
    assert!(matches!(settings.validate(), Err(Error::Config(_))));
}

#[test]
fn validate_rejects_shrinking_backoff() {
    let mut settings = Settings::default();
    settings.backoff.factor = 0.5;
    assert!(matches!(settings.validate(), Err(Error::Config(_))));
}

#[test]
fn delivery_timeout_converts_to_duration() {
    let mut settings = Settings::default();
    assert_eq!(settings.delivery_timeout(), None);
    settings.consumer.delivery_timeout_ms = Some(1500);
    assert_eq!(
        settings.delivery_timeout(),
        Some(std::time::Duration::from_millis(1500))
    );
}
