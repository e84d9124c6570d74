use super::*;
use serial_test::serial;
use std::io::Write;

fn from_yaml(yaml: &str) -> Config {
    serde_yaml::from_str(yaml).unwrap()
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.amqp.exchange, "events");
    assert_eq!(config.prefetch, 1);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
    assert!(config.consumers.is_none());
    config.validate().unwrap();
}

#[test]
fn test_absent_consumers_enables_all() {
    let options = Config::for_test().consumer_options();
    let kinds: Vec<ConsumerKind> = options.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, ConsumerKind::ALL.to_vec());
    assert!(options.iter().all(|(_, o)| o.prefetch == 1));
}

#[test]
fn test_consumer_overrides() {
    let config = from_yaml(
        r#"
prefetch: 4
retry:
  max_attempts: 5
  base_backoff_ms: 200
consumers:
  - kind: payment_completed
    prefetch: 10
    retry:
      max_attempts: 2
  - kind: notifications
    queue: tenant-a
  - kind: vehicle_created
    enabled: false
"#,
    );
    config.validate().unwrap();

    let options = config.consumer_options();
    assert_eq!(options.len(), 2);

    let (kind, payment) = &options[0];
    assert_eq!(*kind, ConsumerKind::PaymentCompleted);
    assert_eq!(payment.prefetch, 10);
    assert_eq!(payment.retry.max_attempts, 2);

    let (kind, notifications) = &options[1];
    assert_eq!(*kind, ConsumerKind::Notifications);
    assert_eq!(notifications.queue.as_deref(), Some("tenant-a"));
    assert_eq!(notifications.prefetch, 4);
    assert_eq!(notifications.retry.max_attempts, 5);
    assert_eq!(notifications.retry.base_backoff, Duration::from_millis(200));
}

#[test]
fn test_duplicate_consumer_rejected() {
    let config = from_yaml(
        r#"
consumers:
  - kind: critical_error
  - kind: critical_error
"#,
    );
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_zero_attempts_rejected() {
    let config = from_yaml("retry:\n  max_attempts: 0\n");
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn test_shrinking_multiplier_rejected() {
    let config = from_yaml("retry:\n  multiplier: 0.5\n");
    assert!(config.validate().is_err());
}

#[test]
fn test_http_handler_requires_endpoint() {
    let config = from_yaml("handler:\n  type: http\n");
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("endpoint"));

    let config = from_yaml("handler:\n  type: http\n  endpoint: http://svc:8080/events\n");
    config.validate().unwrap();
}

#[test]
fn test_dead_letter_store_policy() {
    let config = from_yaml(
        r#"
dead_letter_store:
  max_retries: 4
  base_backoff_ms: 1000
  sweep_interval_secs: 15
"#,
    );
    let policy = config.dead_letter_store.policy();
    assert_eq!(policy.max_attempts, 4);
    assert_eq!(policy.base_backoff, Duration::from_secs(1));
    assert_eq!(policy.multiplier, 2.0);
    assert_eq!(config.dead_letter_store.sweep_interval(), Duration::from_secs(15));
}

#[test]
#[serial]
fn test_load_from_env_file_and_overrides() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "amqp:\n  url: amqp://rabbit:5672/%2f\nshutdown_timeout_secs: 10"
    )
    .unwrap();

    std::env::set_var(CONFIG_ENV_VAR, file.path());
    std::env::set_var("RELAY__SHUTDOWN_TIMEOUT_SECS", "5");
    let loaded = Config::load(None);
    std::env::remove_var(CONFIG_ENV_VAR);
    std::env::remove_var("RELAY__SHUTDOWN_TIMEOUT_SECS");

    let config = tokio_test::assert_ok!(loaded);
    assert_eq!(config.amqp.url, "amqp://rabbit:5672/%2f");
    assert_eq!(config.shutdown_timeout_secs, 5);
}

#[test]
#[serial]
fn test_load_missing_env_file_fails() {
    std::env::set_var(CONFIG_ENV_VAR, "/nonexistent/relay.yaml");
    let loaded = Config::load(None);
    std::env::remove_var(CONFIG_ENV_VAR);

    assert!(matches!(loaded, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_load_rejects_invalid_values() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(file, "prefetch: 0").unwrap();

    let loaded = Config::load(file.path().to_str());
    assert!(matches!(loaded, Err(ConfigError::Invalid(_))));
}
