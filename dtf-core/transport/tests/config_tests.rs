//! 通信层配置测试

use dtf_transport::*;
use std::time::Duration;

#[test]
fn test_default_transport_config() {
    let config = TransportConfig::default();

    assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    assert_eq!(config.request_timeout(), Duration::from_secs(300));
    assert_eq!(config.max_consecutive_failures, 3);
}

#[test]
fn test_default_reconnect_config() {
    let config = ReconnectConfig::default();

    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.initial_delay, 1000);
    assert_eq!(config.max_delay, 60_000);
    assert_eq!(config.backoff_multiplier, 2.0);
}

#[test]
fn test_calculate_delay_backoff() {
    let config = ReconnectConfig {
        max_attempts: 10,
        initial_delay: 100,
        max_delay: 1000,
        backoff_multiplier: 2.0,
    };

    assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
    assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
    assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    // 超过上限后截断
    assert_eq!(config.calculate_delay(8), Duration::from_millis(1000));
}

#[test]
fn test_partial_config_uses_defaults() {
    let config: TransportConfig = serde_json::from_str(r#"{"request_timeout": 5}"#).unwrap();

    assert_eq!(config.request_timeout, 5);
    assert_eq!(config.connect_timeout, 10);
    assert_eq!(config.reconnect.max_attempts, 5);
}
