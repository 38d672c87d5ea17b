use std::collections::HashMap;

use super::*;

fn config_from(pairs: &[(&str, &str)]) -> Result<BrokerConfig, ConfigError> {
    let env: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    BrokerConfig::from_lookup(|key| env.get(key).cloned())
}

#[test]
fn empty_environment_yields_defaults() {
    let config = config_from(&[]).expect("defaults should parse");
    assert_eq!(config.listen.port(), DEFAULT_PORT);
    assert_eq!(config.grace_window, Duration::from_millis(DEFAULT_GRACE_WINDOW_MS));
    assert_eq!(config.member_backlog, DEFAULT_MEMBER_BACKLOG);
    assert_eq!(config.retained_events, DEFAULT_RETAINED_EVENTS);
    assert!(config.allow_anonymous);
    assert!(!config.echo_to_originator);
    assert!(config.auth_secret.is_none());
}

#[test]
fn overrides_are_applied() {
    let config = config_from(&[
        ("LISTEN_ADDR", "127.0.0.1"),
        ("PORT", "9000"),
        ("GRACE_WINDOW_MS", "500"),
        ("ROOM_GRACE_MS", "0"),
        ("MEMBER_BACKLOG", "4"),
        ("ECHO_TO_ORIGINATOR", "yes"),
        ("ALLOW_ANONYMOUS", "off"),
        ("AUTH_SECRET", "s3cret"),
    ])
    .expect("overrides should parse");

    assert_eq!(config.listen.to_string(), "127.0.0.1:9000");
    assert_eq!(config.grace_window, Duration::from_millis(500));
    assert_eq!(config.room_grace, Duration::ZERO);
    assert_eq!(config.member_backlog, 4);
    assert!(config.echo_to_originator);
    assert!(!config.allow_anonymous);
    assert_eq!(config.auth_secret.as_deref(), Some("s3cret"));
}

#[test]
fn blank_secret_is_treated_as_missing() {
    let config = config_from(&[("AUTH_SECRET", "   ")]).expect("should parse");
    assert!(config.auth_secret.is_none());
}

#[test]
fn invalid_number_is_rejected() {
    let err = config_from(&[("MEMBER_BACKLOG", "lots")]).unwrap_err();
    assert_eq!(err, ConfigError::Invalid { var: "MEMBER_BACKLOG", value: "lots".into() });
}

#[test]
fn zero_backlog_is_rejected() {
    let err = config_from(&[("MEMBER_BACKLOG", "0")]).unwrap_err();
    assert_eq!(err, ConfigError::Zero { var: "MEMBER_BACKLOG" });
}

#[test]
fn invalid_bool_is_rejected() {
    let err = config_from(&[("ALLOW_ANONYMOUS", "maybe")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { var: "ALLOW_ANONYMOUS", .. }));
}

#[test]
fn ipv6_listen_addr_is_accepted() {
    let config = config_from(&[("LISTEN_ADDR", "::"), ("PORT", "7000")]).expect("ipv6 wildcard should parse");
    assert!(config.listen.is_ipv6());
    assert_eq!(config.listen.to_string(), "[::]:7000");

    let config = config_from(&[("LISTEN_ADDR", "::1")]).unwrap();
    assert_eq!(config.listen.ip(), IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]));
}

#[test]
fn invalid_listen_addr_is_rejected() {
    let err = config_from(&[("LISTEN_ADDR", "not a host")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { var: "LISTEN_ADDR", .. }));
}
