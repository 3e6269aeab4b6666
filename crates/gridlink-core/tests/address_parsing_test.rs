//! Integration tests for address parsing and configuration loading

use gridlink_core::{Address, AddressParseError, ClientNetworkConfig, ConfigError, StaticResolver};
use std::io::Write;

fn resolver() -> StaticResolver {
    StaticResolver::new()
        .with_host("localhost", &["127.0.0.1".parse().unwrap()])
        .with_host("member.internal", &["10.20.30.40".parse().unwrap()])
        .with_host("v6only", &["2001:db8::5".parse().unwrap()])
}

#[tokio::test]
async fn test_format_then_parse_is_stable() {
    let resolver = resolver();
    let inputs = [
        "localhost",
        "localhost:5701",
        "member.internal:5702",
        "v6only:6000",
        "10.0.0.1:80",
        "[::1]:5701",
        "[fe80::1%7]:5701",
        "fe80::abcd",
        "[2001:db8::1]",
    ];

    for input in inputs {
        let parsed = Address::parse(input, &resolver)
            .await
            .unwrap_or_else(|e| panic!("{} should parse: {}", input, e));
        let formatted = parsed.to_string();
        let reparsed = Address::parse(&formatted, &resolver)
            .await
            .unwrap_or_else(|e| panic!("{} (from {}) should parse: {}", formatted, input, e));

        assert_eq!(parsed, reparsed, "round trip of {}", input);
        assert_eq!(parsed.port(), reparsed.port());
        assert_eq!(parsed.ip(), reparsed.ip());
    }
}

#[tokio::test]
async fn test_malformed_strings_rejected() {
    let resolver = resolver();
    for input in ["[::1", "[::1]x", "[::1]5701", "::1]", "host:port", ""] {
        assert!(
            Address::parse(input, &resolver).await.is_err(),
            "{} should be rejected",
            input
        );
    }
}

#[tokio::test]
async fn test_ipv6_formats_bracketed() {
    let resolver = resolver();
    let address = Address::parse("v6only:6000", &resolver).await.unwrap();
    assert_eq!(address.to_string(), "[2001:db8::5]:6000");
    assert_eq!(address.host(), "v6only");
}

#[tokio::test]
async fn test_default_port_applied() {
    let resolver = resolver();
    let address = Address::parse_with_default_port("member.internal", 5701, &resolver)
        .await
        .unwrap();
    assert_eq!(address.to_string(), "10.20.30.40:5701");

    let explicit = Address::parse_with_default_port("member.internal:6000", 5701, &resolver)
        .await
        .unwrap();
    assert_eq!(explicit.port(), 6000);
}

#[tokio::test]
async fn test_unknown_host_reports_failure() {
    let resolver = resolver();
    let err = Address::parse("unknown.example", &resolver).await.unwrap_err();
    assert!(matches!(err, AddressParseError::Unresolved { .. }));
}

#[test]
fn test_config_from_yaml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "addresses: [\"10.0.0.1:5701\"]\nshuffle: false\nsocket:\n  buffer_size: 65536"
    )
    .unwrap();

    let config = ClientNetworkConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(config.addresses, vec!["10.0.0.1:5701".to_string()]);
    assert!(!config.shuffle);
    assert_eq!(config.socket.buffer_size, 65536);
}

#[test]
fn test_config_file_conflict_is_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "addresses: [\"10.0.0.1\"]\ncloud:\n  token: \"abc\""
    )
    .unwrap();

    let result = ClientNetworkConfig::from_yaml_file(file.path());
    assert!(matches!(result, Err(ConfigError::Conflict(_))));
}

#[test]
fn test_missing_config_file() {
    let result = ClientNetworkConfig::from_yaml_file("/definitely/not/here.yaml");
    assert!(matches!(result, Err(ConfigError::Io(_))));
}
