//! Loading node configuration from TOML files and the environment

use minilease::common::{Config, Error};
use minilease::lease::LeaseType;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_consul_config_with_defaults() {
    let file = write_config(
        r#"
[lease]
type = "consul"
candidate = true
hostname = "node1"

[lease.consul]
url = "http://localhost:8500"
"#,
    );

    let config = Config::load(Some(file.path()), true).unwrap();
    config.validate().unwrap();

    assert_eq!(config.lease.lease_type().unwrap(), LeaseType::Consul);
    assert!(config.lease.candidate);
    assert!(!config.lease.promote);
    assert_eq!(config.http.bind_addr.port(), 20202);
    assert_eq!(config.lease.reconnect_delay(), Duration::from_secs(1));
    assert_eq!(config.lease.promotion_timeout(), Duration::from_secs(10));
    assert_eq!(config.lease.network_timeout(), Duration::from_secs(2));

    let consul = config.lease.consul.as_ref().unwrap();
    assert_eq!(consul.key, "minilease/primary");
    assert_eq!(consul.ttl(), Duration::from_secs(10));
    assert_eq!(consul.lock_delay(), Duration::from_secs(1));
    assert!(config.proxy.is_none());

    let (hostname, url) = config.resolve_identity(20202).unwrap();
    assert_eq!(hostname, "node1");
    assert_eq!(url, "http://node1:20202");
}

#[test]
fn test_env_references_expanded() {
    std::env::set_var("MINILEASE_TEST_CONSUL_URL", "http://consul.internal:8500");
    let text = r#"
[lease]
type = "consul"

[lease.consul]
url = "${MINILEASE_TEST_CONSUL_URL}"
"#;

    let file = write_config(text);
    let config = Config::load(Some(file.path()), true).unwrap();
    assert_eq!(
        config.lease.consul.unwrap().url,
        "http://consul.internal:8500"
    );

    let config = Config::load(Some(file.path()), false).unwrap();
    assert_eq!(
        config.lease.consul.unwrap().url,
        "${MINILEASE_TEST_CONSUL_URL}"
    );
}

#[test]
fn test_environment_overrides_file() {
    std::env::set_var("MINILEASE__LEASE__DEMOTE_DELAY_MS", "1234");
    let file = write_config(
        r#"
[lease]
type = "static"
candidate = true
demote_delay_ms = 10
"#,
    );

    let config = Config::load(Some(file.path()), true).unwrap();
    std::env::remove_var("MINILEASE__LEASE__DEMOTE_DELAY_MS");
    assert_eq!(config.lease.demote_delay(), Duration::from_millis(1234));
}

#[test]
fn test_proxy_section() {
    let file = write_config(
        r#"
[http]
bind_addr = "127.0.0.1:20202"

[lease]
type = "static"
candidate = true

[proxy]
bind_addr = "127.0.0.1:8080"
target = "http://localhost:8081"
"#,
    );

    let config = Config::load(Some(file.path()), true).unwrap();
    config.validate().unwrap();
    let proxy = config.proxy.as_ref().unwrap();
    assert_eq!(proxy.max_hold(), Duration::from_secs(5));
    assert_eq!(proxy.max_body_bytes, 8 * 1024 * 1024);
}

#[test]
fn test_invalid_configs_rejected() {
    // Proxy on the node API's address
    let file = write_config(
        r#"
[http]
bind_addr = "127.0.0.1:20202"

[lease]
type = "static"
candidate = true

[proxy]
bind_addr = "127.0.0.1:20202"
target = "http://localhost:8081"
"#,
    );
    let config = Config::load(Some(file.path()), true).unwrap();
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

    // Zero TTL
    let file = write_config(
        r#"
[lease]
type = "consul"

[lease.consul]
url = "http://localhost:8500"
ttl_ms = 0
"#,
    );
    let config = Config::load(Some(file.path()), true).unwrap();
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let res = Config::load(Some(&dir.path().join("absent.toml")), true);
    assert!(matches!(res, Err(Error::InvalidConfig(_))));
}
