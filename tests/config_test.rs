// Unit tests for configuration synthesis, loading and validation

use octo_proxy::config::{
    self, ConfigError, DEFAULT_SERVER_NAME, DEFAULT_TIMEOUT_SECS, HostConfig, ProxyConfig,
    ServerConfig,
};
use std::io::Write;
use tempfile::NamedTempFile;

fn targets(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn server(name: &str, listener_port: u16) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        listener: HostConfig::new("127.0.0.1", listener_port),
        targets: vec![HostConfig::new("10.0.0.1", 80)],
        timeout: DEFAULT_TIMEOUT_SECS,
    }
}

#[test]
fn test_generate_single_default_server() {
    let config = config::generate(
        "0.0.0.0:9000",
        &targets(&["10.0.0.1:80", "10.0.0.2:80"]),
        "0.0.0.0:9123",
    )
    .unwrap();

    assert_eq!(config.servers.len(), 1);
    let server = &config.servers[0];
    assert_eq!(server.name, DEFAULT_SERVER_NAME);
    assert_eq!(server.listener, HostConfig::new("0.0.0.0", 9000));
    assert_eq!(
        server.targets,
        vec![HostConfig::new("10.0.0.1", 80), HostConfig::new("10.0.0.2", 80)]
    );
    assert_eq!(server.timeout, DEFAULT_TIMEOUT_SECS);
    assert_eq!(config.metrics, Some(HostConfig::new("0.0.0.0", 9123)));
}

#[test]
fn test_generate_keeps_order_and_duplicates() {
    let config = config::generate(
        "127.0.0.1:8050",
        &targets(&["c:3", "a:1", "c:3"]),
        "0.0.0.0:9123",
    )
    .unwrap();

    let addresses: Vec<String> = config.servers[0]
        .targets
        .iter()
        .map(HostConfig::address)
        .collect();
    assert_eq!(addresses, vec!["c:3", "a:1", "c:3"]);
}

#[test]
fn test_generate_rejects_empty_element() {
    let result = config::generate(
        "127.0.0.1:8050",
        &targets(&["a:1", "", "b:2"]),
        "0.0.0.0:9123",
    );

    assert!(matches!(result, Err(ConfigError::EmptyTarget(1))));
}

#[test]
fn test_generate_rejects_malformed_addresses() {
    let result = config::generate("127.0.0.1", &targets(&["a:1"]), "0.0.0.0:9123");
    assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));

    let result = config::generate("127.0.0.1:8050", &targets(&["a:port"]), "0.0.0.0:9123");
    assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));

    let result = config::generate("127.0.0.1:8050", &targets(&["a:1"]), "0.0.0.0:0");
    assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));
}

#[test]
fn test_generate_rejects_target_without_host() {
    let result = config::generate("127.0.0.1:8050", &targets(&[":80"]), "0.0.0.0:9123");

    let error_msg = result.unwrap_err().to_string();
    assert!(error_msg.contains("target host"));
}

#[test]
fn test_generate_rejects_metrics_on_listener() {
    let result = config::generate("0.0.0.0:9123", &targets(&["a:1"]), "0.0.0.0:9123");

    let error_msg = result.unwrap_err().to_string();
    assert!(error_msg.contains("metrics address"));
}

#[test]
fn test_load_valid_file() {
    let file = write_config(
        r#"
servers:
  - name: web
    listener:
      host: 0.0.0.0
      port: 8080
    targets:
      - host: 10.0.0.1
        port: 80
      - host: 10.0.0.2
        port: 80
    timeout: 30
  - name: db
    listener:
      port: 5432
    targets:
      - host: db.internal
        port: 5432
metrics:
  host: 127.0.0.1
  port: 9123
"#,
    );

    let config = config::load(file.path()).unwrap();

    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.servers[0].name, "web");
    assert_eq!(config.servers[0].timeout, 30);
    assert_eq!(config.servers[0].targets.len(), 2);
    assert_eq!(config.servers[1].listener.address(), "0.0.0.0:5432");
    assert_eq!(config.servers[1].timeout, DEFAULT_TIMEOUT_SECS);
    assert_eq!(config.metrics, Some(HostConfig::new("127.0.0.1", 9123)));
}

#[test]
fn test_load_without_metrics() {
    let file = write_config(
        r#"
servers:
  - name: web
    listener: { host: 127.0.0.1, port: 8080 }
    targets: [{ host: 10.0.0.1, port: 80 }]
"#,
    );

    let config = config::load(file.path()).unwrap();
    assert_eq!(config.metrics, None);
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yaml");

    let result = config::load(&path);
    assert!(matches!(result, Err(ConfigError::Read { .. })));
}

#[test]
fn test_load_unparsable_file() {
    let file = write_config("servers: [this is: not: valid");

    let result = config::load(file.path());
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

#[test]
fn test_load_invalid_schema() {
    let file = write_config("servers: []\n");

    let result = config::load(file.path());
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validation_duplicate_names() {
    let config = ProxyConfig {
        servers: vec![server("web", 8080), server("web", 8081)],
        metrics: None,
    };

    let error_msg = config.validate().unwrap_err().to_string();
    assert!(error_msg.contains("duplicate server name"));
}

#[test]
fn test_validation_shared_listener() {
    let config = ProxyConfig {
        servers: vec![server("web", 8080), server("api", 8080)],
        metrics: None,
    };

    let error_msg = config.validate().unwrap_err().to_string();
    assert!(error_msg.contains("already used"));
}

#[test]
fn test_validation_no_targets() {
    let mut web = server("web", 8080);
    web.targets.clear();
    let config = ProxyConfig {
        servers: vec![web],
        metrics: None,
    };

    let error_msg = config.validate().unwrap_err().to_string();
    assert!(error_msg.contains("has no targets"));
}

#[test]
fn test_validation_zero_timeout() {
    let mut web = server("web", 8080);
    web.timeout = 0;
    let config = ProxyConfig {
        servers: vec![web],
        metrics: None,
    };

    let error_msg = config.validate().unwrap_err().to_string();
    assert!(error_msg.contains("timeout"));
}
