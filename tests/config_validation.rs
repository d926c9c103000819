//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use handshake_pipeline::config::{NetworkConfig, ENV_PREFIX};
use handshake_pipeline::error::ProtocolError;
use handshake_pipeline::utils::crypto::CipherSuite;
use std::time::Duration;
use tracing::Level;

fn errors_for(mutator: impl FnOnce(&mut NetworkConfig)) -> Vec<String> {
    NetworkConfig::default_with_overrides(mutator).validate()
}

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_invalid_server_address() {
    let errors = errors_for(|c| c.server.address = "invalid_address".to_string());
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let errors = errors_for(|c| c.server.address = String::new());
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_max_connections() {
    let errors = errors_for(|c| c.server.max_connections = 0);
    assert!(errors.iter().any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_session_capacity_below_connection_limit() {
    let errors = errors_for(|c| {
        c.server.max_connections = 100;
        c.server.max_sessions = 10;
    });
    assert!(errors.iter().any(|e| e.contains("Max sessions")));
}

#[test]
fn test_migration_target_rules() {
    let errors = errors_for(|c| c.server.migrate_to = Some(0));
    assert!(errors.iter().any(|e| e.contains("port 0")));

    let errors = errors_for(|c| {
        c.server.local_port = Some(4000);
        c.server.migrate_to = Some(4000);
    });
    assert!(errors.iter().any(|e| e.contains("must differ from local_port")));
}

#[test]
fn test_resume_ttl_bounds() {
    let errors = errors_for(|c| c.server.resume_ttl = Duration::from_millis(10));
    assert!(errors.iter().any(|e| e.contains("Resume TTL too short")));

    let errors = errors_for(|c| c.server.resume_ttl = Duration::from_secs(7200));
    assert!(errors.iter().any(|e| e.contains("Resume TTL too long")));
}

#[test]
fn test_client_address_needs_port() {
    let errors = errors_for(|c| c.client.address = "localhost".to_string());
    assert!(errors.iter().any(|e| e.contains("has no port")));
}

#[test]
fn test_handshake_limits() {
    let errors = errors_for(|c| c.handshake.max_frame_size = 16);
    assert!(errors.iter().any(|e| e.contains("Max frame size too small")));

    let errors = errors_for(|c| {
        c.handshake.max_frame_size = 4096;
        c.handshake.initial_buffer_capacity = 8192;
    });
    assert!(errors.iter().any(|e| e.contains("cannot exceed max frame size")));

    let errors = errors_for(|c| c.handshake.handshake_timeout = Duration::from_millis(1));
    assert!(errors.iter().any(|e| e.contains("Handshake timeout too short")));
}

#[test]
fn test_log_file_requires_path() {
    let errors = errors_for(|c| {
        c.logging.log_to_file = true;
        c.logging.log_file_path = None;
    });
    assert!(errors.iter().any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_validate_strict_lists_every_problem() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.max_connections = 0;
        c.handshake.max_pending_frames = 0;
    });
    match config.validate_strict() {
        Err(ProtocolError::ConfigError(message)) => {
            assert!(message.contains("Max connections"));
            assert!(message.contains("Max pending frames"));
        }
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn test_toml_round_trip_preserves_values() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.migrate_to = Some(9100);
        c.handshake.handshake_timeout = Duration::from_millis(2500);
        c.handshake.cipher_suite = CipherSuite::XChaCha20;
        c.logging.log_level = Level::DEBUG;
    });
    let text = toml::to_string_pretty(&config).expect("serializable config");
    let parsed = NetworkConfig::from_toml(&text).unwrap();

    assert_eq!(parsed.server.migrate_to, Some(9100));
    assert_eq!(parsed.handshake.handshake_timeout, Duration::from_millis(2500));
    assert_eq!(parsed.handshake.cipher_suite, CipherSuite::XChaCha20);
    assert_eq!(parsed.logging.log_level, Level::DEBUG);
}

#[test]
fn test_malformed_toml_is_config_error() {
    let result = NetworkConfig::from_toml("[server\naddress = ");
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}

#[test]
fn test_environment_overrides() {
    let var = |name: &str| format!("{ENV_PREFIX}{name}");
    std::env::set_var(var("MAX_CONNECTIONS"), "12");
    std::env::set_var(var("HANDSHAKE_TIMEOUT_MS"), "2500");
    std::env::set_var(var("MIGRATE_TO"), "7001");

    let config = NetworkConfig::from_env().unwrap();
    assert_eq!(config.server.max_connections, 12);
    assert_eq!(config.handshake.handshake_timeout, Duration::from_millis(2500));
    assert_eq!(config.server.migrate_to, Some(7001));

    std::env::set_var(var("MAX_CONNECTIONS"), "many");
    assert!(matches!(NetworkConfig::from_env(), Err(ProtocolError::ConfigError(_))));

    for name in ["MAX_CONNECTIONS", "HANDSHAKE_TIMEOUT_MS", "MIGRATE_TO"] {
        std::env::remove_var(var(name));
    }
}

#[test]
fn test_save_and_load_file() {
    let path = std::env::temp_dir().join(format!("handshake-pipeline-{}.toml", std::process::id()));
    let config = NetworkConfig::default_with_overrides(|c| c.server.max_connections = 77);
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded.server.max_connections, 77);
}
