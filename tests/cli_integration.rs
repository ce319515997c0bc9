//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing and configuration loading.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use knoboo::cli::{parse_args_from, Args};
use knoboo::config::{Config, ServiceMode};
use knoboo::Sharing;

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("knoboo")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&[])).unwrap();

    assert!(result.host.is_none());
    assert!(result.port.is_none());
    assert!(result.config.is_none());
    assert!(result.env_path.is_none());
    assert!(result.engines_pythonpath.is_empty());
    assert!(!result.proxy);
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-H",
        "0.0.0.0",
        "-p",
        "8080",
        "-k",
        "127.0.0.2",
        "-q",
        "9337",
        "--mode",
        "desktop",
        "-m",
        "2",
        "-l",
        "debug",
        "-r",
    ]))
    .unwrap();

    assert_eq!(result.host.unwrap().to_string(), "0.0.0.0");
    assert_eq!(result.port, Some(8080));
    assert_eq!(result.kernel_host.unwrap().to_string(), "127.0.0.2");
    assert_eq!(result.kernel_port, Some(9337));
    assert_eq!(result.mode, Some(ServiceMode::Desktop));
    assert_eq!(result.engines_max, Some(2));
    assert_eq!(result.log_level, Some("debug".to_string()));
    assert!(result.proxy);
}

#[test]
fn test_cli_invalid_port() {
    assert!(parse_args_from(args(&["-p", "not-a-number"])).is_err());
    assert!(parse_args_from(args(&["-q", "70000"])).is_err());
}

#[test]
fn test_cli_invalid_host() {
    assert!(parse_args_from(args(&["-H", "not-an-ip"])).is_err());
}

#[test]
fn test_cli_unknown_flag() {
    assert!(parse_args_from(args(&["--bogus"])).is_err());
}

#[test]
fn test_cli_missing_value() {
    assert!(parse_args_from(args(&["--port"])).is_err());
}

// ============================================================================
// Configuration Loading Tests
// ============================================================================

#[test]
fn test_config_from_json_file() {
    let file = config_file(
        r#"{
            "mode": "webapp",
            "devel": true,
            "server": { "host": "192.168.1.100", "port": 9000, "url_root": "/kb" },
            "kernel": { "host": "127.0.0.1", "port": 9337 },
            "engines": {
                "command": "/usr/bin/python3",
                "args": ["-m", "knoboo.engine"],
                "path": "/var/lib/knoboo",
                "max": 1,
                "uid": 1001,
                "gid": 1001,
                "grace_secs": 2
            },
            "auth": {
                "users": { "alice": "s3cret", "bob": "pw" },
                "admins": ["alice"]
            },
            "sessions": { "sharing": "exclusive", "max_protocol_errors": 3 },
            "notebooks": {
                "nb1": { "owner": "alice", "collaborators": ["bob"] }
            },
            "logging": { "level": "warn" }
        }"#,
    );

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.mode, ServiceMode::Webapp);
    assert!(config.devel);
    assert_eq!(config.server.host, "192.168.1.100");
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.kernel.port, 9337);
    assert_eq!(config.engines.grace_secs, 2);
    assert_eq!(config.auth.users.len(), 2);
    assert_eq!(config.sessions.sharing, Sharing::Exclusive);
    assert_eq!(config.connection_config().max_protocol_errors, 3);
    assert_eq!(config.notebooks["nb1"].collaborators.len(), 1);
    assert_eq!(config.log_filter(), Some("warn"));

    let spec = config.kernel_spec();
    assert_eq!(spec.command, "/usr/bin/python3");
    assert_eq!(spec.working_dir, Some(PathBuf::from("/var/lib/knoboo")));
    assert!(config.isolation().is_isolated());
}

#[test]
fn test_config_priority_cli_over_file() {
    let file = config_file(r#"{ "server": { "host": "10.0.0.1", "port": 5000 } }"#);

    let args = Args {
        host: Some("192.168.1.1".parse().unwrap()),
        port: Some(8080),
        config: Some(file.path().to_path_buf()),
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();

    assert_eq!(config.server.host, "192.168.1.1");
    assert_eq!(config.server.port, 8080);
}

#[test]
fn test_config_file_values_survive_absent_flags() {
    let file = config_file(r#"{ "kernel": { "port": 7000 }, "engines": { "max": 3 } }"#);

    let args = Args {
        config: Some(file.path().to_path_buf()),
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();
    assert_eq!(config.kernel.port, 7000);
    assert!(config.uses_pool());
}

#[test]
fn test_config_missing_file() {
    let args = Args {
        config: Some(PathBuf::from("/nonexistent/knoboo/config.json")),
        ..Args::default()
    };
    assert!(Config::load(&args).is_err());
}

#[test]
fn test_config_rejects_zero_engines() {
    let args = Args {
        engines_max: Some(0),
        ..Args::default()
    };
    assert!(Config::load(&args).is_err());
}

#[test]
fn test_config_to_server_config() {
    let args = Args {
        host: Some("0.0.0.0".parse().unwrap()),
        port: Some(8080),
        proxy: true,
        url_root: Some("/nb".to_string()),
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();
    let server = config.to_server_config().unwrap();

    assert_eq!(server.bind_address(), "0.0.0.0:8080");
    assert!(server.proxy);
    assert_eq!(server.url_root, "/nb");
}

// ============================================================================
// Configuration Serialization Tests
// ============================================================================

#[test]
fn test_config_roundtrip() {
    let original = Config::default();
    let json = serde_json::to_string(&original).unwrap();
    let loaded: Config = serde_json::from_str(&json).unwrap();

    assert_eq!(original.server.host, loaded.server.host);
    assert_eq!(original.kernel.port, loaded.kernel.port);
    assert_eq!(original.engines.command, loaded.engines.command);
}

#[test]
fn test_config_partial_deserialization() {
    let json = r#"{"server": {"port": 9999}}"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.server.port, 9999);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.kernel.port, 8337);
    assert_eq!(config.sessions.max_protocol_errors, 5);
}
