//! Startup behaviour of the built binary: bad invocations and missing
//! settings must fail before anything is served or connected to.

use std::fs::write;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

fn config_file() -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    write(temp_file.path(), "recipient = ops@example.com\n").unwrap();
    temp_file
}

/// run the binary with a clean environment, plus `env`
fn run_listener(args: &[&str], config: &NamedTempFile, env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_claptrap-listen"));
    cmd.args(args)
        .env_clear()
        .env("CLAPTRAP_LISTEN_CONFIG", config.path());
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.output().unwrap()
}

fn broker_env_without(missing: &str) -> Vec<(&'static str, &'static str)> {
    [
        ("RABBITMQ_USERNAME", "listener"),
        ("RABBITMQ_PASSWORD", "s3cret"),
        // nothing listens here; a connection attempt would fail differently
        ("RABBITMQ_HOST", "127.0.0.1"),
        ("RABBITMQ_PORT", "1"),
        ("RABBITMQ_VHOST", "mail"),
        ("RABBITMQ_TOPIC", "outgoing"),
    ]
    .into_iter()
    .filter(|(key, _)| *key != missing)
    .collect()
}

#[test]
fn test_no_mode_prints_usage() {
    let config = config_file();
    let output = run_listener(&[], &config, &[]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "stderr: {}", stderr);
}

#[test]
fn test_both_modes_rejected() {
    let config = config_file();
    let output = run_listener(&["--web", "--rabbitmq"], &config, &[]);

    assert!(!output.status.success());
    assert_ne!(output.status.code(), Some(0));
}

#[test]
fn test_rabbitmq_missing_env_exits_without_connecting() {
    let config = config_file();

    for (var, what) in [
        ("RABBITMQ_USERNAME", "Username"),
        ("RABBITMQ_HOST", "Host"),
        ("RABBITMQ_PORT", "Port"),
        ("RABBITMQ_VHOST", "Virtual host"),
        ("RABBITMQ_TOPIC", "Topic"),
    ] {
        let env = broker_env_without(var);
        let started = Instant::now();
        let output = run_listener(&["--rabbitmq"], &config, &env);

        assert_eq!(output.status.code(), Some(1), "missing {}", var);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains(&format!("{} can't be blank", what)),
            "missing {}: stderr was {}",
            var,
            stderr
        );
        assert!(!stderr.contains("connect"), "missing {}: stderr was {}", var, stderr);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

#[test]
fn test_rabbitmq_bad_port_exits() {
    let config = config_file();
    let mut env = broker_env_without("RABBITMQ_PORT");
    env.push(("RABBITMQ_PORT", "not-a-port"));

    let output = run_listener(&["--rabbitmq"], &config, &env);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not-a-port"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_file_exits() {
    let config = config_file();
    let missing = config.path().with_extension("missing");

    let output = Command::new(env!("CARGO_BIN_EXE_claptrap-listen"))
        .arg("--web")
        .env_clear()
        .env("CLAPTRAP_LISTEN_CONFIG", &missing)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error reading config file"), "stderr: {}", stderr);
}
