//! Binary-level checks: one-shot commands, config bootstrap, TLS material.

use assert_cmd::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

fn agent() -> Command {
    Command::cargo_bin("talaria_agent").expect("binary exists")
}

fn wait_for(paths: &[&Path], child: &mut Child, limit: Duration) {
    let start = Instant::now();
    while start.elapsed() < limit {
        if paths.iter().all(|p| p.exists()) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn version_and_help() {
    let out = agent().arg("--version").output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("talaria_agent "));

    let out = agent().arg("-h").output().unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("--hash-password"));
}

#[test]
fn unknown_flag_exits_with_usage() {
    let out = agent().arg("--enableSSL").output().unwrap();
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Usage:"));
}

#[test]
fn hash_password_prints_verifiable_bcrypt() {
    let out = agent().args(["--hash-password", "s3cret"]).output().unwrap();
    assert!(out.status.success());
    let hash = String::from_utf8(out.stdout).unwrap();
    let hash = hash.trim();
    assert!(hash.starts_with("$2"), "{hash}");
    assert!(bcrypt::verify("s3cret", hash).unwrap());
}

#[test]
fn oversized_password_is_refused() {
    let long = "p".repeat(73);
    let out = agent().args(["--hash-password", &long]).output().unwrap();
    assert!(!out.status.success());
}

#[test]
fn missing_config_is_written_with_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = tmp.path().join("config.yml");
    let mut child = agent()
        .env("XDG_CONFIG_HOME", tmp.path())
        .arg("-c")
        .arg(&cfg)
        .args(["-p", "0"])
        .spawn()
        .expect("spawn agent");
    wait_for(&[&cfg], &mut child, Duration::from_secs(5));

    let text = fs::read_to_string(&cfg).expect("config written");
    assert!(text.contains("interval_ms"));
    assert!(text.contains("theme"));
}

fn expected_tls_paths(config_home: &Path) -> (PathBuf, PathBuf) {
    let base = config_home.join("talaria_agent").join("tls");
    (base.join("cert.pem"), base.join("key.pem"))
}

#[test]
fn tls_generates_self_signed_cert_in_xdg_path() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let xdg = tmp.path().to_path_buf();
    let mut child = agent()
        .env("XDG_CONFIG_HOME", &xdg)
        .arg("--config")
        .arg(xdg.join("config.yml"))
        .args(["--tls", "-p", "0"])
        .spawn()
        .expect("spawn agent");

    let (cert, key) = expected_tls_paths(&xdg);
    wait_for(&[&cert, &key], &mut child, Duration::from_secs(10));

    assert!(cert.exists(), "cert not found at {}", cert.display());
    assert!(key.exists(), "key not found at {}", key.display());
    let pem = fs::read_to_string(&cert).unwrap();
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert!(fs::metadata(&key).unwrap().len() > 0);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "key readable by others: {mode:o}");
    }
}
