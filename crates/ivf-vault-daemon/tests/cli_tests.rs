//! Integration tests for the `ivf-vault` binary.
//!
//! Each test runs the binary as a subprocess against in-memory storage with
//! a clean `IVF_VAULT_*` environment.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;
use std::path::Path;
use std::process::Command;

fn bin() -> String {
    let path = env!("CARGO_BIN_EXE_ivf-vault");
    assert!(Path::new(path).exists(), "ivf-vault binary not found at {path}");
    path.to_owned()
}

/// Run with args and extra env; returns (`exit_code`, stdout, stderr).
fn run(args: &[&str], env: &[(&str, &str)]) -> (i32, String, String) {
    let mut cmd = Command::new(bin());
    cmd.args(args).env_remove("RUST_LOG");
    for (key, _) in std::env::vars() {
        if key.starts_with("IVF_VAULT_") || key == "DATABASE_URL" {
            cmd.env_remove(key);
        }
    }
    cmd.env("IVF_VAULT_LOG_LEVEL", "warn");
    for (key, value) in env {
        cmd.env(key, value);
    }
    let output = cmd.output().expect("failed to execute ivf-vault");
    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"))
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let (code, stdout, _) = run(&["--version"], &[]);
    assert_eq!(code, 0);
    assert!(stdout.contains("ivf-vault"), "{stdout}");
}

#[test]
fn test_help_lists_commands() {
    let (code, stdout, _) = run(&["--help"], &[]);
    assert_eq!(code, 0);
    for command in [
        "run",
        "sweep",
        "rotate-db",
        "rotate-dek",
        "reencrypt",
        "unseal",
        "backup",
        "restore",
        "validate-backup",
        "status",
    ] {
        assert!(stdout.contains(command), "help should list {command}: {stdout}");
    }
    assert!(stdout.contains("IVF_VAULT_"));
}

#[test]
fn test_unknown_command_is_usage_error() {
    let (code, _, stderr) = run(&["explode"], &[]);
    assert_eq!(code, 2);
    assert!(stderr.contains("explode"));
}

#[test]
fn test_missing_purpose_is_usage_error() {
    let (code, _, _) = run(&["rotate-dek"], &[]);
    assert_eq!(code, 2);
}

// ── Single-shot commands ─────────────────────────────────────────────

#[test]
fn test_sweep_on_empty_store() {
    let (code, stdout, stderr) = run(&["sweep"], &[]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let report = json(&stdout);
    assert_eq!(report["leases_revoked"], 0);
    assert_eq!(report["cancelled"], false);
}

#[test]
fn test_rotate_dek_prints_result() {
    let (code, stdout, stderr) = run(&["rotate-dek", "patient"], &[]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let result = json(&stdout);
    assert_eq!(result["success"], true);
    assert_eq!(result["purpose"], "patient");
    assert_eq!(result["new_version"], 2);
}

#[test]
fn test_rotate_dek_rejects_bad_purpose() {
    let (code, _, stderr) = run(&["rotate-dek", "no spaces"], &[]);
    assert_eq!(code, 1);
    assert!(stderr.contains("purpose"), "{stderr}");
}

#[test]
fn test_rotate_db_requires_configuration() {
    let (code, _, stderr) = run(&["rotate-db"], &[]);
    assert_eq!(code, 1);
    assert!(stderr.contains("IVF_VAULT_DB_HOST"), "{stderr}");
}

#[test]
fn test_rotate_db_activates_slot_b_first() {
    let (code, stdout, stderr) = run(&["rotate-db"], &[("IVF_VAULT_DB_HOST", "db.ivf.local")]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let result = json(&stdout);
    assert_eq!(result["success"], true);
    assert_eq!(result["active_slot"], "B");
    assert_eq!(result["rotation_count"], 1);
}

#[test]
fn test_status_reports_sealed_vault() {
    let (code, stdout, stderr) = run(&["status"], &[]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let status = json(&stdout);
    assert_eq!(status["kms_provider"], "Local");
    assert_eq!(status["kms_healthy"], true);
    assert_eq!(status["sealed"], true);
    assert_eq!(status["zero_trust_policies"], 7);
    assert!(status["db_rotation"].is_null());
    assert_eq!(status["dr_readiness"]["grade"], "F");
}

#[test]
fn test_unseal_without_configuration_fails() {
    let (code, stdout, _) = run(&["unseal"], &[]);
    assert_eq!(code, 1);
    let result = json(&stdout);
    assert_eq!(result["success"], false);
    assert_eq!(result["attempts_total"], 1);
    assert_eq!(result["provider_id"], "default");
}

#[test]
fn test_unseal_with_master_password() {
    let (code, stdout, stderr) = run(&["unseal"], &[("IVF_VAULT_MASTER_PASSWORD", "correct horse battery")]);
    assert_eq!(code, 0, "stderr: {stderr}");
    let result = json(&stdout);
    assert_eq!(result["success"], true);
    assert_eq!(result["provider_id"], "default");
}

// ── Backup & restore ─────────────────────────────────────────────────

const MASTER_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

#[test]
fn test_backup_validate_restore() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("vault.bak");
    let file_str = file.to_str().unwrap();
    let env = [
        ("IVF_VAULT_LOCAL_MASTER_KEY", MASTER_KEY),
        ("IVF_VAULT_BACKUP_PASSWORD", "correct horse"),
    ];

    let (code, stdout, stderr) = run(&["backup", "--out", file_str], &env);
    assert_eq!(code, 0, "stderr: {stderr}");
    let backup = json(&stdout);
    assert!(backup["backup_id"].as_str().unwrap().starts_with("vault-backup-"));
    assert_eq!(backup["bytes"].as_u64().unwrap(), fs::metadata(&file).unwrap().len());
    assert!(backup.get("data").is_none());

    let (code, stdout, stderr) = run(&["validate-backup", file_str], &env);
    assert_eq!(code, 0, "stderr: {stderr}");
    let validation = json(&stdout);
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["backup_id"], backup["backup_id"]);
    assert_eq!(validation["integrity_hash"], backup["integrity_hash"]);

    let (code, stdout, stderr) = run(&["restore", file_str], &env);
    assert_eq!(code, 0, "stderr: {stderr}");
    let restored = json(&stdout);
    assert_eq!(restored["backup_id"], backup["backup_id"]);
    assert_eq!(restored["restored"], backup["counts"]);
    assert_eq!(restored["skipped"], 0);
}

#[test]
fn test_validate_backup_rejects_tampering() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("vault.bak");
    let file_str = file.to_str().unwrap();
    let env = [("IVF_VAULT_BACKUP_PASSWORD", "pw")];

    let (code, _, stderr) = run(&["backup", "--out", file_str], &env);
    assert_eq!(code, 0, "stderr: {stderr}");

    let mut data = fs::read(&file).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0xff;
    fs::write(&file, &data).unwrap();

    let (code, stdout, _) = run(&["validate-backup", file_str], &env);
    assert_eq!(code, 1);
    assert_eq!(json(&stdout)["valid"], false);

    let (code, _, stderr) = run(&["restore", file_str], &env);
    assert_eq!(code, 1);
    assert!(stderr.contains("backup cannot be opened"), "{stderr}");
}

#[test]
fn test_backup_requires_password() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("vault.bak");
    let (code, _, stderr) = run(&["backup", "--out", file.to_str().unwrap()], &[]);
    assert_eq!(code, 2, "{stderr}");
    assert!(!file.exists());
}

// ── Configuration errors ─────────────────────────────────────────────

#[test]
fn test_remote_kms_without_client_fails() {
    let (code, stdout, stderr) = run(&["status"], &[("IVF_VAULT_KMS_PROVIDER", "Azure")]);
    assert_eq!(code, 1);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Azure"), "{stderr}");
}

#[test]
fn test_malformed_master_key_fails() {
    let (code, _, stderr) = run(&["status"], &[("IVF_VAULT_LOCAL_MASTER_KEY", "%%%")]);
    assert_eq!(code, 1);
    assert!(stderr.contains("IVF_VAULT_LOCAL_MASTER_KEY"), "{stderr}");
}

#[test]
fn test_postgres_without_feature_or_server_fails() {
    let (code, _, _) = run(
        &["status"],
        &[
            ("IVF_VAULT_STORAGE", "postgres"),
            ("IVF_VAULT_DATABASE_URL", "postgres://127.0.0.1:1/none"),
            ("IVF_VAULT_LOCAL_MASTER_KEY", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
        ],
    );
    assert_eq!(code, 1);
}

// ── Audit file ───────────────────────────────────────────────────────

#[test]
fn test_audit_file_receives_entries() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.log");
    let audit_str = audit.to_str().unwrap();

    let (code, _, stderr) = run(&["rotate-dek", "lab"], &[("IVF_VAULT_AUDIT_FILE", audit_str)]);
    assert_eq!(code, 0, "stderr: {stderr}");

    let contents = fs::read_to_string(&audit).unwrap();
    let rotate = contents
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|entry| entry["action"] == "dek.rotate")
        .expect("dek.rotate entry");
    assert_eq!(rotate["entity_id"], "lab");
}
