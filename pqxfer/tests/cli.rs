use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

const CONFIG: &str = r#"
[keystore]
kdf_memory_kib = 64
kdf_iterations = 1
"#;

fn pqxfer(dir: &Path) -> Command {
    let config = dir.join("pqxfer.toml");
    if !config.exists() {
        fs::write(&config, CONFIG).expect("write config");
    }
    let mut cmd = cargo_bin_cmd!("pqxfer");
    cmd.env("PQXFER_PASSPHRASE", "test passphrase")
        .env("PQXFER_CONFIG", &config)
        .env("PQXFER_KEY_DIR", dir.join("keys"));
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf8")
}

#[test]
fn keygen_list_and_fingerprint() {
    let temp = tempdir().expect("tempdir");
    let created = stdout_of(pqxfer(temp.path()).args(["keygen", "alice"]));
    let fingerprint = created.split_whitespace().nth(1).expect("fingerprint").to_string();
    assert_eq!(fingerprint.len(), 64);

    pqxfer(temp.path())
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice").and(predicate::str::contains(&fingerprint)));

    pqxfer(temp.path())
        .args(["fingerprint", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::diff(format!("{fingerprint}\n")));

    pqxfer(temp.path())
        .args(["keygen", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn exported_public_key_has_same_fingerprint() {
    let temp = tempdir().expect("tempdir");
    let created = stdout_of(pqxfer(temp.path()).args(["keygen", "bob"]));
    let fingerprint = created.split_whitespace().nth(1).expect("fingerprint").to_string();

    let pem = temp.path().join("bob.pem");
    pqxfer(temp.path())
        .args(["export", "bob", "--out"])
        .arg(&pem)
        .assert()
        .success();
    assert!(fs::read_to_string(&pem).expect("pem").contains("BEGIN ED25519 PUBLIC KEY"));

    pqxfer(temp.path())
        .args(["fingerprint", "--public-key"])
        .arg(&pem)
        .assert()
        .success()
        .stdout(predicate::str::contains(&fingerprint));
}

#[test]
fn rotate_archives_previous_key() {
    let temp = tempdir().expect("tempdir");
    let created = stdout_of(pqxfer(temp.path()).args(["keygen", "carol"]));
    let original = created.split_whitespace().nth(1).expect("fingerprint").to_string();

    pqxfer(temp.path())
        .args(["rotate", "carol"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(format!("carol {original} -> ")));

    pqxfer(temp.path())
        .args(["list", "--archived"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&original).and(predicate::str::contains("retired")));
}

#[test]
fn record_export_import_between_stores() {
    let source = tempdir().expect("tempdir");
    let target = tempdir().expect("tempdir");
    let created = stdout_of(pqxfer(source.path()).args(["keygen", "dave"]));
    let fingerprint = created.split_whitespace().nth(1).expect("fingerprint").to_string();

    let record = source.path().join("dave.record");
    pqxfer(source.path())
        .args(["export", "dave", "--record", "--out"])
        .arg(&record)
        .assert()
        .success();

    pqxfer(target.path())
        .args(["import", "dave"])
        .arg(&record)
        .assert()
        .success()
        .stdout(predicate::str::contains(&fingerprint));
}

#[test]
fn wrong_passphrase_fails() {
    let temp = tempdir().expect("tempdir");
    pqxfer(temp.path()).args(["keygen", "erin"]).assert().success();
    pqxfer(temp.path())
        .env("PQXFER_PASSPHRASE", "not the passphrase")
        .args(["rotate", "erin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("wrong passphrase"));
}

#[test]
fn contacts_add_list_and_remove() {
    let theirs = tempdir().expect("tempdir");
    let ours = tempdir().expect("tempdir");
    let created = stdout_of(pqxfer(theirs.path()).args(["keygen", "frank"]));
    let fingerprint = created.split_whitespace().nth(1).expect("fingerprint").to_string();
    let pem = theirs.path().join("frank.pem");
    pqxfer(theirs.path())
        .args(["export", "frank", "--out"])
        .arg(&pem)
        .assert()
        .success();

    pqxfer(ours.path())
        .args(["contact", "add", "frank"])
        .arg(&pem)
        .assert()
        .success()
        .stdout(predicate::str::diff(format!("frank {fingerprint}\n")));
    pqxfer(ours.path())
        .args(["contact", "add", "frank"])
        .arg(&pem)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    pqxfer(ours.path())
        .args(["contact", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("frank").and(predicate::str::contains(&fingerprint)));
    // A contact carries no secret key.
    pqxfer(ours.path())
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    pqxfer(ours.path())
        .args(["contact", "remove", "frank"])
        .assert()
        .success();
    pqxfer(ours.path())
        .args(["contact", "list"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn send_resolves_peer_by_contact_name() {
    let temp = tempdir().expect("tempdir");
    pqxfer(temp.path()).args(["keygen", "grace"]).assert().success();
    let payload = temp.path().join("payload.bin");
    fs::write(&payload, b"hello").expect("payload");

    pqxfer(temp.path())
        .args(["send", "--to", "127.0.0.1:1", "--identity", "grace"])
        .args(["--peer-name", "nobody"])
        .arg(&payload)
        .assert()
        .failure()
        .stderr(predicate::str::contains("contact \"nobody\" not found"));

    let pem = temp.path().join("grace.pem");
    pqxfer(temp.path())
        .args(["export", "grace", "--out"])
        .arg(&pem)
        .assert()
        .success();
    pqxfer(temp.path())
        .args(["contact", "add", "self"])
        .arg(&pem)
        .assert()
        .success();
    pqxfer(temp.path())
        .args(["send", "--to", "127.0.0.1:1", "--identity", "grace"])
        .args(["--peer-name", "self"])
        .arg(&payload)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to connect"));

    pqxfer(temp.path())
        .args(["send", "--to", "127.0.0.1:1", "--identity", "grace"])
        .args(["--peer-name", "self", "--peer", "00"])
        .arg(&payload)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
