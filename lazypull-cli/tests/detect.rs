use assert_cmd::Command;
use predicates::prelude::*;

fn lazypull() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lazypull"))
}

fn write_manifest(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_detect_oci_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(
        &dir,
        "index.json",
        r#"{"schemaVersion": 2, "mediaType": "application/vnd.oci.image.index.v1+json", "manifests": []}"#,
    );

    lazypull()
        .args(["detect"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "application/vnd.oci.image.index.v1+json",
        ));
}

#[test]
fn test_detect_docker_manifest_without_media_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(&dir, "manifest.json", r#"{"config": {}, "layers": []}"#);

    lazypull()
        .arg("detect")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "application/vnd.docker.distribution.manifest.v2+json",
        ));
}

#[test]
fn test_detect_ambiguous_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_manifest(&dir, "both.json", r#"{"config": {}, "manifests": []}"#);

    lazypull()
        .arg("detect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ambiguous"));
}

#[test]
fn test_detect_missing_file_fails() {
    lazypull()
        .args(["detect", "/nonexistent/manifest.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}
