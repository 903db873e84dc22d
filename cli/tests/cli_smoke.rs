#![allow(clippy::expect_used, clippy::unwrap_used)]

use assert_cmd::Command;
use predicates::prelude::*;

fn setup_project() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let project = tmp.path().join("proj");
    let home = tmp.path().join("home");
    std::fs::create_dir_all(project.join(".ai/knowledge")).unwrap();
    std::fs::create_dir_all(&home).unwrap();
    std::fs::write(
        project.join(".ai/knowledge/notes.md"),
        "# Notes\n\nDeploy on Fridays only.\n",
    )
    .unwrap();
    (tmp, project, home)
}

fn rye(project: &std::path::Path, home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("rye").unwrap();
    cmd.env("USER_SPACE", home)
        .arg("--project-path")
        .arg(project);
    cmd
}

#[test]
fn sign_then_load_round_trips() {
    let (_tmp, project, home) = setup_project();

    rye(&project, &home)
        .args(["sign", "knowledge", "notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""));

    rye(&project, &home)
        .args(["load", "knowledge", "notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deploy on Fridays only."));
}

#[test]
fn tampered_item_fails_load() {
    let (_tmp, project, home) = setup_project();

    rye(&project, &home)
        .args(["sign", "knowledge", "notes"])
        .assert()
        .success();

    let path = project.join(".ai/knowledge/notes.md");
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("Fridays", "Mondays")).unwrap();

    rye(&project, &home)
        .args(["load", "knowledge", "notes"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Integrity check failed"));
}

#[test]
fn unsigned_load_fails_closed() {
    let (_tmp, project, home) = setup_project();
    rye(&project, &home)
        .args(["load", "knowledge", "notes"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("unsigned"));
}

#[test]
fn search_lists_items_as_json() {
    let (_tmp, project, home) = setup_project();
    rye(&project, &home)
        .args(["search", "knowledge", "note"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\": 1"))
        .stdout(predicate::str::contains("\"item_id\": \"notes\""));
}

#[test]
fn exec_directive_inline_returns_instructions() {
    let (_tmp, project, home) = setup_project();
    std::fs::create_dir_all(project.join(".ai/directives")).unwrap();
    std::fs::write(
        project.join(".ai/directives/hello.json"),
        serde_json::json!({"name": "hello", "version": "1.0.0", "body": "Say hi"}).to_string(),
    )
    .unwrap();

    rye(&project, &home)
        .args(["exec", "hello", "--item-type", "directive"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Execute the directive as specified now."))
        .stdout(predicate::str::contains("\"body\": \"Say hi\""));
}

#[test]
fn unknown_item_exits_nonzero() {
    let (_tmp, project, home) = setup_project();
    rye(&project, &home)
        .args(["load", "knowledge", "ghost"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"status\":\"error\""));
}
