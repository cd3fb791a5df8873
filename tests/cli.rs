//! Binary-level tests for the critic command line

use assert_cmd::Command;
use critic::storage::Side;
use critic::worker::{self, DetectLanguagesRequest, DetectedLanguage, VersionToDetect, WorkerProcess};
use git2::{Oid, Repository, Signature};
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

struct Workspace {
    dir: tempfile::TempDir,
    git: Repository,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let git = Repository::init(dir.path().join("repo")).unwrap();
        Self { dir, git }
    }

    fn repo_path(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("critic.toml")
    }

    fn database_path(&self) -> PathBuf {
        self.dir.path().join("critic.db")
    }

    fn commit(&self, files: &[(&str, &str)], parents: &[&str]) -> String {
        let mut builder = self.git.treebuilder(None).unwrap();
        for (name, content) in files {
            let oid = self.git.blob(content.as_bytes()).unwrap();
            builder.insert(name, oid, 0o100644).unwrap();
        }
        let tree = self.git.find_tree(builder.write().unwrap()).unwrap();
        let parents: Vec<_> = parents
            .iter()
            .map(|sha| self.git.find_commit(Oid::from_str(sha).unwrap()).unwrap())
            .collect();
        let parents: Vec<_> = parents.iter().collect();
        let sig = Signature::now("Critic Test", "test@example.org").unwrap();
        self.git
            .commit(None, &sig, &sig, "test", &tree, &parents)
            .unwrap()
            .to_string()
    }

    /// The binary, pointed at this workspace's configuration
    fn critic(&self) -> Command {
        let mut cmd = Command::cargo_bin("critic").unwrap();
        cmd.env("CRITIC_CONFIG", self.config_path())
            .env_remove("RUST_LOG");
        cmd
    }

    fn init(&self) {
        self.critic()
            .arg("--database")
            .arg(self.database_path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized Critic"));
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self
            .critic()
            .args(["--format", "json"])
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "critic {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

#[test]
fn test_init_writes_config() {
    let ws = Workspace::new();
    ws.init();

    assert!(ws.database_path().exists());
    let config = std::fs::read_to_string(ws.config_path()).unwrap();
    assert!(config.contains("critic.db"));

    ws.critic()
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    ws.critic().args(["init", "--force"]).assert().success();
}

#[test]
fn test_commands_require_database() {
    let ws = Workspace::new();
    ws.critic()
        .arg("--database")
        .arg(ws.dir.path().join("missing.db"))
        .args(["status", "--changeset", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("critic init"));
}

#[test]
fn test_request_and_run_once() {
    let ws = Workspace::new();
    let a = ws.commit(&[("main.rs", "fn main() {}\n")], &[]);
    let b = ws.commit(
        &[("main.rs", "fn main() {\n    run();\n}\n"), ("notes", "hello\n")],
        &[&a],
    );
    ws.init();

    ws.critic()
        .arg("add-repository")
        .args(["--name", "demo"])
        .arg(ws.repo_path())
        .assert()
        .success()
        .stdout(predicate::str::contains("repository 1"));

    let created = ws.json(&[
        "request",
        "--repository",
        "demo",
        "--from",
        &a,
        "--to",
        &b,
        "--highlight",
    ]);
    let changeset = created["changeset"].as_i64().unwrap();

    let status = ws.json(&["status", "--changeset", &changeset.to_string()]);
    assert_eq!(status["content_complete"], false);
    assert_eq!(status["changeset"]["complete"], false);

    let stats = ws.json(&["runner", "--once"]);
    assert!(stats["finished"].as_u64().unwrap() > 0);
    assert_eq!(stats["failed"], 0);

    let status = ws.json(&["status", "--changeset", &changeset.to_string()]);
    assert_eq!(status["changeset"]["complete"], true);
    assert_eq!(status["content_complete"], true);
    assert_eq!(status["changed_files"], 2);
    assert_eq!(status["errors"].as_array().unwrap().len(), 0);

    ws.critic()
        .args(["status", "--changeset", &changeset.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Content: complete"));
}

#[test]
fn test_unknown_repository_is_reported() {
    let ws = Workspace::new();
    let a = ws.commit(&[("f", "1\n")], &[]);
    ws.init();

    ws.critic()
        .args(["request", "--repository", "nope", "--to", &a])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown repository 'nope'"));
}

#[test]
fn test_branch_update_with_review() {
    let ws = Workspace::new();
    let a = ws.commit(&[("f", "1\n")], &[]);
    let b = ws.commit(&[("f", "2\n")], &[&a]);
    let c = ws.commit(&[("f", "3\n")], &[&b]);
    ws.init();
    ws.critic()
        .args(["add-repository", "--name", "demo"])
        .arg(ws.repo_path())
        .assert()
        .success();

    ws.critic()
        .args(["branch-update", "--repository", "demo", "--branch", "topic", "--to", &a])
        .assert()
        .success();
    ws.json(&["runner", "--once"]);

    ws.critic()
        .args(["branch-update", "--repository", "demo", "--branch", "topic"])
        .args(["--to", &c, "--review"])
        .assert()
        .success()
        .stdout(predicate::str::contains("review 1"));

    ws.json(&["runner", "--once"]);

    // b, c and the squashed a..c
    for changeset in 1..=3 {
        let status = ws.json(&["status", "--changeset", &changeset.to_string()]);
        assert_eq!(status["content_complete"], true, "changeset {}", changeset);
    }
}

#[tokio::test]
async fn test_stdio_worker() {
    let ws = Workspace::new();
    let a = ws.commit(&[("run", "#!/usr/bin/env python3\nprint(1)\n")], &[]);
    ws.init();
    let sha1 = ws
        .git
        .find_commit(Oid::from_str(&a).unwrap())
        .unwrap()
        .tree()
        .unwrap()
        .get_name("run")
        .unwrap()
        .id()
        .to_string();

    let program = assert_cmd::cargo::cargo_bin("critic");
    let config = ws.config_path();
    let mut process = WorkerProcess::spawn(
        &program,
        &["--config", path_str(&config), "worker", "--stdio"],
    )
    .unwrap();

    let request = DetectLanguagesRequest {
        repository_path: ws.repo_path(),
        versions: vec![VersionToDetect {
            file: 1,
            side: Side::New,
            sha1: sha1.clone(),
            path: "run".to_string(),
        }],
    };
    let response = process
        .call(
            worker::DETECT_FILE_LANGUAGES,
            serde_json::to_value(&request).unwrap(),
        )
        .await
        .unwrap();
    let detected: Vec<DetectedLanguage> = serde_json::from_value(response).unwrap();
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].sha1, sha1);
    assert_eq!(detected[0].language.as_deref(), Some("python"));

    let status = process.shutdown_within(Duration::from_secs(10)).await.unwrap();
    assert!(status.success());
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}
