//! CLI-level smoke tests driving the `terrastack` binary directly, per
//! SPEC_FULL.md §8. Uses a fake "terraform" shell script on `PATH` in place
//! of the real binary, the way the teacher's own CLI tests stand in a fake
//! provider binary rather than calling out to the real one.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_fake_terraform(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let script = dir.join("fake-terraform.sh");
    fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).unwrap();
    script
}

fn write_module(dir: &std::path::Path, name: &str, deps: &[&str]) -> std::path::PathBuf {
    let module_dir = dir.join(name);
    fs::create_dir_all(&module_dir).unwrap();
    let deps_toml = deps.iter().map(|d| format!("\"{d}\"")).collect::<Vec<_>>().join(", ");
    fs::write(
        module_dir.join("terragrunt.toml"),
        format!("[dependencies]\npaths = [{deps_toml}]\n\n[terraform]\nsource = \"test\"\n"),
    )
    .unwrap();
    fs::write(module_dir.join("main.tf"), "").unwrap();
    module_dir.join("terragrunt.toml")
}

#[test]
fn plan_all_succeeds_on_a_two_node_chain() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_fake_terraform(dir.path(), "echo 'No changes. Infrastructure is up-to-date.'\nexit 0");
    let a = write_module(dir.path(), "a", &[]);
    let b = write_module(dir.path(), "b", &["../a"]);

    Command::cargo_bin("terrastack")
        .unwrap()
        .arg("--config-paths")
        .arg(&a)
        .arg(&b)
        .arg("--working-dir")
        .arg(dir.path())
        .arg("--terragrunt-binary")
        .arg(&binary)
        .arg("--terragrunt-non-interactive")
        .arg("plan-all")
        .assert()
        .success()
        .stdout(predicate::str::contains("Summary"));
}

#[test]
fn apply_all_reports_failure_exit_code_on_broken_module() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_fake_terraform(dir.path(), "echo boom 1>&2\nexit 1");
    let a = write_module(dir.path(), "a", &[]);

    Command::cargo_bin("terrastack")
        .unwrap()
        .arg("--config-paths")
        .arg(&a)
        .arg("--working-dir")
        .arg(dir.path())
        .arg("--terragrunt-binary")
        .arg(&binary)
        .arg("--terragrunt-non-interactive")
        .arg("apply-all")
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED"));
}

#[test]
fn missing_config_path_is_a_clean_non_panicking_failure() {
    let dir = tempfile::tempdir().unwrap();
    let binary = write_fake_terraform(dir.path(), "exit 0");

    Command::cargo_bin("terrastack")
        .unwrap()
        .arg("--config-paths")
        .arg(dir.path().join("does-not-exist/terragrunt.toml"))
        .arg("--working-dir")
        .arg(dir.path())
        .arg("--terragrunt-binary")
        .arg(&binary)
        .arg("--terragrunt-non-interactive")
        .arg("plan-all")
        .assert()
        .failure();
}
