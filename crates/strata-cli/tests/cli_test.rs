//! E2E tests for the strata binary
//!
//! Each test runs the real binary against an isolated store root.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use strata_config::testing::TestEnvironment;

/// Run strata inside the test environment
fn strata(env: &TestEnvironment, args: &[&str]) -> Output {
    strata_with_stdin(env, args, None)
}

fn strata_with_stdin(env: &TestEnvironment, args: &[&str], stdin: Option<&[u8]>) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_strata"));
    cmd.args(args)
        .current_dir(&env.project_root)
        .env_remove("RUST_LOG")
        .env_remove("STRATA_LOG")
        .env_remove("STRATA_OVERWRITE")
        .env_remove("STRATA_BLOCK_SIZE")
        .env_remove("STRATA_COMPRESSION")
        .envs(env.cli_env())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().expect("Failed to execute strata");
    if let Some(input) = stdin {
        child.stdin.take().unwrap().write_all(input).unwrap();
    }
    child.wait_with_output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ========== Put / Get ==========

#[test]
fn e2e_put_file_and_get_stdout() {
    let env = TestEnvironment::new().unwrap();
    let content: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    let file = env.create_file("input.bin", &content).unwrap();

    let put = strata(&env, &["put", "blob", file.to_str().unwrap()]);
    assert!(put.status.success(), "{}", String::from_utf8_lossy(&put.stderr));

    let get = strata(&env, &["get", "blob"]);
    assert!(get.status.success());
    assert_eq!(get.stdout, content);
}

#[test]
fn e2e_put_stdin_and_get_to_file() {
    let env = TestEnvironment::new().unwrap();
    let put = strata_with_stdin(&env, &["put", "note"], Some(b"from stdin"));
    assert!(put.status.success());

    let get = strata(&env, &["get", "note", "-o", "out.txt"]);
    assert!(get.status.success());
    assert_eq!(
        std::fs::read(env.project_root.join("out.txt")).unwrap(),
        b"from stdin"
    );
}

#[test]
fn e2e_put_existing_requires_overwrite() {
    let env = TestEnvironment::new().unwrap();
    assert!(strata_with_stdin(&env, &["put", "k"], Some(b"one")).status.success());

    let again = strata_with_stdin(&env, &["put", "k"], Some(b"two"));
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));
    assert_eq!(strata(&env, &["get", "k"]).stdout, b"one");

    let forced = strata_with_stdin(&env, &["put", "k", "--overwrite"], Some(b"two"));
    assert!(forced.status.success());
    assert_eq!(strata(&env, &["get", "k"]).stdout, b"two");
}

#[test]
fn e2e_invalid_key_rejected() {
    let env = TestEnvironment::new().unwrap();
    let put = strata_with_stdin(&env, &["put", "../escape"], Some(b"x"));
    assert!(!put.status.success());
    assert!(String::from_utf8_lossy(&put.stderr).contains("Invalid key"));
}

#[test]
fn e2e_get_missing_key_fails() {
    let env = TestEnvironment::new().unwrap();
    let get = strata(&env, &["get", "ghost"]);
    assert!(!get.status.success());
    assert!(get.stdout.is_empty());
}

// ========== Stat / Ls / Rm ==========

#[test]
fn e2e_stat_ls_rm() {
    let env = TestEnvironment::new().unwrap();
    for key in ["b", "a", "c"] {
        assert!(strata_with_stdin(&env, &["put", key], Some(key.as_bytes())).status.success());
    }

    assert!(strata(&env, &["stat", "a"]).status.success());
    assert!(!strata(&env, &["stat", "zzz"]).status.success());
    assert_eq!(stdout(&strata(&env, &["ls"])), "a\nb\nc\n");

    assert!(strata(&env, &["rm", "b"]).status.success());
    assert!(!strata(&env, &["rm", "b"]).status.success());
    assert_eq!(stdout(&strata(&env, &["ls"])), "a\nc\n");
}

// ========== Clean / Status ==========

#[test]
fn e2e_clean_reclaims_removed_values() {
    let env = TestEnvironment::new().unwrap();
    assert!(strata_with_stdin(&env, &["put", "gone"], Some(b"bytes nobody keeps")).status.success());
    assert!(strata_with_stdin(&env, &["put", "kept"], Some(b"bytes to keep")).status.success());
    assert!(strata(&env, &["rm", "gone"]).status.success());

    let clean = strata(&env, &["clean"]);
    assert!(clean.status.success());
    assert!(stdout(&clean).contains("Removed blocks:"));

    let status = strata(&env, &["status", "--json"]);
    assert!(status.status.success());
    let report: serde_json::Value = serde_json::from_str(&stdout(&status)).unwrap();
    assert_eq!(report["keys"], 1);
    assert_eq!(report["blocks"], 1);
}

#[test]
fn e2e_clean_reports_corrupt_keys_without_deleting() {
    let env = TestEnvironment::new().unwrap();
    assert!(strata_with_stdin(&env, &["put", "victim"], Some(b"soon broken")).status.success());
    for entry in std::fs::read_dir(env.store_root.join("block")).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let clean = strata(&env, &["clean"]);
    assert!(!clean.status.success());
    assert!(stdout(&clean).contains("victim"));
    assert!(strata(&env, &["stat", "victim"]).status.success());
}

#[test]
fn e2e_compression_change_is_refused() {
    let env = TestEnvironment::new().unwrap();
    assert!(strata_with_stdin(&env, &["put", "k"], Some(b"plain blocks")).status.success());

    let output = Command::new(env!("CARGO_BIN_EXE_strata"))
        .args(["get", "k"])
        .current_dir(&env.project_root)
        .env_remove("RUST_LOG")
        .envs(env.cli_env())
        .env("STRATA_COMPRESSION", "lz4")
        .output()
        .expect("Failed to execute strata");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("none compression"), "stderr: {}", stderr);

    // The store is untouched and still opens with its own compressor
    assert_eq!(stdout(&strata(&env, &["get", "k"])), "plain blocks");
}

// ========== Config ==========

#[test]
fn e2e_config_show_returns_valid_toml() {
    let env = TestEnvironment::new().unwrap();
    let output = strata(&env, &["config", "show"]);
    assert!(output.status.success());

    let parsed: strata_config::Config = toml::from_str(&stdout(&output)).unwrap();
    assert_eq!(parsed.storage.root, env.store_root);
    // Showing config must not create the store
    assert!(!env.store_root.exists());
}

#[test]
fn e2e_config_show_picks_up_project_config() {
    let env = TestEnvironment::new().unwrap();
    env.write_project_config("[storage.block]\nblock_size = 1024\ncompression = \"lz4\"\n")
        .unwrap();

    let output = strata(&env, &["config", "show"]);
    assert!(output.status.success());
    let parsed: strata_config::Config = toml::from_str(&stdout(&output)).unwrap();
    assert_eq!(parsed.storage.block.block_size, 1024);
    assert_eq!(
        parsed.storage.block.compression,
        strata_store::Compression::Lz4
    );
}

#[test]
fn e2e_config_path_lists_locations() {
    let env = TestEnvironment::new().unwrap();
    let output = strata(&env, &["config", "path"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("global:"));
    assert!(text.contains(".strata/config.toml"));
    assert!(text.contains("store:"));
}
