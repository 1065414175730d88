//! Runs the `dmr` binary against files in a temporary directory.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::json;

fn dmr(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dmr"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env("HOME", config_home)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "dmr failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn write_conversation(dir: &Path) -> String {
    let path = dir.join("input.json");
    let input = json!({
        "uuid": "conv-7",
        "name": "Search test",
        "chat_messages": [
            {"uuid": "h1", "sender": "human", "text": "Find it",
             "created_at": "2024-05-01T10:00:00Z"},
            {"uuid": "a1", "parent_message_uuid": "h1", "sender": "assistant",
             "text": "Looking.\n```\nThis block is not supported on your current device yet.\n```\nFound.",
             "created_at": "2024-05-01T10:00:10Z"},
            {"uuid": "a2", "parent_message_uuid": "h1", "sender": "assistant",
             "text": "Nothing to look up.", "created_at": "2024-05-01T10:00:20Z"},
        ],
    });
    fs::write(&path, input.to_string()).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn export_all_writes_every_layout() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_conversation(dir.path());
    let out = dir.path().join("out");

    let text = stdout(&dmr(
        dir.path(),
        &["export", &input, "-f", "all", "-o", out.to_str().unwrap()],
    ));
    assert_eq!(text.lines().count(), 6);

    for name in [
        "conv-7.json",
        "conv-7.yaml",
        "conv-7.md",
        "conv-7_branches/index.md",
        "conv-7_branches/Search_test_B1.md",
        "conv-7_branches/Search_test_B2.md",
    ] {
        assert!(out.join(name).is_file(), "{name} missing");
    }

    let combined = fs::read_to_string(out.join("conv-7.md")).unwrap();
    assert!(combined.starts_with("# Search test\n"));
    assert!(combined.contains("**[Branch Point]** `h1` has 2 continuations (Branches B1-B2)"));
}

#[test]
fn config_file_supplies_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_conversation(dir.path());
    let out = dir.path().join("configured");

    let config_dir = dir.path().join("dendrimer");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.toml"),
        format!(
            "include_metadata = false\noutput_dir = {:?}\n",
            out.to_str().unwrap()
        ),
    )
    .unwrap();

    stdout(&dmr(dir.path(), &["export", &input]));
    let combined = fs::read_to_string(out.join("conv-7.md")).unwrap();
    assert!(!combined.contains("*Message ID:"));
}

#[test]
fn branches_lists_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_conversation(dir.path());

    let text = stdout(&dmr(dir.path(), &["branches", &input]));
    assert!(text.starts_with("Search test: 3 message(s), 2 branch(es)\n"));
    assert!(text.contains("  h1: B1, B2\n"));
}

#[test]
fn inject_tool_logs_replaces_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_conversation(dir.path());
    let out = dir.path().join("out");
    stdout(&dmr(
        dir.path(),
        &["export", &input, "-f", "json", "-o", out.to_str().unwrap()],
    ));

    let logs = dir.path().join("tools.jsonl");
    fs::write(
        &logs,
        concat!(
            r#"{"timestamp": "2024-05-01T10:00:05Z", "tool": "search", "params": {"q": "it"}, "status": "success", "result": "hit", "conversation_id": "conv-7"}"#,
            "\n",
            r#"{"timestamp": "2024-05-01T10:00:06Z", "tool": "other", "params": {}, "status": "success", "conversation_id": "conv-8"}"#,
            "\n",
            "not json\n",
        ),
    )
    .unwrap();

    let md = dir.path().join("enriched/conv.md");
    let text = stdout(&dmr(
        dir.path(),
        &[
            "inject-tool-logs",
            "-c",
            out.join("conv-7.json").to_str().unwrap(),
            "-l",
            logs.to_str().unwrap(),
            "-o",
            md.to_str().unwrap(),
            "--branch",
            "B1",
        ],
    ));
    assert!(text.starts_with("Replaced 1 placeholder(s); 0 unmatched, 0 unused log record(s)\n"));

    let rendered = fs::read_to_string(&md).unwrap();
    assert!(rendered.starts_with("# Search test - Main Branch (B1)\n"));
    assert!(rendered.contains("**✓ Tool: `search`**"));
    assert!(!rendered.contains("not supported on your current device"));
}

#[test]
fn malformed_input_fails_unless_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bad.json");
    fs::write(
        &input,
        json!([
            {"uuid": "m1", "sender": "human", "text": "ok"},
            {"uuid": "m2", "parent_message_uuid": "m1", "text": "no role"},
        ])
        .to_string(),
    )
    .unwrap();
    let input = input.to_str().unwrap();

    let failed = dmr(dir.path(), &["branches", input]);
    assert!(!failed.status.success());
    assert!(String::from_utf8_lossy(&failed.stderr).contains("m2"));

    let text = stdout(&dmr(dir.path(), &["branches", "--skip-malformed", input]));
    assert!(text.starts_with("Untitled: 1 message(s), 1 branch(es)\n"));
}
