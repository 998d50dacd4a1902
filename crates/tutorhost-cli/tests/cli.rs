use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use httptest::{matchers::*, responders::*, Expectation, Server};
use serde_json::Value;

fn tutorhost(root: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("tutorhost");
    cmd.arg("--root")
        .arg(root)
        .env_remove("TUTORHOST_ONLINE")
        .env_remove("TUTORHOST_BACKEND_URL")
        .env("NO_COLOR", "1")
        .env("TUTORHOST_PROGRESS", "0");
    cmd
}

fn json_output(output: &[u8]) -> Value {
    serde_json::from_slice(output).unwrap_or_else(|err| {
        panic!(
            "expected JSON output ({err}): {}",
            String::from_utf8_lossy(output)
        )
    })
}

#[test]
fn help_lists_command_groups() {
    let assert = cargo_bin_cmd!("tutorhost").arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for group in ["provision", "bundles", "sidecar", "queue"] {
        assert!(stdout.contains(group), "missing {group} in help:\n{stdout}");
    }
}

#[test]
fn bundles_list_on_fresh_root_is_empty() {
    let temp = tempfile::tempdir().unwrap();
    let assert = tutorhost(temp.path())
        .args(["bundles", "list", "--json"])
        .assert()
        .success();
    let payload = json_output(&assert.get_output().stdout);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["details"]["bundles"], Value::Array(Vec::new()));
}

#[test]
fn enqueued_payload_shows_up_as_pending() {
    let temp = tempfile::tempdir().unwrap();
    tutorhost(temp.path())
        .args(["queue", "enqueue", "progress", r#"{"lesson":"l1","score":3}"#])
        .assert()
        .success();

    let assert = tutorhost(temp.path())
        .args(["queue", "pending", "progress", "--json"])
        .assert()
        .success();
    let payload = json_output(&assert.get_output().stdout);
    let items = payload["details"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["payload"]["lesson"], "l1");
    assert_eq!(items[0]["retries"], 0);
    assert!(temp.path().join("sync").join("progress.jsonl").exists());
}

#[test]
fn invalid_payload_is_a_user_error() {
    let temp = tempfile::tempdir().unwrap();
    let assert = tutorhost(temp.path())
        .args(["queue", "enqueue", "progress", "{not json", "--json"])
        .assert()
        .code(1);
    let payload = json_output(&assert.get_output().stdout);
    assert_eq!(payload["status"], "user-error");
    assert!(payload["message"]
        .as_str()
        .unwrap()
        .contains("not valid JSON"));
}

#[test]
fn stream_names_are_restricted() {
    let temp = tempfile::tempdir().unwrap();
    tutorhost(temp.path())
        .args(["queue", "enqueue", "../escape", "{}"])
        .assert()
        .code(1);
}

#[test]
fn flush_delivers_to_endpoint() {
    let temp = tempfile::tempdir().unwrap();
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/ingest"),
            request::body(json_decoded(eq(serde_json::json!({"n": 1})))),
        ])
        .respond_with(status_code(200)),
    );
    tutorhost(temp.path())
        .args(["queue", "enqueue", "events", r#"{"n":1}"#])
        .assert()
        .success();

    let endpoint = server.url("/ingest").to_string();
    let assert = tutorhost(temp.path())
        .args(["queue", "flush", "events", "--endpoint", &endpoint, "--json"])
        .assert()
        .success();
    let payload = json_output(&assert.get_output().stdout);
    assert_eq!(payload["details"]["sent"], 1);
    assert_eq!(payload["details"]["remaining"], 0);

    let assert = tutorhost(temp.path())
        .args(["queue", "pending", "events", "--json"])
        .assert()
        .success();
    let payload = json_output(&assert.get_output().stdout);
    assert_eq!(payload["details"]["items"], Value::Array(Vec::new()));
}

#[test]
fn flush_refuses_to_run_offline() {
    let temp = tempfile::tempdir().unwrap();
    tutorhost(temp.path())
        .args(["queue", "enqueue", "events", "{}"])
        .assert()
        .success();
    tutorhost(temp.path())
        .args(["--offline", "queue", "flush", "events"])
        .assert()
        .code(1);
    tutorhost(temp.path())
        .env("TUTORHOST_ONLINE", "0")
        .args(["queue", "flush", "events"])
        .assert()
        .code(1);
}

#[test]
fn sidecar_start_with_missing_interpreter_fails_to_resolve() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("no-such-python");
    let assert = tutorhost(temp.path())
        .env_remove("TUTORHOST_SIDECAR_PYTHON")
        .args(["sidecar", "start", "--json", "--provider", "openai", "--api-key", "k"])
        .arg("--python")
        .arg(&missing)
        .assert()
        .code(2);
    let payload = json_output(&assert.get_output().stdout);
    assert_eq!(payload["status"], "error");
    assert!(
        payload["details"].to_string().contains("resolve_runtime"),
        "{payload}"
    );
}

#[test]
fn bundles_sync_is_refused_offline() {
    let temp = tempfile::tempdir().unwrap();
    let assert = tutorhost(temp.path())
        .args(["--offline", "bundles", "sync", "--json"])
        .assert()
        .failure();
    let payload = json_output(&assert.get_output().stdout);
    assert!(payload["message"].as_str().unwrap().contains("offline"));
}
