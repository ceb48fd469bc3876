//! Integration tests for inbound dispatch on a live `SessionManager`.
//!
//! The socket is replaced by a recording writer task; the executor is a
//! fake recording control calls.

use std::sync::Arc;

use serde_json::json;

use recipe_agent::models::{StepReport, StepResult};
use recipe_agent::module_source::ModuleSource;
use recipe_agent::session::{ReportChannel, SessionState};
use recipe_agent::AppError;

use super::test_helpers::{eventually, harness, harness_with, FakeExecutor};

#[tokio::test]
async fn open_sends_handshake_and_activates() {
    let h = harness(FakeExecutor::default());

    h.session.on_open().await.expect("handshake");

    assert_eq!(h.session.state(), SessionState::Active);
    let handshakes = h.wire.with_code(1);
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0]["instance_id"], "i-1");
    assert_eq!(handshakes[0]["app_id"], "app-1");
    assert_eq!(handshakes[0]["instance_token"], "token-1");
    assert_eq!(
        handshakes[0]["init_errors"],
        json!(["watch directory /x unusable: denied"])
    );
}

#[tokio::test]
async fn unknown_code_is_dropped() {
    let h = harness(FakeExecutor::default());
    h.session.on_open().await.expect("handshake");

    h.session
        .receive(r#"{"code": 99, "data": 1}"#)
        .await
        .expect("ignored");
    h.session.receive(r#"{"hello": true}"#).await.expect("ignored");

    assert_eq!(h.session.state(), SessionState::Active);
    assert!(h.executor.calls().is_empty());
    assert!(h.wire.closes().is_empty());
}

#[tokio::test]
async fn invalid_json_closes_and_resets_execution() {
    let h = harness(FakeExecutor::running(1));
    h.session.on_open().await.expect("handshake");

    let err = h.session.receive("{not json").await.expect_err("rejected");

    assert!(matches!(err, AppError::Serialization(_)));
    assert!(!h.session.is_running());
    assert_eq!(h.session.state(), SessionState::Closing);
    assert_eq!(h.executor.calls(), vec!["kill:Wait".to_owned()]);
    eventually("close frame", || h.wire.closes() == vec![4001]).await;
}

#[tokio::test]
async fn recipe_data_replaces_running_recipe() {
    let h = harness(FakeExecutor::running(1));
    h.session.on_open().await.expect("handshake");

    let message = json!({
        "code": 5,
        "recipe_version": 2,
        "module": { "repo": "https://git.example.com/next.git", "tag": "v7" },
        "state": [
            { "id": "pkg", "module": "linux.apt", "parameter": { "name": "nginx" } },
            { "id": "W1", "module": "general.wait", "parameter": { "state": "db", "instance_id": "i-2" } }
        ]
    });
    h.session
        .receive(&message.to_string())
        .await
        .expect("handled");

    assert_eq!(
        h.executor.calls(),
        vec!["kill:Wait".to_owned(), "load:2:pkg,W1".to_owned()]
    );
    assert_eq!(
        h.module_source.current(),
        ModuleSource::new("https://git.example.com/next.git", "v7")
    );
}

#[tokio::test]
async fn recipe_data_for_running_version_is_ignored() {
    let h = harness(FakeExecutor::running(4));
    h.session.on_open().await.expect("handshake");

    h.session
        .receive(r#"{"code": 5, "recipe_version": 4, "state": []}"#)
        .await
        .expect("handled");

    assert!(h.executor.calls().is_empty());
}

#[tokio::test]
async fn invalid_recipe_leaves_execution_alone() {
    let h = harness(FakeExecutor::running(1));
    h.session.on_open().await.expect("handshake");

    let message = json!({
        "code": 5,
        "recipe_version": 2,
        "module": { "repo": "", "tag": "v7" },
        "state": [ { "id": "a", "module": "file", "parameter": {} } ]
    });
    h.session
        .receive(&message.to_string())
        .await
        .expect("contained");

    assert!(h.executor.calls().is_empty());
    assert_eq!(h.session.state(), SessionState::Active);
    assert_eq!(
        h.module_source.current(),
        ModuleSource::new("https://git.example.com/modules.git", "v1")
    );
}

#[tokio::test]
async fn recipe_without_steps_keeps_installed_ones() {
    let h = harness(FakeExecutor::running(1));
    h.session.on_open().await.expect("handshake");

    h.session
        .receive(r#"{"code": 5, "recipe_version": 2, "state": null}"#)
        .await
        .expect("handled");

    assert_eq!(
        h.executor.calls(),
        vec!["kill:Wait".to_owned(), "load:2:-".to_owned()]
    );
}

#[tokio::test]
async fn wait_done_for_current_version_marks_state() {
    let h = harness(FakeExecutor::running(3));
    h.session.on_open().await.expect("handshake");

    h.session
        .receive(r#"{"code": 6, "version": 3, "id": "W1"}"#)
        .await
        .expect("handled");
    h.session
        .receive(r#"{"code": 6, "version": 2, "id": "W0"}"#)
        .await
        .expect("stale signal ignored");

    assert_eq!(h.executor.calls(), vec!["done:W1".to_owned()]);
}

#[tokio::test]
async fn agent_update_is_scheduled() {
    let h = harness(FakeExecutor::default());
    h.session.on_open().await.expect("handshake");

    h.session
        .receive(r#"{"code": 4, "version": "1.4.0", "url": "https://dl.example.com/a.tgz"}"#)
        .await
        .expect("handled");
    h.session
        .receive(r#"{"code": 4, "version": "1.5.0"}"#)
        .await
        .expect("invalid update contained");

    assert_eq!(
        *h.updater.scheduled.lock().unwrap(),
        vec![("1.4.0".to_owned(), "https://dl.example.com/a.tgz".to_owned())]
    );
}

#[tokio::test]
async fn rejected_handshake_is_resent_with_fresh_identity() {
    let h = harness(FakeExecutor::default());
    h.session.on_open().await.expect("handshake");

    h.session
        .receive(r#"{"code": 3}"#)
        .await
        .expect("handled");

    let tokens: Vec<_> = h
        .wire
        .with_code(1)
        .iter()
        .map(|v| v["instance_token"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(tokens, vec!["token-1".to_owned(), "token-2".to_owned()]);
    assert_eq!(h.session.state(), SessionState::Active);
}

#[tokio::test]
async fn report_is_sent_as_state_log() {
    let h = harness(FakeExecutor::running(2));
    h.session.on_open().await.expect("handshake");

    let session = Arc::clone(&h.session);
    tokio::task::spawn_blocking(move || {
        session.send_report(&StepReport {
            version: 2,
            step_id: "pkg".into(),
            result: StepResult::fail("apt failed"),
        })
    })
    .await
    .expect("join")
    .expect("sent");

    let logs = h.wire.with_code(2);
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["version"], 2);
    assert_eq!(logs[0]["id"], "pkg");
    assert_eq!(logs[0]["result"], false);
    assert_eq!(logs[0]["err_log"], "apt failed");
    assert_eq!(logs[0]["init"]["instance_id"], "i-1");
}

#[tokio::test]
async fn report_after_close_has_no_session() {
    let h = harness(FakeExecutor::default());
    h.session.on_open().await.expect("handshake");
    h.session.on_close(1000, "bye");

    let session = Arc::clone(&h.session);
    let err = tokio::task::spawn_blocking(move || {
        session.send_report(&StepReport {
            version: 1,
            step_id: "a".into(),
            result: StepResult::success(),
        })
    })
    .await
    .expect("join")
    .expect_err("no session");

    assert_eq!(err, AppError::NoActiveSession);
    assert_eq!(h.session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn failed_write_closes_with_write_failed() {
    let h = harness_with(FakeExecutor::default(), true);

    let err = h.session.on_open().await.expect_err("write fails");

    assert!(matches!(err, AppError::Transport(_)));
    assert!(!h.session.is_running());
    eventually("close frame", || h.wire.closes() == vec![4003]).await;
}
