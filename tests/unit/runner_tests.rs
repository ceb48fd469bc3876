//! Unit tests for the command step runner. Uses `/bin/sh` as the runner.
#![cfg(unix)]

use std::sync::Arc;

use serde_json::{json, Value};
use serial_test::serial;

use recipe_agent::config::ModuleConfig;
use recipe_agent::executor::{CommandRunner, StepRunner};
use recipe_agent::models::{Parameters, StepOutcome};
use recipe_agent::module_source::{ModuleSource, ModuleSourceStore};
use recipe_agent::AppError;

/// Runner executing `script` through `sh -c`; the module name becomes `$0`.
fn shell_runner(script: &str) -> CommandRunner {
    let config = ModuleConfig {
        runner: "sh".into(),
        runner_args: vec!["-c".into(), script.into()],
        ..ModuleConfig::default()
    };
    let source = Arc::new(ModuleSourceStore::in_memory(ModuleSource::new(
        "https://git.example.com/modules.git",
        "v9",
    )));
    CommandRunner::new(&config, source)
}

fn params(value: Value) -> Parameters {
    match value {
        Value::Object(map) => map,
        _ => Parameters::new(),
    }
}

#[test]
fn exit_zero_is_success_with_stdout() {
    let runner = shell_runner(r#"cat; echo; echo "$0 $RECIPE_STEP_ID $RECIPE_MODULE_TAG""#);

    let result = runner
        .execute("pkg", "linux.apt", &params(json!({ "name": "nginx" })))
        .expect("runs");

    assert_eq!(result.outcome, StepOutcome::Success);
    let out = result.out_log.expect("stdout captured");
    assert!(out.contains(r#"{"name":"nginx"}"#), "parameters on stdin: {out}");
    assert!(out.ends_with("linux.apt pkg v9"), "context in env: {out}");
}

#[test]
fn non_zero_exit_is_failure_with_stderr() {
    let runner = shell_runner("echo boom >&2; exit 3");

    let result = runner
        .execute("pkg", "linux.apt", &Parameters::new())
        .expect("runs");

    assert_eq!(result.outcome, StepOutcome::Fail);
    assert_eq!(result.err_log.as_deref(), Some("boom"));
}

#[test]
fn silent_failure_reports_exit_code() {
    let runner = shell_runner("exit 4");

    let result = runner
        .execute("pkg", "linux.apt", &Parameters::new())
        .expect("runs");

    assert_eq!(
        result.err_log.as_deref(),
        Some("module linux.apt exited with code 4")
    );
}

#[test]
#[serial]
fn environment_is_cleared() {
    std::env::set_var("RECIPE_AGENT_TEST_SECRET", "hunter2");
    let runner = shell_runner(r#"echo "secret=${RECIPE_AGENT_TEST_SECRET:-none}""#);

    let result = runner
        .execute("pkg", "m", &Parameters::new())
        .expect("runs");

    assert_eq!(result.out_log.as_deref(), Some("secret=none"));
}

#[test]
fn missing_runner_is_a_step_error() {
    let config = ModuleConfig {
        runner: "/nonexistent/recipe-runner".into(),
        ..ModuleConfig::default()
    };
    let runner = CommandRunner::new(
        &config,
        Arc::new(ModuleSourceStore::in_memory(ModuleSource::default())),
    );

    let err = runner
        .execute("pkg", "m", &Parameters::new())
        .expect_err("spawn fails");
    assert!(matches!(err, AppError::Step(_)));
}

#[test]
fn large_output_before_reading_large_input_completes() {
    let runner = shell_runner("head -c 200000 /dev/zero | tr '\\0' x; cat >/dev/null");
    let bulk = "p".repeat(200_000);

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let result = runner.execute("bulk", "m", &params(json!({ "blob": bulk })));
        let _ = done_tx.send(result);
    });

    let result = done_rx
        .recv_timeout(std::time::Duration::from_secs(10))
        .expect("module finished without stalling")
        .expect("runs");
    assert_eq!(result.outcome, StepOutcome::Success);
    assert_eq!(result.out_log.map(|out| out.len()), Some(200_000));
}
