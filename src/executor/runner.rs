//! Execution of non-builtin steps.
//!
//! Every step whose module is not a builtin is handed to a [`StepRunner`].
//! The default [`CommandRunner`] launches the configured module runner as a
//! child of the agent, so a kill can reap it.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info_span};

use crate::config::ModuleConfig;
use crate::models::{Parameters, StepResult};
use crate::module_source::ModuleSourceStore;
use crate::{AppError, Result};

/// Environment variables inherited by module processes.
///
/// Everything else is stripped with `env_clear()`; the step context is
/// injected explicitly.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "LANG", "RUST_LOG"];

/// Runs one step module to completion.
pub trait StepRunner: Send + Sync {
    /// Execute `module` for step `step_id` with `parameters`.
    ///
    /// # Errors
    ///
    /// Returns an error when the module could not be run at all. A module
    /// that ran and failed is reported as a failed [`StepResult`] instead.
    fn execute(&self, step_id: &str, module: &str, parameters: &Parameters) -> Result<StepResult>;
}

/// Launches `runner [runner_args..] <module>` with the parameters as JSON on stdin.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    source: Arc<ModuleSourceStore>,
}

impl CommandRunner {
    /// Build a runner from the `[module]` section.
    #[must_use]
    pub fn new(config: &ModuleConfig, source: Arc<ModuleSourceStore>) -> Self {
        Self {
            program: config.runner.clone(),
            args: config.runner_args.clone(),
            source,
        }
    }
}

impl StepRunner for CommandRunner {
    fn execute(&self, step_id: &str, module: &str, parameters: &Parameters) -> Result<StepResult> {
        let span = info_span!("run_module", step_id, module);
        let _guard = span.enter();

        let input = serde_json::to_vec(parameters)?;
        let source = self.source.current();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(module);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env("RECIPE_STEP_ID", step_id)
            .env("RECIPE_MODULE", module)
            .env("RECIPE_MODULE_REPO", &source.repo)
            .env("RECIPE_MODULE_TAG", &source.tag)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Step(format!("failed to spawn {}: {err}", self.program)))?;

        // Parameters are fed from their own thread so a module that writes a
        // lot before reading stdin cannot stall on a full stdout pipe.
        let feeder = match child.stdin.take() {
            Some(mut stdin) => Some(
                thread::Builder::new()
                    .name("module-stdin".into())
                    .spawn(move || {
                        // A module that ignores its input may close stdin early.
                        if let Err(err) = stdin.write_all(&input) {
                            debug!(%err, "module closed stdin before reading parameters");
                        }
                    })
                    .map_err(|err| AppError::Step(format!("failed to feed module stdin: {err}")))?,
            ),
            None => None,
        };

        let output = child
            .wait_with_output()
            .map_err(|err| AppError::Step(format!("failed to wait for module: {err}")));
        if let Some(feeder) = feeder {
            if feeder.join().is_err() {
                debug!("stdin feeder panicked");
            }
        }
        let output = output?;

        let out_log = non_empty(&output.stdout);
        let err_log = non_empty(&output.stderr);

        debug!(status = ?output.status, "module exited");
        if output.status.success() {
            let mut result = StepResult::success().with_out_log(out_log);
            result.err_log = err_log;
            return Ok(result);
        }

        let err_log = err_log.unwrap_or_else(|| match output.status.code() {
            Some(code) => format!("module {module} exited with code {code}"),
            None => format!("module {module} was terminated by a signal"),
        });
        Ok(StepResult::fail(err_log).with_out_log(out_log))
    }
}

fn non_empty(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}
