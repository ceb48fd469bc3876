//! Process-level wiring: builds the executor and its collaborators once,
//! then keeps a control-plane session alive until shutdown.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GlobalConfig;
use crate::executor::{
    AbortMode, ChangeDetector, CommandRunner, ExecutionControl, ProcFs, ProcessReaper,
    RecipeExecutor, ReportSink,
};
use crate::models::ConfigIdentity;
use crate::module_source::{ModuleSource, ModuleSourceStore};
use crate::session::{
    transport, Outbound, Relay, ReportChannel, SessionContext, SessionManager,
};
use crate::update::CrontabScheduler;
use crate::Result;

/// The running agent.
pub struct Agent {
    config: Arc<GlobalConfig>,
    executor: Arc<RecipeExecutor>,
    relay: Arc<Relay>,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl Agent {
    /// Prepare the state directories, wire every collaborator, and start
    /// the execution thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the execution thread cannot be spawned.
    pub fn start(config: GlobalConfig) -> Result<Self> {
        let config = Arc::new(config);
        let init_errors = prepare_dirs(&config);
        for err in &init_errors {
            warn!(error = %err, "initialization error");
        }

        let module_source = Arc::new(ModuleSourceStore::open(
            config.module_source_path(),
            ModuleSource::from(&config.module),
        ));
        let relay = Arc::new(Relay::new(config.timing.resend_delay()));
        let runner = Arc::new(CommandRunner::new(&config.module, Arc::clone(&module_source)));

        let executor = Arc::new(RecipeExecutor::new(
            runner,
            Arc::clone(&relay) as Arc<dyn ReportSink>,
            ChangeDetector::new(config.watch_dir()),
            ProcessReaper::for_current_process(Box::new(ProcFs::default())),
            config.timing.step_retry_delay(),
        ));
        executor.start()?;
        info!("execution thread started");

        let ctx = Arc::new(SessionContext {
            executor: Arc::clone(&executor) as Arc<dyn ExecutionControl>,
            identity: Arc::new(ConfigIdentity::new(&config.identity)),
            updater: Arc::new(CrontabScheduler::new(&config)),
            module_source,
            init_errors,
            handshake_retry: config.timing.handshake_retry(),
        });

        Ok(Self {
            config,
            executor,
            relay,
            ctx,
            cancel: CancellationToken::new(),
        })
    }

    /// The execution thread's handle.
    #[must_use]
    pub fn executor(&self) -> &Arc<RecipeExecutor> {
        &self.executor
    }

    /// Keep a session alive, reconnecting after every disconnect, until
    /// [`Self::shutdown`] completes.
    pub async fn run(&self) {
        info!(url = %self.config.network.ws_uri, "agent run loop started");
        while !self.cancel.is_cancelled() {
            if let Err(err) = self.run_once().await {
                warn!(%err, "session ended with error");
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let delay = self.config.timing.reconnect();
            info!(delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => break,
            }
        }
        info!("agent run loop stopped");
    }

    /// Abort execution with `mode`, wait for the execution thread to end,
    /// then close the session. Reports of the final step still go out.
    pub async fn shutdown(&self, mode: AbortMode) {
        self.executor.abort(mode);

        let executor = Arc::clone(&self.executor);
        if let Err(err) = tokio::task::spawn_blocking(move || executor.join()).await {
            error!(%err, "failed to join execution thread");
        }
        self.cancel.cancel();
    }

    async fn run_once(&self) -> Result<()> {
        let (outbound, frames) = Outbound::channel();
        let session = Arc::new(SessionManager::new(Arc::clone(&self.ctx), outbound)?);

        self.relay.bind(Arc::clone(&session) as Arc<dyn ReportChannel>);
        let result = transport::run_connection(
            Arc::clone(&session),
            frames,
            &self.config.network.ws_uri,
            self.cancel.clone(),
        )
        .await;
        self.relay.unbind();
        result
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("executor", &self.executor)
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}

/// Create the state and watch directories and check that they are
/// writable. Problems are returned as messages, never as errors: the agent
/// still connects and reports them in its handshake.
#[must_use]
pub fn prepare_dirs(config: &GlobalConfig) -> Vec<String> {
    let dirs = [
        ("state", config.paths.state_dir.clone()),
        ("watch", config.watch_dir()),
    ];
    dirs.iter()
        .filter_map(|(label, dir)| {
            check_dir(dir)
                .err()
                .map(|err| format!("{label} directory {} unusable: {err}", dir.display()))
        })
        .collect()
}

fn check_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let marker = dir.join(".write-marker");
    fs::write(&marker, b"")?;
    fs::remove_file(&marker)
}
