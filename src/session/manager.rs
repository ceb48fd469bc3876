//! One control-plane session: handshake, inbound dispatch, report delivery.
//!
//! A `SessionManager` lives exactly as long as one connection. Inbound
//! messages and handshakes are serialized through a per-session gate so an
//! identity refresh never interleaves with message handling. Blocking
//! executor calls run on the blocking pool so the socket writer keeps
//! draining while the execution thread finishes its step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::{self, Inbound};
use super::codes::{CloseReason, InboundCode};
use super::handlers;
use super::outbound::Outbound;
use super::relay::ReportChannel;
use crate::executor::{ExecutionControl, KillMode};
use crate::models::{Identity, IdentityProvider, StepReport};
use crate::module_source::ModuleSourceStore;
use crate::update::UpdateScheduler;
use crate::{AppError, Result};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Transport connection in progress.
    Connecting,
    /// Waiting for the control plane to accept the handshake.
    Handshaking,
    /// Handshake sent; messages flow both ways.
    Active,
    /// Close frame queued.
    Closing,
}

/// Collaborators shared by every session of the process.
pub struct SessionContext {
    /// Control surface of the execution thread.
    pub executor: Arc<dyn ExecutionControl>,
    /// Identity source, consulted on connect and on handshake rejection.
    pub identity: Arc<dyn IdentityProvider>,
    /// Agent update planner.
    pub updater: Arc<dyn UpdateScheduler>,
    /// Module repository and tag.
    pub module_source: Arc<ModuleSourceStore>,
    /// Non-fatal startup errors reported in every handshake.
    pub init_errors: Vec<String>,
    /// Back-off before re-sending a rejected handshake.
    pub handshake_retry: Duration,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("init_errors", &self.init_errors)
            .field("handshake_retry", &self.handshake_retry)
            .finish_non_exhaustive()
    }
}

/// Drives one control-plane connection.
pub struct SessionManager {
    id: Uuid,
    ctx: Arc<SessionContext>,
    outbound: Outbound,
    state: Mutex<SessionState>,
    running: AtomicBool,
    closing: CancellationToken,
    identity: Mutex<Identity>,
    gate: tokio::sync::Mutex<()>,
}

impl SessionManager {
    /// Build a session writing to `outbound`.
    ///
    /// # Errors
    ///
    /// Returns the identity provider's error if no identity is available.
    pub fn new(ctx: Arc<SessionContext>, outbound: Outbound) -> Result<Self> {
        let identity = ctx.identity.identity()?;
        Ok(Self {
            id: Uuid::new_v4(),
            ctx,
            outbound,
            state: Mutex::new(SessionState::Disconnected),
            running: AtomicBool::new(true),
            closing: CancellationToken::new(),
            identity: Mutex::new(identity),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Connection id used in tracing spans.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session is meant to stay up.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves once [`SessionManager::close`] has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }

    /// Mark the transport connection as in progress.
    pub fn mark_connecting(&self) {
        self.set_state(SessionState::Connecting);
    }

    /// Transport is open: send the handshake.
    ///
    /// # Errors
    ///
    /// Returns the encoding or transport error if the handshake is not sent.
    pub async fn on_open(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        info!(session_id = %self.id, "connection opened");
        self.set_state(SessionState::Handshaking);
        self.handshake().await?;
        self.set_state(SessionState::Active);
        Ok(())
    }

    /// Handle one inbound text frame.
    ///
    /// Handler failures are logged and contained; only a frame that is not
    /// JSON closes the session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if `raw` cannot be decoded.
    pub async fn receive(&self, raw: &str) -> Result<()> {
        let _gate = self.gate.lock().await;

        let inbound = match codec::decode(raw) {
            Ok(inbound) => inbound,
            Err(err) => {
                error!(%err, "invalid json received");
                self.close_and_reset(CloseReason::InvalidJsonReceived).await;
                return Err(err);
            }
        };

        match inbound {
            Inbound::Unknown { code } => {
                warn!(?code, "no action bound to code, message dropped");
            }
            Inbound::Known { code, payload } => match self.dispatch(code, &payload).await {
                Ok(()) => debug!(?code, "action succeeded"),
                Err(err) => error!(?code, %err, "action failed, message dropped"),
            },
        }
        Ok(())
    }

    /// Stop the session and queue a close frame.
    pub fn close(&self, reason: CloseReason) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(
                session_id = %self.id,
                code = reason.code(),
                reason = reason.reason(),
                "closing connection"
            );
        }
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Disconnected {
                *state = SessionState::Closing;
            }
        }
        self.outbound.close(reason.code(), reason.reason());
        self.closing.cancel();
    }

    /// The transport is gone, whichever side closed it.
    pub fn on_close(&self, code: u16, reason: &str) {
        self.running.store(false, Ordering::SeqCst);
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, SessionState::Disconnected)
        };
        if previous != SessionState::Disconnected {
            info!(session_id = %self.id, code, reason, "connection closed");
        }
    }

    // ── Private helpers ─────────────────────────────────────────────

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(from = ?*state, to = ?next, "session state");
            *state = next;
        }
    }

    fn current_identity(&self) -> Identity {
        self.identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn handshake(&self) -> Result<()> {
        let identity = self.current_identity();
        let payload = match codec::encode_handshake(&identity, &self.ctx.init_errors) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "handshake cannot be encoded");
                self.close_and_reset(CloseReason::InvalidJsonSend).await;
                return Err(err);
            }
        };
        debug!(instance_id = %identity.instance_id, "sending handshake");
        self.send_json(payload).await
    }

    async fn send_json(&self, payload: String) -> Result<()> {
        let result = self.outbound.send(payload).await;
        if let Err(AppError::Transport(ref msg)) = result {
            error!(error = %msg, "write failed");
            self.close(CloseReason::WriteFailed);
        }
        result
    }

    async fn close_and_reset(&self, reason: CloseReason) {
        self.close(reason);
        if reason.resets_execution() {
            let executor = Arc::clone(&self.ctx.executor);
            if let Err(err) = tokio::task::spawn_blocking(move || executor.kill(KillMode::Wait)).await
            {
                warn!(%err, "execution reset did not complete");
            }
        }
    }

    async fn dispatch(&self, code: InboundCode, payload: &Value) -> Result<()> {
        match code {
            InboundCode::AppNotExist => self.retry_handshake().await,
            InboundCode::AgentUpdate => self.schedule_update(payload).await,
            InboundCode::RecipeData => self.apply_recipe(payload).await,
            InboundCode::WaitDone => {
                self.wait_done(payload);
                Ok(())
            }
        }
    }

    async fn retry_handshake(&self) -> Result<()> {
        info!("handshake rejected by control plane");
        self.set_state(SessionState::Handshaking);

        let refreshed = self.ctx.identity.identity()?;
        *self.identity.lock().unwrap_or_else(PoisonError::into_inner) = refreshed;

        info!(
            delay_secs = self.ctx.handshake_retry.as_secs(),
            "retrying handshake"
        );
        tokio::time::sleep(self.ctx.handshake_retry).await;
        if !self.is_running() {
            return Ok(());
        }
        self.handshake().await?;
        self.set_state(SessionState::Active);
        Ok(())
    }

    async fn schedule_update(&self, payload: &Value) -> Result<()> {
        let update = handlers::parse_agent_update(payload)?;
        info!(version = %update.version, url = %update.url, "update signal received");

        let updater = Arc::clone(&self.ctx.updater);
        tokio::task::spawn_blocking(move || updater.schedule(&update.version, &update.url))
            .await
            .map_err(|err| AppError::Update(format!("update task failed: {err}")))?
    }

    async fn apply_recipe(&self, payload: &Value) -> Result<()> {
        let request = handlers::parse_recipe(payload, &self.ctx.module_source.current())?;
        info!(version = request.version, "recipe received");

        if let Err(err) = self.ctx.module_source.update(request.module.clone()) {
            warn!(%err, "module source not persisted");
        }

        let executor = Arc::clone(&self.ctx.executor);
        if executor.version() == Some(request.version) && executor.is_running() {
            warn!(version = request.version, "version already current");
            return Ok(());
        }

        let version = request.version;
        let outcome = tokio::task::spawn_blocking(move || {
            info!("killing current execution");
            executor.kill(KillMode::Wait);
            executor.load(request.version, request.steps)
        })
        .await
        .map_err(|err| AppError::Step(format!("recipe load task failed: {err}")))??;

        info!(version, ?outcome, "recipe loaded");
        Ok(())
    }

    fn wait_done(&self, payload: &Value) {
        let done = match handlers::parse_wait_done(payload) {
            Ok(done) => done,
            Err(err) => {
                error!(%err, "invalid wait signal");
                return;
            }
        };

        let current = self.ctx.executor.version();
        if current == Some(done.version) {
            info!(id = %done.id, "waited state done");
            self.ctx.executor.state_done(&done.id);
        } else {
            warn!(
                ?current,
                received = done.version,
                id = %done.id,
                "stale wait signal ignored"
            );
        }
    }
}

impl ReportChannel for SessionManager {
    fn send_report(&self, report: &StepReport) -> Result<()> {
        if !self.is_running() {
            return Err(AppError::NoActiveSession);
        }

        let identity = self.current_identity();
        let payload = match codec::encode_state_log(&identity, report) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "report cannot be encoded");
                self.close(CloseReason::InvalidJsonSend);
                // Called from the execution thread itself, so it cannot wait.
                self.ctx.executor.kill(KillMode::Soft);
                return Err(err);
            }
        };

        let result = self.outbound.send_blocking(payload);
        if let Err(AppError::Transport(ref msg)) = result {
            error!(error = %msg, "write failed");
            self.close(CloseReason::WriteFailed);
        }
        result
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
