//! Report delivery from the execution thread to whichever session is live.
//!
//! The relay outlives individual connections: the run loop binds each new
//! session and unbinds it when the connection ends. Reports produced while
//! no session is bound are retried until one appears or the executor stops.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::executor::ReportSink;
use crate::models::StepReport;
use crate::{AppError, Result};

/// Something that can push one report to the control plane.
pub trait ReportChannel: Send + Sync {
    /// Make a single delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoActiveSession` or `AppError::Transport` for
    /// failures a retry may fix, `AppError::Serialization` otherwise.
    fn send_report(&self, report: &StepReport) -> Result<()>;
}

/// Retrying [`ReportSink`] over the currently bound [`ReportChannel`].
pub struct Relay {
    channel: Mutex<Option<Arc<dyn ReportChannel>>>,
    resend_delay: Duration,
}

impl Relay {
    /// Relay retrying every `resend_delay`.
    #[must_use]
    pub fn new(resend_delay: Duration) -> Self {
        Self {
            channel: Mutex::new(None),
            resend_delay,
        }
    }

    /// Route reports to `channel` from now on.
    pub fn bind(&self, channel: Arc<dyn ReportChannel>) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        debug!("report channel bound");
    }

    /// Stop routing reports anywhere.
    pub fn unbind(&self) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("report channel unbound");
    }

    fn current(&self) -> Option<Arc<dyn ReportChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ReportSink for Relay {
    fn deliver(&self, report: &StepReport, keep_going: &dyn Fn() -> bool) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match self.current() {
                Some(channel) => channel.send_report(report),
                None => Err(AppError::NoActiveSession),
            };

            match result {
                Ok(()) => {
                    debug!(step_id = %report.step_id, attempt, "report delivered");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    error!(step_id = %report.step_id, attempt, %err, "can't send report");
                    if !keep_going() {
                        warn!(step_id = %report.step_id, "execution stopped, report abandoned");
                        return Err(err);
                    }
                    debug!(
                        delay_ms = self.resend_delay.as_millis(),
                        "execution still running, retrying"
                    );
                    thread::sleep(self.resend_delay);
                }
                Err(err) => {
                    error!(step_id = %report.step_id, %err, "report dropped");
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("bound", &self.current().is_some())
            .field("resend_delay", &self.resend_delay)
            .finish()
    }
}
