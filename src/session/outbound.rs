//! Outbound frame queue between the session and the socket writer task.
//!
//! Every text frame carries a oneshot acknowledgement so the caller learns
//! whether the write actually reached the socket. Async callers await the
//! ack; the execution thread blocks on it.

use tokio::sync::{mpsc, oneshot};

use crate::{AppError, Result};

/// A frame queued for the writer task.
#[derive(Debug)]
pub enum Frame {
    /// JSON text frame.
    Text {
        /// Serialized message.
        payload: String,
        /// Outcome of the write.
        ack: oneshot::Sender<Result<()>>,
    },
    /// Close frame; the writer stops after sending it.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Sending half of the frame queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Frame>,
}

impl Outbound {
    /// Create a queue and the receiver the writer task drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue `payload` and wait for the writer's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NoActiveSession` if the writer is gone, or
    /// `AppError::Transport` if the write failed.
    pub async fn send(&self, payload: String) -> Result<()> {
        let ack = self.enqueue(payload)?;
        ack.await
            .map_err(|_| AppError::Transport("writer dropped the frame".into()))?
    }

    /// Blocking variant of [`Self::send`] for non-async threads.
    ///
    /// Must not be called from within an async runtime worker.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send`].
    pub fn send_blocking(&self, payload: String) -> Result<()> {
        let ack = self.enqueue(payload)?;
        ack.blocking_recv()
            .map_err(|_| AppError::Transport("writer dropped the frame".into()))?
    }

    /// Queue a close frame. Ignored if the writer is already gone.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Frame::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    fn enqueue(&self, payload: String) -> Result<oneshot::Receiver<Result<()>>> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Frame::Text { payload, ack })
            .map_err(|_| AppError::NoActiveSession)?;
        Ok(rx)
    }
}
