//! WebSocket transport for a [`SessionManager`].
//!
//! The socket is split: a writer task drains the outbound frame queue and
//! acknowledges every write, while the read loop below feeds inbound text
//! to the session until the connection ends or is closed locally.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::codes::{CloseReason, ABNORMAL_CLOSE};
use super::manager::{SessionManager, SessionState};
use super::outbound::Frame;
use crate::{AppError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Grace period for the writer to flush a close frame.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Connect to `url` and drive `session` until the connection ends.
///
/// # Errors
///
/// Returns `AppError::Transport` if the connection cannot be established.
pub async fn run_connection(
    session: Arc<SessionManager>,
    frames: mpsc::UnboundedReceiver<Frame>,
    url: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let span = tracing::info_span!("session", session_id = %session.id());
    drive(session, frames, url, cancel).instrument(span).await
}

async fn drive(
    session: Arc<SessionManager>,
    frames: mpsc::UnboundedReceiver<Frame>,
    url: &str,
    cancel: CancellationToken,
) -> Result<()> {
    session.mark_connecting();
    info!(url, "connecting to control plane");

    let (stream, _response) = match tokio_tungstenite::connect_async(url).await {
        Ok(connected) => connected,
        Err(err) => {
            session.on_close(ABNORMAL_CLOSE, &err.to_string());
            return Err(AppError::Transport(format!("failed to connect: {err}")));
        }
    };

    let (sink, mut read) = stream.split();
    let writer = tokio::spawn(run_writer(sink, frames).in_current_span());

    if let Err(err) = session.on_open().await {
        warn!(%err, "handshake not sent");
    }

    loop {
        if !session.is_running() {
            break;
        }
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = session.receive(&text).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = session.receive(&String::from_utf8_lossy(&bytes)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((ABNORMAL_CLOSE, String::new()), |f| {
                        (u16::from(f.code), f.reason.into_owned())
                    });
                    session.on_close(code, &reason);
                    break;
                }
                Some(Ok(_)) => {} // Ping/Pong/raw frames
                Some(Err(err)) => {
                    session.on_close(ABNORMAL_CLOSE, &err.to_string());
                    break;
                }
                None => {
                    session.on_close(ABNORMAL_CLOSE, "stream ended");
                    break;
                }
            },
            () = cancel.cancelled() => {
                session.close(CloseReason::Stop);
                break;
            }
            () = session.closed() => break,
        }
    }

    // Only a locally initiated close has a close frame left to flush.
    let abort = writer.abort_handle();
    if session.state() == SessionState::Closing
        && tokio::time::timeout(WRITER_DRAIN, writer).await.is_err()
    {
        debug!("writer did not finish in time");
    }
    abort.abort();
    session.on_close(ABNORMAL_CLOSE, "connection finished");
    Ok(())
}

async fn run_writer(mut sink: WsSink, mut frames: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Text { payload, ack } => {
                let result = sink
                    .send(Message::Text(payload))
                    .await
                    .map_err(|err| AppError::Transport(err.to_string()));
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            Frame::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    debug!(%err, "close frame not sent");
                }
                break;
            }
        }
    }
    debug!("writer stopped");
}
