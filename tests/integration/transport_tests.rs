//! Integration tests for the WebSocket transport against a local server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use recipe_agent::executor::ExecutionControl;
use recipe_agent::module_source::{ModuleSource, ModuleSourceStore};
use recipe_agent::session::transport::run_connection;
use recipe_agent::session::{
    CloseReason, Frame, Outbound, SessionContext, SessionManager, SessionState,
};
use recipe_agent::update::UpdateScheduler;
use recipe_agent::AppError;

use super::test_helpers::{FakeExecutor, RecordingUpdater, RotatingIdentity};

/// Build a session the same way the helpers do, but keep the frame receiver
/// for the real transport writer.
fn session() -> (Arc<SessionManager>, mpsc::UnboundedReceiver<Frame>) {
    let ctx = Arc::new(SessionContext {
        executor: Arc::new(FakeExecutor::default()) as Arc<dyn ExecutionControl>,
        identity: Arc::new(RotatingIdentity::default()),
        updater: Arc::new(RecordingUpdater::default()) as Arc<dyn UpdateScheduler>,
        module_source: Arc::new(ModuleSourceStore::in_memory(ModuleSource::new("r", "t"))),
        init_errors: Vec::new(),
        handshake_retry: Duration::ZERO,
    });
    let (outbound, frames) = Outbound::channel();
    let session = Arc::new(SessionManager::new(ctx, outbound).expect("session"));
    (session, frames)
}

/// Accept one client, return its handshake, send `reply`, and return the
/// close code the client eventually sends.
async fn serve_once(listener: TcpListener, reply: Option<&'static str>) -> (Value, u16) {
    let (tcp, _) = listener.accept().await.expect("accept");
    let mut ws = tokio_tungstenite::accept_async(tcp)
        .await
        .expect("websocket upgrade");

    let handshake = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(&text).expect("handshake json"),
        other => panic!("expected handshake, got {other:?}"),
    };

    if let Some(reply) = reply {
        ws.send(Message::Text(reply.to_owned()))
            .await
            .expect("send reply");
    }

    loop {
        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => return (handshake, u16::from(frame.code)),
            Some(Ok(_)) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn invalid_json_from_server_closes_with_4001() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    let server = tokio::spawn(serve_once(listener, Some("{broken")));

    let (session, frames) = session();
    run_connection(Arc::clone(&session), frames, &url, CancellationToken::new())
        .await
        .expect("connection ran");

    let (handshake, code) = server.await.expect("server task");
    assert_eq!(handshake["code"], 1);
    assert_eq!(handshake["instance_id"], "i-1");
    assert_eq!(code, 4001);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn cancellation_closes_with_4000() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    let server = tokio::spawn(serve_once(listener, None));

    let (session, frames) = session();
    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    run_connection(Arc::clone(&session), frames, &url, cancel)
        .await
        .expect("connection ran");
    stopper.await.expect("stopper");

    let (_, code) = server.await.expect("server task");
    assert_eq!(code, 4000);
    assert!(!session.is_running());
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    drop(listener);

    let (session, frames) = session();
    let err = run_connection(Arc::clone(&session), frames, &url, CancellationToken::new())
        .await
        .expect_err("connect fails");

    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn local_close_ends_connection_while_server_is_silent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    let (resume_tx, resume_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(tcp)
            .await
            .expect("websocket upgrade");
        let _handshake = ws.next().await;
        // Hold the connection open without reading until the client is done.
        resume_rx.await.expect("resume");
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => {}
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    });

    let (session, frames) = session();
    let closer = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.close(CloseReason::WriteFailed);
        })
    };

    tokio::time::timeout(
        Duration::from_secs(5),
        run_connection(Arc::clone(&session), frames, &url, CancellationToken::new()),
    )
    .await
    .expect("connection ended after local close")
    .expect("connection ran");
    closer.await.expect("closer");
    assert_eq!(session.state(), SessionState::Disconnected);

    resume_tx.send(()).expect("server waiting");
    let code = server.await.expect("server task");
    assert_eq!(code, 4003);
}
