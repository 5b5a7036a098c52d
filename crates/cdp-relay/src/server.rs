//! Relay HTTP/WebSocket server: two upgrade endpoints on one origin.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::protocol::{CLOSE_INVALID_PATH, CLOSE_INVALID_PATH_REASON};
use crate::relay::{ClientCommand, ClientDispatch, PeerCtx, PeerLink, RelayState, SocketDirective};
use crate::RelayError;

/// Running relay instance. Dropping the handle leaves the server running;
/// call [`RelayHandle::shutdown`] to stop it.
pub struct RelayHandle {
    addr: SocketAddr,
    state: Arc<RelayState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint a CDP client should dial.
    pub fn cdp_url(&self) -> String {
        format!("ws://{}/cdp", self.addr)
    }

    /// Endpoint the browser extension should dial.
    pub fn extension_url(&self) -> String {
        format!("ws://{}/extension", self.addr)
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Close both peers and stop the listener. Idempotent in effect: a second
    /// call on a fresh handle to a stopped server is a no-op.
    pub async fn shutdown(self) {
        self.state.close_all();
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Bind `addr` (port 0 picks a free port), start serving, and return the
/// handle carrying the assigned address. Binding first and reading
/// `local_addr` is what lets a caller construct the `/cdp` endpoint URL
/// before any peer connects.
pub async fn start(addr: SocketAddr) -> Result<RelayHandle, RelayError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(RelayError::Bind)?;
    let local = listener.local_addr().map_err(RelayError::Bind)?;

    let state = Arc::new(RelayState::new());
    let router = Router::new()
        .route("/cdp", get(cdp_upgrade))
        .route("/extension", get(extension_upgrade))
        .fallback(reject_unknown_path)
        .with_state(Arc::clone(&state));

    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let shutdown = async move { serve_cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(target: "cdp-relay", %err, "relay server exited with error");
        }
    });

    info!(target: "cdp-relay", %local, "relay listening");
    Ok(RelayHandle {
        addr: local,
        state,
        cancel,
        task,
    })
}

async fn cdp_upgrade(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_socket(state, socket))
}

async fn extension_upgrade(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| extension_socket(state, socket))
}

/// Upgrades on any other path are accepted and immediately closed with 4004;
/// plain HTTP requests get a 404.
async fn reject_unknown_path(ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_INVALID_PATH,
                        reason: CLOSE_INVALID_PATH_REASON.into(),
                    })))
                    .await;
            })
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// One CDP client: a writer draining the outbox, a reader feeding an inbox,
/// a dispatch loop answering intercepted methods on the spot, and a forward
/// worker that delivers everything else to the extension in arrival order.
/// The split means a `Browser.getVersion` is answered even while an earlier
/// forwarded command sits suspended on the readiness gate.
async fn client_socket(state: Arc<RelayState>, socket: WebSocket) {
    let conn_id = state.allocate_conn_id();
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let token = CancellationToken::new();

    state.register_client(PeerLink {
        conn_id,
        outbox: out_tx.clone(),
        token: token.clone(),
    });

    let writer = tokio::spawn(socket_writer(sink, out_rx));
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<String>();
    let reader = tokio::spawn(socket_reader(stream, in_tx, token.clone()));

    let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel::<ClientCommand>();
    let fwd_state = Arc::clone(&state);
    let fwd_ctx = PeerCtx {
        outbox: out_tx.clone(),
        token: token.clone(),
    };
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = fwd_ctx.token.cancelled() => break,
                command = fwd_rx.recv() => match command {
                    Some(command) => fwd_state.process_forward(command, &fwd_ctx).await,
                    None => break,
                },
            }
        }
    });

    let ctx = PeerCtx {
        outbox: out_tx.clone(),
        token: token.clone(),
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            inbound = in_rx.recv() => {
                let text = match inbound {
                    Some(text) => text,
                    None => break,
                };
                match state.dispatch_client_text(&text, &ctx) {
                    ClientDispatch::Handled => {}
                    ClientDispatch::Forward(command) => {
                        if fwd_tx.send(command).is_err() {
                            break;
                        }
                    }
                    ClientDispatch::Malformed => {
                        let _ = out_tx.send(Message::Close(None));
                        break;
                    }
                }
            }
        }
    }

    token.cancel();
    state.unregister_client(conn_id);
    drop(fwd_tx);
    drop(out_tx);
    drop(ctx);
    let _ = forwarder.await;
    let _ = reader.await;
    let _ = writer.await;
    debug!(target: "cdp-relay", conn_id, "cdp client socket closed");
}

/// One extension peer: reader, writer, and a sequential processor, so events
/// reach the client in the order the extension sent them.
async fn extension_socket(state: Arc<RelayState>, socket: WebSocket) {
    let conn_id = state.allocate_conn_id();
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let token = CancellationToken::new();

    state.register_extension(PeerLink {
        conn_id,
        outbox: out_tx.clone(),
        token: token.clone(),
    });

    let writer = tokio::spawn(socket_writer(sink, out_rx));
    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<String>();
    let reader = tokio::spawn(socket_reader(stream, in_tx, token.clone()));

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            inbound = in_rx.recv() => {
                let text = match inbound {
                    Some(text) => text,
                    None => break,
                };
                if state.on_extension_text(&text) == SocketDirective::Close {
                    let _ = out_tx.send(Message::Close(None));
                    break;
                }
            }
        }
    }

    token.cancel();
    state.unregister_extension(conn_id);
    drop(out_tx);
    let _ = reader.await;
    let _ = writer.await;
    debug!(target: "cdp-relay", conn_id, "extension socket closed");
}

async fn socket_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn socket_reader(
    mut stream: SplitStream<WebSocket>,
    in_tx: mpsc::UnboundedSender<String>,
    token: CancellationToken,
) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if in_tx.send(text).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    // Cancelling here is what abandons commands still queued on the
    // readiness gate after the peer goes away.
    token.cancel();
}
