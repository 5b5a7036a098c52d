//! Relay state machine joining one CDP client socket to one extension socket.
//!
//! The relay forwards traffic transparently apart from three behaviors a
//! plain forwarder cannot provide: readiness synchronization (client commands
//! wait until an extension peer is attached), a small interception table
//! answered locally, and synthesized auto-attach notifications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    CdpFrame, TargetAttachment, CLOSE_SUPERSEDED, CLOSE_SUPERSEDED_REASON, METHOD_ATTACH_TO_TAB,
    METHOD_DETACHED_FROM_TAB, METHOD_DETACH_FROM_TAB, METHOD_FORWARD_COMMAND, METHOD_FORWARD_EVENT,
};

const ERR_EXTENSION_GONE: &str = "Extension disconnected before command could be processed";
const ERR_SOCKET_CLOSED: &str = "WebSocket closed";

/// Outcome a socket processor acts on after handling one inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SocketDirective {
    Continue,
    /// Close the socket that produced the frame (malformed JSON, detach request).
    Close,
}

/// A well-formed command from the CDP client that must reach the extension,
/// in arrival order relative to other such commands.
pub(crate) struct ClientCommand {
    pub id: u64,
    pub method: String,
    pub session_id: Option<String>,
    pub params: Option<Value>,
}

/// How one inbound client frame was routed.
pub(crate) enum ClientDispatch {
    /// Answered locally (or dropped); nothing else to do.
    Handled,
    /// Hand to the sequential forward worker.
    Forward(ClientCommand),
    /// Malformed JSON; close the socket.
    Malformed,
}

/// Handle the relay keeps for one connected peer socket.
pub(crate) struct PeerLink {
    /// Unique per-connection id so supersede and teardown can tell whether a
    /// slot still belongs to the socket being torn down.
    pub conn_id: u64,
    pub outbox: mpsc::UnboundedSender<Message>,
    pub token: CancellationToken,
}

impl PeerLink {
    fn supersede(self) {
        let _ = self.outbox.send(Message::Close(Some(CloseFrame {
            code: CLOSE_SUPERSEDED,
            reason: CLOSE_SUPERSEDED_REASON.into(),
        })));
        self.token.cancel();
    }
}

enum PendingReply {
    /// Resolve back to the CDP client under its original command id.
    ToClient {
        client_id: u64,
        outbox: mpsc::UnboundedSender<Message>,
    },
    /// Resolve an internal round-trip such as `attachToTab`.
    Internal(oneshot::Sender<Result<Value, String>>),
}

/// Shared state for one relay instance.
///
/// Holds at most one CDP-client socket and at most one extension socket; a
/// second connection on either role replaces the first with close code 1000.
pub struct RelayState {
    client: Mutex<Option<PeerLink>>,
    extension: Mutex<Option<PeerLink>>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    attachment: Mutex<Option<TargetAttachment>>,
    /// Readiness gate: resolves when an extension attaches. Replaced with a
    /// fresh channel on every extension disconnect.
    gate: Mutex<watch::Sender<bool>>,
    next_forward_id: AtomicU64,
    next_conn_id: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            client: Mutex::new(None),
            extension: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            attachment: Mutex::new(None),
            gate: Mutex::new(gate),
            next_forward_id: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- peer registration -------------------------------------------------

    pub(crate) fn register_client(&self, link: PeerLink) {
        let previous = self.client.lock().replace(link);
        if let Some(old) = previous {
            debug!(target: "cdp-relay", "cdp client superseded by new connection");
            old.supersede();
        }
    }

    pub(crate) fn register_extension(&self, link: PeerLink) {
        let previous = self.extension.lock().replace(link);
        if let Some(old) = previous {
            debug!(target: "cdp-relay", "extension peer superseded by new connection");
            old.supersede();
        }
        let _ = self.gate.lock().send_replace(true);
        debug!(target: "cdp-relay", "extension attached; relaying enabled");
    }

    /// Drop the client slot if it still belongs to `conn_id`, then ask the
    /// extension to release the debugger.
    pub(crate) fn unregister_client(&self, conn_id: u64) {
        let removed = {
            let mut slot = self.client.lock();
            match slot.as_ref() {
                Some(link) if link.conn_id == conn_id => slot.take().is_some(),
                _ => false,
            }
        };
        if removed {
            debug!(target: "cdp-relay", "cdp client disconnected");
            self.send_detach_best_effort();
        }
    }

    /// Drop the extension slot if it still belongs to `conn_id`. Every pending
    /// forward fails, the stored attachment is cleared, and a fresh readiness
    /// gate replaces the resolved one.
    pub(crate) fn unregister_extension(&self, conn_id: u64) {
        let removed = {
            let mut slot = self.extension.lock();
            match slot.as_ref() {
                Some(link) if link.conn_id == conn_id => slot.take().is_some(),
                _ => false,
            }
        };
        if !removed {
            return;
        }
        debug!(target: "cdp-relay", "extension disconnected; failing pending forwards");
        self.attachment.lock().take();
        let drained: Vec<(u64, PendingReply)> = self.pending.lock().drain().collect();
        for (_, reply) in drained {
            match reply {
                PendingReply::ToClient { client_id, outbox } => {
                    send_frame(&outbox, &CdpFrame::error_response(client_id, ERR_SOCKET_CLOSED));
                }
                PendingReply::Internal(tx) => {
                    let _ = tx.send(Err(ERR_SOCKET_CLOSED.to_string()));
                }
            }
        }
        let (fresh, _) = watch::channel(false);
        *self.gate.lock() = fresh;
    }

    pub(crate) fn close_all(&self) {
        if let Some(link) = self.client.lock().take() {
            link.supersede();
        }
        if let Some(link) = self.extension.lock().take() {
            link.supersede();
        }
    }

    // ---- frame handling: CDP client side -----------------------------------

    /// Route one text frame from the CDP client. Intercepted methods are
    /// answered here, synchronously, so they never queue behind forwarded
    /// commands suspended on the readiness gate; everything that must reach
    /// the extension is handed back for the sequential forward worker.
    pub(crate) fn dispatch_client_text(&self, text: &str, client: &PeerCtx) -> ClientDispatch {
        let frame: CdpFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "cdp-relay", %err, "malformed frame from cdp client; closing socket");
                return ClientDispatch::Malformed;
            }
        };

        let (id, method) = match (frame.id, frame.method.as_deref()) {
            (Some(id), Some(method)) => (id, method.to_string()),
            _ => {
                debug!(target: "cdp-relay", "client frame without id/method dropped");
                return ClientDispatch::Handled;
            }
        };

        match method.as_str() {
            "Browser.getVersion" => {
                send_frame(
                    &client.outbox,
                    &CdpFrame::response(
                        id,
                        json!({
                            "protocolVersion": "1.3",
                            "product": "Chrome/Bridge",
                            "userAgent": "CDP-Bridge/1.0",
                        }),
                    ),
                );
                ClientDispatch::Handled
            }
            "Browser.setDownloadBehavior" => {
                send_frame(&client.outbox, &CdpFrame::empty_response(id));
                ClientDispatch::Handled
            }
            "Target.getTargetInfo" => {
                let stored = self.attachment.lock().clone();
                match stored {
                    Some(attachment) => send_frame(
                        &client.outbox,
                        &CdpFrame::response(id, json!({ "targetInfo": attachment.target_info })),
                    ),
                    None => send_frame(
                        &client.outbox,
                        &CdpFrame::error_response(id, "No target attached"),
                    ),
                }
                ClientDispatch::Handled
            }
            _ => ClientDispatch::Forward(ClientCommand {
                id,
                method,
                session_id: frame.session_id,
                params: frame.params,
            }),
        }
    }

    /// Process one extension-bound command. Runs on the per-connection
    /// forward worker, which keeps arrival order for everything that touches
    /// the extension.
    pub(crate) async fn process_forward(&self, command: ClientCommand, client: &PeerCtx) {
        if command.method == "Target.setAutoAttach" && command.session_id.is_none() {
            self.handle_auto_attach(command.id, client).await;
        } else {
            self.forward_client_command(command, client).await;
        }
    }

    /// First `Target.setAutoAttach` without a session id: ask the extension
    /// to attach, record the attachment, synthesize the unsolicited
    /// `Target.attachedToTarget` notification, then answer the original id.
    async fn handle_auto_attach(&self, id: u64, client: &PeerCtx) {
        let reply = match self.forward_internal(METHOD_ATTACH_TO_TAB, client).await {
            Some(reply) => reply,
            None => return, // client went away while waiting
        };
        let value = match reply {
            Ok(value) => value,
            Err(message) => {
                send_frame(&client.outbox, &CdpFrame::error_response(id, message));
                return;
            }
        };

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut target_info = value.get("targetInfo").cloned().unwrap_or(Value::Null);
        if let Some(info) = target_info.as_object_mut() {
            info.insert("attached".to_string(), Value::Bool(true));
        }

        if session_id.is_empty() {
            warn!(target: "cdp-relay", "attachToTab reply missing sessionId");
            send_frame(
                &client.outbox,
                &CdpFrame::error_response(id, "attachToTab reply missing sessionId"),
            );
            return;
        }

        *self.attachment.lock() = Some(TargetAttachment {
            session_id: session_id.clone(),
            target_info: target_info.clone(),
        });

        send_frame(
            &client.outbox,
            &CdpFrame::event(
                "Target.attachedToTarget",
                json!({
                    "sessionId": session_id,
                    "targetInfo": target_info,
                    "waitingForDebugger": false,
                }),
            ),
        );
        send_frame(&client.outbox, &CdpFrame::empty_response(id));
    }

    async fn forward_client_command(&self, command: ClientCommand, client: &PeerCtx) {
        let sender = match self.wait_for_extension(&client.token).await {
            Some(sender) => sender,
            None => return, // abandoned: client disconnected while queued
        };

        let forward_id = self.next_forward_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "id": forward_id,
            "method": METHOD_FORWARD_COMMAND,
            "params": {
                "sessionId": command.session_id,
                "method": command.method,
                "params": command.params,
            },
        });

        self.pending.lock().insert(
            forward_id,
            PendingReply::ToClient {
                client_id: command.id,
                outbox: client.outbox.clone(),
            },
        );

        if sender.send(Message::Text(envelope.to_string())).is_err() {
            self.pending.lock().remove(&forward_id);
            send_frame(
                &client.outbox,
                &CdpFrame::error_response(command.id, ERR_EXTENSION_GONE),
            );
        }
    }

    /// Envelope round-trip resolved internally rather than to the client.
    /// Returns `None` when the client disconnects while queued on the gate.
    async fn forward_internal(
        &self,
        method: &str,
        client: &PeerCtx,
    ) -> Option<Result<Value, String>> {
        let sender = self.wait_for_extension(&client.token).await?;
        let forward_id = self.next_forward_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(forward_id, PendingReply::Internal(tx));

        let envelope = json!({ "id": forward_id, "method": method });
        if sender.send(Message::Text(envelope.to_string())).is_err() {
            self.pending.lock().remove(&forward_id);
            return Some(Err(ERR_EXTENSION_GONE.to_string()));
        }

        tokio::select! {
            _ = client.token.cancelled() => None,
            reply = rx => Some(reply.unwrap_or_else(|_| Err(ERR_SOCKET_CLOSED.to_string()))),
        }
    }

    /// Resolve the current extension sender, suspending on the readiness gate
    /// while no extension is paired. Returns `None` once `waiter` is
    /// cancelled, abandoning whatever was queued.
    async fn wait_for_extension(
        &self,
        waiter: &CancellationToken,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        loop {
            if let Some(sender) = self.extension_sender() {
                return Some(sender);
            }
            let mut ready = self.gate.lock().subscribe();
            tokio::select! {
                _ = waiter.cancelled() => return None,
                // Err means the gate was replaced after an extension
                // disconnect; either way loop and re-check the slot.
                _ = ready.changed() => {}
            }
        }
    }

    fn extension_sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.extension
            .lock()
            .as_ref()
            .map(|link| link.outbox.clone())
    }

    fn send_detach_best_effort(&self) {
        if let Some(sender) = self.extension_sender() {
            let forward_id = self.next_forward_id.fetch_add(1, Ordering::Relaxed);
            let envelope = json!({ "id": forward_id, "method": METHOD_DETACH_FROM_TAB });
            // No pending entry: a reply to this id is logged and dropped.
            let _ = sender.send(Message::Text(envelope.to_string()));
        }
    }

    // ---- frame handling: extension side ------------------------------------

    /// Process one text frame from the extension peer.
    pub(crate) fn on_extension_text(&self, text: &str) -> SocketDirective {
        let frame: CdpFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "cdp-relay", %err, "malformed frame from extension; closing socket");
                return SocketDirective::Close;
            }
        };

        // A frame with an id and no method is a reply, even when the
        // extension sent a bare success without a result payload.
        if frame.is_response() || (frame.id.is_some() && frame.method.is_none()) {
            self.resolve_forward(frame);
            return SocketDirective::Continue;
        }

        match frame.method.as_deref() {
            Some(METHOD_FORWARD_EVENT) => {
                let params = frame.params.unwrap_or(Value::Null);
                let inner = CdpFrame {
                    session_id: params
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    method: params
                        .get("method")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    params: params.get("params").cloned(),
                    ..CdpFrame::default()
                };
                match self.client.lock().as_ref() {
                    Some(link) => send_frame(&link.outbox, &inner),
                    None => {
                        debug!(target: "cdp-relay", method = ?inner.method, "no cdp client; extension event discarded")
                    }
                }
                SocketDirective::Continue
            }
            Some(METHOD_DETACHED_FROM_TAB) => {
                debug!(target: "cdp-relay", "extension reported tab detach");
                self.attachment.lock().take();
                SocketDirective::Close
            }
            Some(other) => {
                debug!(target: "cdp-relay", method = %other, "unhandled extension message dropped");
                SocketDirective::Continue
            }
            None => {
                debug!(target: "cdp-relay", "extension frame without method dropped");
                SocketDirective::Continue
            }
        }
    }

    fn resolve_forward(&self, frame: CdpFrame) {
        let id = frame.id.unwrap_or_default();
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(PendingReply::ToClient { client_id, outbox }) => {
                let response = match (frame.result, frame.error) {
                    (_, Some(error)) => CdpFrame::error_response(client_id, error.message),
                    (Some(result), None) => CdpFrame::response(client_id, result),
                    (None, None) => CdpFrame::empty_response(client_id),
                };
                send_frame(&outbox, &response);
            }
            Some(PendingReply::Internal(tx)) => {
                let reply = match (frame.result, frame.error) {
                    (_, Some(error)) => Err(error.message),
                    (result, None) => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(reply);
            }
            None => {
                warn!(target: "cdp-relay", id, "reply with unknown id dropped");
            }
        }
    }

    /// Current stored attachment, for observability.
    pub fn attachment(&self) -> Option<TargetAttachment> {
        self.attachment.lock().clone()
    }

    pub fn has_client(&self) -> bool {
        self.client.lock().is_some()
    }

    pub fn has_extension(&self) -> bool {
        self.extension.lock().is_some()
    }
}

/// Per-socket context a processor carries while handling frames.
pub(crate) struct PeerCtx {
    pub outbox: mpsc::UnboundedSender<Message>,
    pub token: CancellationToken,
}

fn send_frame(outbox: &mpsc::UnboundedSender<Message>, frame: &CdpFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = outbox.send(Message::Text(text));
        }
        Err(err) => warn!(target: "cdp-relay", %err, "failed to serialize relay frame"),
    }
}
