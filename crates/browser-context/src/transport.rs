//! Single-task runtime over one CDP WebSocket connection.
//!
//! One spawned loop owns the `chromiumoxide` connection: commands arrive over
//! an mpsc channel carrying oneshot responders, replies are matched back by
//! `CallId`, and `Target.*` / `Network.*` events keep the target registry and
//! the per-session network-activity tracker current.

use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ContextError;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Last-observed facts about one browser target.
#[derive(Clone, Debug, Default)]
pub struct TargetState {
    pub url: String,
    pub title: String,
    pub kind: String,
    pub session: Option<String>,
}

/// One page-typed target as reported by `Target.getTargets`.
#[derive(Clone, Debug)]
pub struct PageInfo {
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub attached: bool,
}

struct ControlMessage {
    session: Option<String>,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, ContextError>>,
}

/// Per-session network activity, fed by `Network.*` events.
#[derive(Default)]
pub struct NetworkActivity {
    sessions: DashMap<String, SessionActivity>,
}

struct SessionActivity {
    inflight: i64,
    last_activity: Instant,
}

impl NetworkActivity {
    fn record_start(&self, session: &str) {
        let mut entry = self
            .sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionActivity {
                inflight: 0,
                last_activity: Instant::now(),
            });
        entry.inflight += 1;
        entry.last_activity = Instant::now();
    }

    fn record_end(&self, session: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session) {
            entry.inflight = (entry.inflight - 1).max(0);
            entry.last_activity = Instant::now();
        }
    }

    fn forget(&self, session: &str) {
        self.sessions.remove(session);
    }

    /// Quiet means: at most `max_inflight` requests outstanding and no
    /// activity for at least `window`. A session never seen counts as quiet.
    pub fn is_quiet(&self, session: &str, window: Duration, max_inflight: i64) -> bool {
        match self.sessions.get(session) {
            Some(entry) => {
                entry.inflight <= max_inflight && entry.last_activity.elapsed() >= window
            }
            None => true,
        }
    }
}

/// Live CDP connection with command correlation and event bookkeeping.
pub struct CdpConnection {
    command_tx: mpsc::Sender<ControlMessage>,
    targets: Arc<DashMap<String, TargetState>>,
    sessions: Arc<DashMap<String, String>>,
    activity: Arc<NetworkActivity>,
    alive: Arc<AtomicBool>,
    loop_task: JoinHandle<()>,
}

impl CdpConnection {
    /// Connect to a DevTools WebSocket endpoint and spawn the event loop.
    pub async fn connect(ws_url: &str) -> Result<Self, ContextError> {
        let conn = Connection::<CdpEventMessage>::connect(ws_url)
            .await
            .map_err(|err| ContextError::CdpIo(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let targets: Arc<DashMap<String, TargetState>> = Arc::new(DashMap::new());
        let sessions: Arc<DashMap<String, String>> = Arc::new(DashMap::new());
        let activity = Arc::new(NetworkActivity::default());
        let alive = Arc::new(AtomicBool::new(true));

        let loop_alive = alive.clone();
        let loop_targets = targets.clone();
        let loop_sessions = sessions.clone();
        let loop_activity = activity.clone();
        let loop_task = tokio::spawn(async move {
            let result =
                run_loop(conn, command_rx, loop_targets, loop_sessions, loop_activity).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                warn!(target: "browser-context", %err, "cdp connection loop terminated");
            }
        });

        debug!(target: "browser-context", url = %ws_url, "cdp connection established");
        Ok(Self {
            command_tx,
            targets,
            sessions,
            activity,
            alive,
            loop_task,
        })
    }

    /// Subscribe to target discovery and flat auto-attach so the registry
    /// fills in as pages come and go.
    pub async fn start_discovery(&self) -> Result<(), ContextError> {
        self.send(None, "Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;
        self.send(
            None,
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
        )
        .await?;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn activity(&self) -> Arc<NetworkActivity> {
        Arc::clone(&self.activity)
    }

    /// Last-observed state for a target, if it is still known.
    pub fn target_state(&self, target_id: &str) -> Option<TargetState> {
        self.targets.get(target_id).map(|entry| entry.value().clone())
    }

    pub fn target_exists(&self, target_id: &str) -> bool {
        self.targets.contains_key(target_id)
    }

    /// Send one command and await its reply. `session` routes the command to
    /// an attached target; `None` addresses the browser endpoint.
    pub async fn send(
        &self,
        session: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, ContextError> {
        self.send_with_deadline(session, method, params, DEFAULT_DEADLINE)
            .await
    }

    /// Like [`send`](Self::send) but with a caller-chosen reply deadline, for
    /// commands such as `Page.navigate` whose tolerated window is longer than
    /// ordinary round-trips.
    pub async fn send_with_deadline(
        &self,
        session: Option<&str>,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ContextError> {
        if !self.is_alive() {
            return Err(ContextError::ContextClosed);
        }
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            session: session.map(str::to_string),
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|_| ContextError::ContextClosed)?;

        match tokio::time::timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ContextError::ContextClosed),
            Err(_) => Err(ContextError::CommandTimeout(method.to_string())),
        }
    }

    /// Authoritative page listing straight from the browser. Errors here mean
    /// the context itself is unusable.
    pub async fn list_pages(&self) -> Result<Vec<PageInfo>, ContextError> {
        let response = self.send(None, "Target.getTargets", json!({})).await?;
        let infos: GetTargetsResult = serde_json::from_value(response)
            .map_err(|err| ContextError::Internal(err.to_string()))?;
        Ok(infos
            .target_infos
            .into_iter()
            .filter(|info| info.target_type == "page")
            .map(|info| PageInfo {
                target_id: info.target_id,
                url: info.url.unwrap_or_default(),
                title: info.title.unwrap_or_default(),
                attached: info.attached.unwrap_or(false),
            })
            .collect())
    }

    pub async fn create_target(&self, url: &str) -> Result<String, ContextError> {
        let response = self
            .send(None, "Target.createTarget", json!({ "url": url }))
            .await?;
        response
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ContextError::Internal("createTarget missing targetId".into()))
    }

    /// Attach to a target with a flat session and enable the domains the
    /// page handle relies on.
    pub async fn attach(&self, target_id: &str) -> Result<String, ContextError> {
        let response = self
            .send(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = response
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ContextError::Internal("attachToTarget missing sessionId".into()))?;

        self.sessions
            .insert(session_id.clone(), target_id.to_string());
        if let Some(mut entry) = self.targets.get_mut(target_id) {
            entry.session = Some(session_id.clone());
        } else {
            self.targets.insert(
                target_id.to_string(),
                TargetState {
                    session: Some(session_id.clone()),
                    kind: "page".into(),
                    ..TargetState::default()
                },
            );
        }

        for domain in ["Page.enable", "Network.enable"] {
            if let Err(err) = self.send(Some(&session_id), domain, json!({})).await {
                debug!(target: "browser-context", %err, domain, "domain enable failed");
            }
        }
        Ok(session_id)
    }

    /// Wait for an attached session to appear for `target_id`, as auto-attach
    /// races target creation.
    pub async fn wait_for_session(
        &self,
        target_id: &str,
        deadline: Duration,
    ) -> Result<String, ContextError> {
        let limit = Instant::now() + deadline;
        loop {
            if let Some(session) = self
                .targets
                .get(target_id)
                .and_then(|entry| entry.session.clone())
            {
                return Ok(session);
            }
            if Instant::now() >= limit {
                return Err(ContextError::Internal(format!(
                    "no cdp session for target {target_id}"
                )));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop the loop task. Pending commands fail with `ContextClosed`.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<ControlMessage>,
    targets: Arc<DashMap<String, TargetState>>,
    sessions: Arc<DashMap<String, String>>,
    activity: Arc<NetworkActivity>,
) -> Result<(), ContextError> {
    let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, ContextError>>> =
        HashMap::new();

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                let session = cmd.session.map(CdpSessionId::from);
                let method_id: MethodId = cmd.method.clone().into();
                match conn.submit_command(method_id, session, cmd.params) {
                    Ok(call_id) => {
                        inflight.insert(call_id, cmd.responder);
                    }
                    Err(err) => {
                        let _ = cmd
                            .responder
                            .send(Err(ContextError::CdpIo(err.to_string())));
                    }
                }
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        if let Some(sender) = inflight.remove(&resp.id) {
                            let result = match (resp.result, resp.error) {
                                (_, Some(error)) => Err(ContextError::CdpIo(format!(
                                    "cdp error {}: {}",
                                    error.code, error.message
                                ))),
                                (Some(result), None) => Ok(result),
                                (None, None) => Ok(Value::Null),
                            };
                            let _ = sender.send(result);
                        }
                    }
                    Some(Ok(Message::Event(event))) => {
                        if let Err(err) =
                            handle_event(event, &targets, &sessions, &activity)
                        {
                            debug!(target: "browser-context", %err, "cdp event dropped");
                        }
                    }
                    Some(Err(err)) => {
                        let mapped = map_cdp_error(err);
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(mapped.clone()));
                        }
                        return Err(mapped);
                    }
                    None => {
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(ContextError::ContextClosed));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_event(
    event: CdpEventMessage,
    targets: &DashMap<String, TargetState>,
    sessions: &DashMap<String, String>,
    activity: &NetworkActivity,
) -> Result<(), ContextError> {
    let raw: CdpJsonEventMessage = event
        .try_into()
        .map_err(|err| ContextError::Internal(format!("failed to decode cdp event: {err}")))?;
    let method: &str = raw.method.as_ref();

    match method {
        "Target.targetCreated" | "Target.targetInfoChanged" => {
            let payload: TargetInfoParams = serde_json::from_value(raw.params)
                .map_err(|err| ContextError::Internal(err.to_string()))?;
            let info = payload.target_info;
            let mut entry = targets.entry(info.target_id.clone()).or_default();
            entry.kind = info.target_type;
            if let Some(url) = info.url.filter(|u| !u.is_empty()) {
                entry.url = url;
            }
            if let Some(title) = info.title {
                entry.title = title;
            }
        }
        "Target.targetDestroyed" => {
            let payload: TargetDestroyedParams = serde_json::from_value(raw.params)
                .map_err(|err| ContextError::Internal(err.to_string()))?;
            if let Some((_, state)) = targets.remove(&payload.target_id) {
                if let Some(session) = state.session {
                    sessions.remove(&session);
                    activity.forget(&session);
                }
            }
        }
        "Target.attachedToTarget" => {
            let payload: AttachedParams = serde_json::from_value(raw.params)
                .map_err(|err| ContextError::Internal(err.to_string()))?;
            let info = payload.target_info;
            sessions.insert(payload.session_id.clone(), info.target_id.clone());
            let mut entry = targets.entry(info.target_id).or_default();
            entry.kind = info.target_type;
            entry.session = Some(payload.session_id);
            if let Some(url) = info.url.filter(|u| !u.is_empty()) {
                entry.url = url;
            }
            if let Some(title) = info.title {
                entry.title = title;
            }
        }
        "Target.detachedFromTarget" => {
            let payload: DetachedParams = serde_json::from_value(raw.params)
                .map_err(|err| ContextError::Internal(err.to_string()))?;
            if let Some((_, target_id)) = sessions.remove(&payload.session_id) {
                if let Some(mut entry) = targets.get_mut(&target_id) {
                    entry.session = None;
                }
            }
            activity.forget(&payload.session_id);
        }
        "Network.requestWillBeSent" => {
            if let Some(session) = raw.session_id.as_deref() {
                activity.record_start(session);
            }
        }
        "Network.loadingFinished" | "Network.loadingFailed" => {
            if let Some(session) = raw.session_id.as_deref() {
                activity.record_end(session);
            }
        }
        _ => {}
    }
    Ok(())
}

fn map_cdp_error(err: CdpError) -> ContextError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => ContextError::CommandTimeout(hint),
        _ => ContextError::CdpIo(hint),
    }
}

#[derive(Debug, Deserialize)]
struct GetTargetsResult {
    #[serde(rename = "targetInfos")]
    target_infos: Vec<TargetInfoPayload>,
}

#[derive(Debug, Deserialize)]
struct TargetInfoParams {
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct TargetDestroyedParams {
    #[serde(rename = "targetId")]
    target_id: String,
}

#[derive(Debug, Deserialize)]
struct AttachedParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "targetInfo")]
    target_info: TargetInfoPayload,
}

#[derive(Debug, Deserialize)]
struct DetachedParams {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TargetInfoPayload {
    #[serde(rename = "targetId")]
    target_id: String,
    #[serde(rename = "type")]
    target_type: String,
    url: Option<String>,
    title: Option<String>,
    attached: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_session_counts_as_quiet() {
        let activity = NetworkActivity::default();
        assert!(activity.is_quiet("S1", Duration::from_millis(500), 0));
    }

    #[test]
    fn inflight_requests_block_quiet() {
        let activity = NetworkActivity::default();
        activity.record_start("S1");
        assert!(!activity.is_quiet("S1", Duration::ZERO, 0));
        activity.record_end("S1");
        assert!(activity.is_quiet("S1", Duration::ZERO, 0));
    }

    #[test]
    fn quiet_requires_the_window_to_elapse() {
        let activity = NetworkActivity::default();
        activity.record_start("S1");
        activity.record_end("S1");
        assert!(!activity.is_quiet("S1", Duration::from_secs(60), 0));
    }

    #[test]
    fn end_without_start_does_not_underflow() {
        let activity = NetworkActivity::default();
        activity.record_start("S1");
        activity.record_end("S1");
        activity.record_end("S1");
        assert!(activity.is_quiet("S1", Duration::ZERO, 0));
    }
}
