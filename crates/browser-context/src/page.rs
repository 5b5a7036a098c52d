//! Handle to one attached page, built from raw CDP commands.
//!
//! Adapters drive everything through this surface: readiness polling,
//! selector probes, trusted input events, and document serialization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;

use crate::error::ContextError;
use crate::transport::CdpConnection;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Navigations get a far longer reply window than ordinary commands.
const NAVIGATE_DEADLINE: Duration = Duration::from_secs(60);

/// Viewport-space point targeted by mouse events.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ElementPoint {
    pub x: f64,
    pub y: f64,
}

/// One live page inside a browser context.
#[derive(Clone)]
pub struct PageHandle {
    conn: Arc<CdpConnection>,
    target_id: String,
    session_id: String,
}

impl PageHandle {
    pub(crate) fn new(conn: Arc<CdpConnection>, target_id: String, session_id: String) -> Self {
        Self {
            conn,
            target_id,
            session_id,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Cheap local check against the event-maintained target registry.
    pub fn is_closed(&self) -> bool {
        !self.conn.target_exists(&self.target_id)
    }

    /// Last-observed URL, falling back to a live read.
    pub async fn url(&self) -> String {
        if let Some(state) = self.conn.target_state(&self.target_id) {
            if !state.url.is_empty() {
                return state.url;
            }
        }
        self.evaluate_string("window.location.href")
            .await
            .unwrap_or_default()
    }

    /// Last-observed title, falling back to a live read.
    pub async fn title(&self) -> String {
        if let Some(state) = self.conn.target_state(&self.target_id) {
            if !state.title.is_empty() {
                return state.title;
            }
        }
        self.evaluate_string("document.title").await.unwrap_or_default()
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value, ContextError> {
        let response = self
            .conn
            .send(
                Some(&self.session_id),
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        Ok(response
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn evaluate_string(&self, expression: &str) -> Result<String, ContextError> {
        Ok(self
            .evaluate(expression)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Navigate and fail only when the browser itself rejects the load. A
    /// reply that merely takes long surfaces as `CommandTimeout`, which
    /// callers treat as best-effort.
    pub async fn navigate(&self, url: &str) -> Result<(), ContextError> {
        let response = self
            .conn
            .send_with_deadline(
                Some(&self.session_id),
                "Page.navigate",
                json!({ "url": url }),
                NAVIGATE_DEADLINE,
            )
            .await?;
        if let Some(error_text) = response
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            return Err(ContextError::NavigationFailed(format!(
                "{url}: {error_text}"
            )));
        }
        Ok(())
    }

    /// Poll `document.readyState` until interactive/complete or the deadline
    /// expires.
    pub async fn wait_dom_ready(&self, deadline: Duration) -> Result<(), ContextError> {
        let limit = Instant::now() + deadline;
        loop {
            let state = self.evaluate_string("document.readyState").await?;
            if matches!(state.as_str(), "interactive" | "complete") {
                return Ok(());
            }
            if Instant::now() >= limit {
                return Err(ContextError::CommandTimeout("dom ready".into()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the page's network session looks idle. Returns `Err` on
    /// deadline expiry so callers can decide whether that matters.
    pub async fn wait_network_idle(
        &self,
        window: Duration,
        deadline: Duration,
    ) -> Result<(), ContextError> {
        let activity = self.conn.activity();
        let limit = Instant::now() + deadline;
        loop {
            if activity.is_quiet(&self.session_id, window, 0) {
                return Ok(());
            }
            if Instant::now() >= limit {
                return Err(ContextError::CommandTimeout("network idle".into()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll for the presence of `selector` in the document.
    pub async fn wait_for_selector(
        &self,
        selector: &str,
        deadline: Duration,
    ) -> Result<(), ContextError> {
        let literal = js_string(selector)?;
        let expression = format!("document.querySelector({literal}) !== null");
        let limit = Instant::now() + deadline;
        loop {
            if self.evaluate(&expression).await?.as_bool().unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= limit {
                return Err(ContextError::CommandTimeout(format!(
                    "selector {selector}"
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Probe one selector for a visible, enabled element and return its
    /// center point.
    pub async fn query_visible(
        &self,
        selector: &str,
    ) -> Result<Option<ElementPoint>, ContextError> {
        let literal = js_string(selector)?;
        let expression = format!(
            "(() => {{\n  const el = document.querySelector({literal});\n  if (!el) return null;\n  const style = window.getComputedStyle(el);\n  const rect = el.getBoundingClientRect();\n  const visible = style.display !== 'none' && style.visibility !== 'hidden'\n    && rect.width > 0 && rect.height > 0;\n  const enabled = !el.disabled && el.getAttribute('aria-disabled') !== 'true';\n  if (!visible || !enabled) return null;\n  return {{ x: rect.x + rect.width / 2, y: rect.y + rect.height / 2 }};\n}})()"
        );
        let value = self.evaluate(&expression).await?;
        let (Some(x), Some(y)) = (
            value.get("x").and_then(Value::as_f64),
            value.get("y").and_then(Value::as_f64),
        ) else {
            return Ok(None);
        };
        Ok(Some(ElementPoint { x, y }))
    }

    pub async fn hover(&self, point: ElementPoint) -> Result<(), ContextError> {
        self.dispatch_mouse("mouseMoved", point, 0).await
    }

    pub async fn click(&self, point: ElementPoint) -> Result<(), ContextError> {
        self.dispatch_mouse("mousePressed", point, 1).await?;
        self.dispatch_mouse("mouseReleased", point, 1).await
    }

    async fn dispatch_mouse(
        &self,
        event_type: &str,
        point: ElementPoint,
        click_count: u32,
    ) -> Result<(), ContextError> {
        let mut payload = json!({
            "type": event_type,
            "x": point.x,
            "y": point.y,
        });
        if click_count > 0 {
            payload["button"] = json!("left");
            payload["clickCount"] = json!(click_count);
        }
        self.conn
            .send(Some(&self.session_id), "Input.dispatchMouseEvent", payload)
            .await
            .map(|_| ())
    }

    /// Focus fallback for inputs that swallow synthetic clicks.
    pub async fn focus(&self, selector: &str) -> Result<(), ContextError> {
        let literal = js_string(selector)?;
        let expression = format!(
            "(() => {{ const el = document.querySelector({literal}); if (el) el.focus(); return el !== null; }})()"
        );
        self.evaluate(&expression).await.map(|_| ())
    }

    /// Select-all followed by delete against the focused element.
    pub async fn clear_selection(&self) -> Result<(), ContextError> {
        self.dispatch_key("a", "KeyA", Some(2), None).await?;
        self.dispatch_key("Delete", "Delete", None, None).await
    }

    /// Insert text into the focused element without per-key events.
    pub async fn insert_text(&self, text: &str) -> Result<(), ContextError> {
        self.conn
            .send(
                Some(&self.session_id),
                "Input.insertText",
                json!({ "text": text }),
            )
            .await
            .map(|_| ())
    }

    pub async fn press_enter(&self) -> Result<(), ContextError> {
        self.dispatch_key("Enter", "Enter", None, Some(13)).await
    }

    async fn dispatch_key(
        &self,
        key: &str,
        code: &str,
        modifiers: Option<u32>,
        windows_virtual_key_code: Option<u32>,
    ) -> Result<(), ContextError> {
        for event_type in ["keyDown", "keyUp"] {
            let mut payload = json!({
                "type": event_type,
                "key": key,
                "code": code,
            });
            if let Some(modifiers) = modifiers {
                payload["modifiers"] = json!(modifiers);
            }
            if let Some(vk) = windows_virtual_key_code {
                payload["windowsVirtualKeyCode"] = json!(vk);
                payload["nativeVirtualKeyCode"] = json!(vk);
                if event_type == "keyDown" {
                    payload["text"] = json!("\r");
                    payload["unmodifiedText"] = json!("\r");
                }
            }
            self.conn
                .send(Some(&self.session_id), "Input.dispatchKeyEvent", payload)
                .await?;
        }
        Ok(())
    }

    /// Full serialized HTML of the document at call time.
    pub async fn content(&self) -> Result<String, ContextError> {
        self.evaluate_string("document.documentElement.outerHTML")
            .await
    }

    /// Close the underlying target. Closing an already-closed page succeeds.
    pub async fn close(&self) -> Result<(), ContextError> {
        match self
            .conn
            .send(
                None,
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(ContextError::CdpIo(message)) if message.contains("No target") => {
                debug!(target: "browser-context", target_id = %self.target_id, "close on missing target ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn js_string(raw: &str) -> Result<String, ContextError> {
    serde_json::to_string(raw).map_err(|err| ContextError::Internal(err.to_string()))
}
