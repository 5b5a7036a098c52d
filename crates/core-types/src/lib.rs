//! Shared vocabulary for the promptbridge workspace.
//!
//! Holds the identifiers and caller-facing value types that cross crate
//! boundaries so that the controller, the adapter framework, and external
//! dispatchers agree on one wire shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier for a logical tab owned by the controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TabId(pub Uuid);

impl TabId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-visible snapshot of one tab.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub id: TabId,
    pub url: String,
    pub title: String,
    #[serde(rename = "siteId", skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

/// Caller-visible description of a supported website.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebsiteInfo {
    #[serde(rename = "websiteId")]
    pub website_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "homeURL")]
    pub home_url: String,
    #[serde(rename = "requiresProxy")]
    pub requires_proxy: bool,
}

/// Surface-stable error taxonomy returned to external callers.
///
/// Every controller operation resolves to either a structured success or one
/// of these kinds with a human-readable message; nothing panics across the
/// caller boundary.
#[derive(Clone, Debug, Error)]
pub enum ControllerError {
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),
    #[error("tab not found: {0}")]
    TabNotFound(TabId),
    #[error("tab closed: {0}")]
    TabClosed(TabId),
    #[error("no adapter for site '{site_id}' or url '{url}'")]
    AdapterMissing { site_id: String, url: String },
    #[error("adapter failure: {0}")]
    AdapterFailure(String),
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_ids_are_unique() {
        assert_ne!(TabId::new(), TabId::new());
    }

    #[test]
    fn snapshot_omits_absent_site_id() {
        let snapshot = TabSnapshot {
            id: TabId::new(),
            url: "https://example.com".into(),
            title: "Example".into(),
            site_id: None,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("siteId").is_none());
        assert!(value.get("url").is_some());
    }

    #[test]
    fn website_info_uses_wire_names() {
        let info = WebsiteInfo {
            website_id: "deepseek".into(),
            display_name: "DeepSeek".into(),
            home_url: "https://chat.deepseek.com".into(),
            requires_proxy: false,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["websiteId"], "deepseek");
        assert_eq!(value["homeURL"], "https://chat.deepseek.com");
    }
}
