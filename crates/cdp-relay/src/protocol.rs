//! Frame and envelope shapes spoken on the relay's two sockets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close code used when a newer peer replaces an existing one.
pub const CLOSE_SUPERSEDED: u16 = 1000;
pub const CLOSE_SUPERSEDED_REASON: &str = "New connection established";

/// Close code for a WebSocket upgrade on an unknown path.
pub const CLOSE_INVALID_PATH: u16 = 4004;
pub const CLOSE_INVALID_PATH_REASON: &str = "Invalid path";

/// Envelope methods understood by the extension peer.
pub const METHOD_FORWARD_COMMAND: &str = "forwardCDPCommand";
pub const METHOD_ATTACH_TO_TAB: &str = "attachToTab";
pub const METHOD_DETACH_FROM_TAB: &str = "detachFromTab";
pub const METHOD_FORWARD_EVENT: &str = "forwardCDPEvent";
pub const METHOD_DETACHED_FROM_TAB: &str = "detachedFromTab";

/// One JSON frame on either socket. `method` marks a request or notification;
/// `result`/`error` mark a response correlated by `id`. Unknown fields are
/// ignored on input and absent fields are omitted on output.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CdpFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl CdpFrame {
    pub fn response(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::default()
        }
    }

    /// Empty success carrying only the correlating id.
    pub fn empty_response(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn error_response(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            error: Some(ErrorShape {
                message: message.into(),
                code: None,
            }),
            ..Self::default()
        }
    }

    pub fn event(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.id.is_some() && (self.result.is_some() || self.error.is_some())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorShape {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// The relay's record of the tab currently being debugged, obtained from the
/// extension's `attachToTab` reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetAttachment {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "targetInfo")]
    pub target_info: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_response_serializes_to_bare_id() {
        let text = serde_json::to_string(&CdpFrame::empty_response(12)).unwrap();
        assert_eq!(text, r#"{"id":12}"#);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let frame: CdpFrame =
            serde_json::from_str(r#"{"id":1,"method":"Page.navigate","surprise":true}"#).unwrap();
        assert_eq!(frame.id, Some(1));
        assert_eq!(frame.method.as_deref(), Some("Page.navigate"));
    }

    #[test]
    fn response_detection_requires_payload() {
        let bare: CdpFrame = serde_json::from_str(r#"{"id":3}"#).unwrap();
        assert!(!bare.is_response());
        let with_result: CdpFrame = serde_json::from_str(r#"{"id":3,"result":{}}"#).unwrap();
        assert!(with_result.is_response());
        let with_error: CdpFrame =
            serde_json::from_str(r#"{"id":3,"error":{"message":"nope"}}"#).unwrap();
        assert!(with_error.is_response());
    }

    #[test]
    fn session_id_round_trips_in_camel_case() {
        let frame = CdpFrame {
            id: Some(9),
            session_id: Some("S1".into()),
            method: Some("Target.sendMessageToTarget".into()),
            params: Some(json!({"x": 1})),
            ..CdpFrame::default()
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["sessionId"], "S1");
        assert!(value.get("result").is_none());
    }
}
