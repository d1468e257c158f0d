//! Wire messages for node-to-node calls
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id tying a reply back to its waiting caller
pub type CallId = u64;

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub cid: CallId,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// False for fire-and-forget calls; the server sends nothing back
    pub reply: bool,
    /// Wall-clock deadline in unix millis
    pub expires_at_ms: i64,
}

impl RpcRequest {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms
    }
}

/// Business outcome of a call, returned to the caller verbatim.
/// An empty `error` means no error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeReply {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: String,
}

impl InvokeReply {
    pub fn ok(result: impl Into<Value>) -> Self {
        Self {
            result: result.into(),
            error: String::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: error.into(),
        }
    }

    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub cid: CallId,
    #[serde(flatten)]
    pub body: InvokeReply,
    /// Set when the call did not complete at all (unknown method, handler panic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl RpcReply {
    pub fn completed(cid: CallId, body: InvokeReply) -> Self {
        Self {
            cid,
            body,
            fault: None,
        }
    }

    pub fn fault(cid: CallId, fault: impl Into<String>) -> Self {
        Self {
            cid,
            body: InvokeReply::default(),
            fault: Some(fault.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_reply_wire_shape() {
        let reply = RpcReply::completed(7, InvokeReply::err("not logged in"));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"cid": 7, "result": null, "error": "not logged in"})
        );

        let fault = RpcReply::fault(8, "method not found: Nope");
        let value = serde_json::to_value(&fault).unwrap();
        assert_eq!(value["fault"], json!("method not found: Nope"));
    }

    #[test]
    fn test_request_expiry() {
        let request = RpcRequest {
            cid: 1,
            method: "HD_Login".to_string(),
            args: vec![json!("alice")],
            reply: true,
            expires_at_ms: 1_000,
        };
        assert!(!request.is_expired(1_000));
        assert!(request.is_expired(1_001));
    }
}
