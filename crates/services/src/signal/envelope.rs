use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON framing used on the bidirectional signaling channel. Every text
/// frame is exactly one envelope: a request expecting a response, the
/// response to a previous request, or a fire-and-forget notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Notification(NotificationEnvelope),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request: bool,
    pub id: u32,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub response: bool,
    pub id: u32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification: bool,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn request(id: u32, method: impl Into<String>, data: Value) -> Self {
        Self::Request(RequestEnvelope {
            request: true,
            id,
            method: method.into(),
            data: Some(data),
        })
    }

    pub fn success(id: u32, data: Value) -> Self {
        Self::Response(ResponseEnvelope {
            response: true,
            id,
            ok: true,
            data: Some(data),
            error_code: None,
            error_reason: None,
        })
    }

    pub fn error(id: u32, code: u16, reason: impl Into<String>) -> Self {
        Self::Response(ResponseEnvelope {
            response: true,
            id,
            ok: false,
            data: None,
            error_code: Some(code),
            error_reason: Some(reason.into()),
        })
    }

    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        Self::Notification(NotificationEnvelope {
            notification: true,
            method: method.into(),
            data: Some(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_round_trips() {
        let text = r#"{"request":true,"id":7,"method":"join","data":{"displayName":"ann"}}"#;
        match serde_json::from_str(text).unwrap() {
            Envelope::Request(req) => {
                assert_eq!(req.id, 7);
                assert_eq!(req.method, "join");
                assert_eq!(req.data.unwrap()["displayName"], "ann");
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn response_without_data_parses_as_response() {
        let text = r#"{"response":true,"id":3,"ok":false,"errorCode":404,"errorReason":"gone"}"#;
        match serde_json::from_str(text).unwrap() {
            Envelope::Response(res) => {
                assert!(!res.ok);
                assert_eq!(res.error_code, Some(404));
                assert_eq!(res.error_reason.as_deref(), Some("gone"));
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn notification_serializes_with_marker() {
        let env = Envelope::notification("peerClosed", json!({"peerId": "p1"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["notification"], true);
        assert_eq!(value["method"], "peerClosed");
        assert!(value.get("id").is_none());
    }
}
