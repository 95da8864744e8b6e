//! SignalR JSON hub protocol framing.
//!
//! Every record is a JSON object terminated by U+001E; one WebSocket text
//! frame may carry several records.

use serde::Deserialize;
use serde_json::{Value, json};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Streaming and ack messages; the worker never requests them.
    Other(u8),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: Option<String>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    result: Option<Value>,
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

#[derive(Debug, Deserialize)]
pub struct HandshakeResponse {
    pub error: Option<String>,
}

/// Splits a text frame into its records.
pub fn records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|r| !r.trim().is_empty())
}

/// Decodes one record.
///
/// # Errors
///
/// Returns an error if the record is not a valid hub message.
pub fn decode(record: &str) -> Result<HubMessage, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(record)?;
    Ok(match raw.kind {
        INVOCATION => HubMessage::Invocation {
            invocation_id: raw.invocation_id,
            target: raw.target.unwrap_or_default(),
            arguments: raw.arguments,
        },
        COMPLETION => HubMessage::Completion {
            invocation_id: raw.invocation_id.unwrap_or_default(),
            result: raw.result,
            error: raw.error,
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect,
        },
        other => HubMessage::Other(other),
    })
}

/// Decodes the handshake response record.
///
/// # Errors
///
/// Returns an error if the record is not valid JSON.
pub fn decode_handshake(record: &str) -> Result<HandshakeResponse, serde_json::Error> {
    serde_json::from_str(record)
}

#[must_use]
pub fn handshake_request() -> String {
    frame(&json!({ "protocol": "json", "version": 1 }))
}

#[must_use]
pub fn invocation(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    frame(&json!({
        "type": INVOCATION,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    }))
}

#[must_use]
pub fn ping() -> String {
    frame(&json!({ "type": PING }))
}

fn frame(value: &Value) -> String {
    let mut out = value.to_string();
    out.push(RECORD_SEPARATOR);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frames_with_several_records() {
        let frame = "{\"type\":6}\u{1e}{\"type\":6}\u{1e}";
        assert_eq!(records(frame).count(), 2);
    }

    #[test]
    fn decodes_deploy_invocation() {
        let msg = decode(
            r#"{"type":1,"target":"NewDeploy","arguments":[{"env":"prod","target":"api"}]}"#,
        )
        .unwrap();
        match msg {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                assert!(invocation_id.is_none());
                assert_eq!(target, "NewDeploy");
                assert_eq!(arguments.len(), 1);
                assert_eq!(arguments[0]["env"], "prod");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_completion_with_error() {
        let msg = decode(r#"{"type":3,"invocationId":"4","error":"denied"}"#).unwrap();
        assert_eq!(
            msg,
            HubMessage::Completion {
                invocation_id: "4".to_string(),
                result: None,
                error: Some("denied".to_string()),
            }
        );
    }

    #[test]
    fn decodes_close_and_ping() {
        assert_eq!(decode(r#"{"type":6}"#).unwrap(), HubMessage::Ping);
        assert_eq!(
            decode(r#"{"type":7,"allowReconnect":true}"#).unwrap(),
            HubMessage::Close {
                error: None,
                allow_reconnect: true,
            }
        );
        assert_eq!(
            decode(r#"{"type":7,"error":"bye"}"#).unwrap(),
            HubMessage::Close {
                error: Some("bye".to_string()),
                allow_reconnect: false,
            }
        );
    }

    #[test]
    fn unknown_types_are_tolerated() {
        assert_eq!(decode(r#"{"type":2,"invocationId":"1","item":1}"#).unwrap(), HubMessage::Other(2));
    }

    #[test]
    fn encodes_join_invocation() {
        let text = invocation("1", "JoinGroup", &[Value::from("web")]);
        assert!(text.ends_with(RECORD_SEPARATOR));
        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "1");
        assert_eq!(value["target"], "JoinGroup");
        assert_eq!(value["arguments"][0], "web");
    }

    #[test]
    fn handshake_request_is_json_v1() {
        let text = handshake_request();
        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["protocol"], "json");
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn empty_handshake_response_is_success() {
        assert!(decode_handshake("{}").unwrap().error.is_none());
    }
}
