//! DAP envelopes.
//!
//! Every message is `{seq, type, ...}`. Requests add `command` and
//! `arguments`; responses add `request_seq`, `success`, `command`, and an
//! optional `message`/`body`; events add `event` and `body`.

use serde::Serialize;
use serde_json::Value;

use qalam_rpc::{RequestId, RpcError};

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub seq: RequestId,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(seq: RequestId, command: &'a str, arguments: Option<Value>) -> Self {
        Self {
            seq,
            r#type: "request",
            command,
            arguments,
        }
    }
}

/// Our answer to a request the adapter sent us.
#[derive(Debug, Serialize)]
pub(crate) struct Response<'a> {
    pub seq: RequestId,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<'a> Response<'a> {
    pub fn unsupported(seq: RequestId, request_seq: i64, command: &'a str) -> Self {
        Self {
            seq,
            r#type: "response",
            request_seq,
            success: false,
            command,
            message: Some(format!("'{command}' is not supported by this client")),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        request_seq: RequestId,
        body: Value,
    },
    Event {
        event: String,
        body: Option<Value>,
    },
    Request {
        seq: i64,
        command: String,
    },
}

pub(crate) fn parse_incoming(mut frame: Value) -> Option<Incoming> {
    match frame.get("type").and_then(Value::as_str)? {
        "response" => Some(Incoming::Response {
            request_seq: frame.get("request_seq")?.as_u64()?,
            body: frame,
        }),
        "event" => Some(Incoming::Event {
            event: frame.get("event")?.as_str()?.to_string(),
            body: frame.get_mut("body").map(Value::take),
        }),
        "request" => Some(Incoming::Request {
            seq: frame.get("seq")?.as_i64()?,
            command: frame.get("command")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

/// Turn a response envelope into the caller's result.
pub(crate) fn response_result(command: &str, mut frame: Value) -> Result<Value, RpcError> {
    let success = frame
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if success {
        return Ok(frame.get_mut("body").map(Value::take).unwrap_or(Value::Null));
    }

    // Adapters put the human-readable text either in `message` or in
    // `body.error.format`.
    let message = frame
        .get("body")
        .and_then(|b| b.get("error"))
        .and_then(|e| e.get("format"))
        .and_then(Value::as_str)
        .or_else(|| frame.get("message").and_then(Value::as_str))
        .unwrap_or("request failed")
        .to_string();
    let code = frame
        .get("body")
        .and_then(|b| b.get("error"))
        .and_then(|e| e.get("id"))
        .and_then(Value::as_i64);
    Err(RpcError::Remote {
        method: command.to_string(),
        code,
        message,
    })
}

pub(crate) fn initialize_arguments(adapter_id: &str) -> Value {
    serde_json::json!({
        "clientID": "qalam",
        "clientName": "Qalam",
        "adapterID": adapter_id,
        "locale": "ar",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "pathFormat": "path",
        "supportsVariableType": true,
        "supportsRunInTerminalRequest": false
    })
}
