//! JSON-RPC 2.0 envelopes and the LSP payloads the client reads or writes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use qalam_rpc::{RequestId, RpcError};

use crate::types::{Diagnostic, DiagnosticSeverity, Location};

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: RequestId, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A decoded frame, classified by shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: RequestId,
        body: Value,
    },
    ServerRequest {
        id: Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub(crate) fn parse_incoming(frame: Value) -> Option<Incoming> {
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (frame.get("id"), method, has_result_or_error) {
        (Some(id), None, true) => Some(Incoming::Response {
            id: id.as_u64()?,
            body: frame,
        }),
        (Some(id), Some(method), _) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method,
        }),
        (None, Some(method), _) => {
            let params = frame.get("params").cloned();
            Some(Incoming::Notification { method, params })
        }
        _ => None,
    }
}

/// Turn a response frame into the caller's result.
pub(crate) fn response_result(method: &str, mut body: Value) -> Result<Value, RpcError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::Remote {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}

pub(crate) fn method_not_found(id: Value, method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

pub(crate) fn initialize_params(root_uri: &str) -> Value {
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "qalam",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"]
                },
                "definition": {
                    "linkSupport": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            },
            "window": {
                "showMessage": {}
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_position_params(uri: &str, line: u32, character: u32) -> Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
            self.source
                .clone()
                .unwrap_or_else(|| String::from("unknown")),
        )
    }
}

/// `window/logMessage` and `window/showMessage` params.
#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub level: u64,
    pub message: String,
}

/// Flatten the several shapes `Hover.contents` may take into plain text.
pub(crate) fn hover_text(result: &Value) -> Option<String> {
    fn piece(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj.get("value").and_then(Value::as_str).map(String::from),
            _ => None,
        }
    }

    let contents = result.get("contents")?;
    let text = match contents {
        Value::Array(items) => items
            .iter()
            .filter_map(piece)
            .collect::<Vec<_>>()
            .join("\n\n"),
        other => piece(other)?,
    };
    (!text.trim().is_empty()).then_some(text)
}

/// Parse a `textDocument/definition` result (`Location | Location[] | null`).
pub(crate) fn parse_locations(result: &Value) -> Vec<Location> {
    fn one(value: &Value) -> Option<Location> {
        let path = file_uri_to_path(value.get("uri")?.as_str()?)?;
        let start = value.get("range")?.get("start")?;
        Some(Location::new(
            path,
            u32::try_from(start.get("line")?.as_u64()?).ok()?,
            u32::try_from(start.get("character")?.as_u64()?).ok()?,
        ))
    }

    match result {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        Value::Null => Vec::new(),
        other => one(other).into_iter().collect(),
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_has_required_fields() {
        let params = initialize_params("file:///workspace");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["clientInfo"]["name"], "qalam");
        assert!(params["capabilities"]["textDocument"]["publishDiagnostics"].is_object());
    }

    #[test]
    fn test_did_change_params() {
        let params = did_change_params("file:///test.trq", 2, "اطبع ١");
        assert_eq!(params["textDocument"]["version"], 2);
        assert_eq!(params["contentChanges"][0]["text"], "اطبع ١");
    }

    #[test]
    fn test_parse_incoming_classifies_frames() {
        let response = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": null});
        assert!(matches!(
            parse_incoming(response),
            Some(Incoming::Response { id: 3, .. })
        ));

        let request = serde_json::json!({"jsonrpc": "2.0", "id": "a", "method": "workspace/configuration"});
        assert!(matches!(
            parse_incoming(request),
            Some(Incoming::ServerRequest { .. })
        ));

        let notification = serde_json::json!({"jsonrpc": "2.0", "method": "window/logMessage"});
        assert!(matches!(
            parse_incoming(notification),
            Some(Incoming::Notification { .. })
        ));

        assert!(parse_incoming(serde_json::json!({"jsonrpc": "2.0"})).is_none());
    }

    #[test]
    fn test_response_with_string_id_is_not_ours() {
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": "x", "result": {}});
        assert!(parse_incoming(frame).is_none());
    }

    #[test]
    fn test_response_result_success_and_error() {
        let ok = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}});
        assert!(response_result("initialize", ok).unwrap()["capabilities"].is_object());

        let missing = serde_json::json!({"jsonrpc": "2.0", "id": 1});
        assert_eq!(response_result("shutdown", missing).unwrap(), Value::Null);

        let err = serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32600, "message": "invalid request"}
        });
        assert_eq!(
            response_result("textDocument/hover", err).unwrap_err(),
            RpcError::Remote {
                method: "textDocument/hover".to_string(),
                code: Some(-32600),
                message: "invalid request".to_string(),
            }
        );
    }

    #[test]
    fn test_method_not_found_reply() {
        let reply = method_not_found(serde_json::json!(5), "client/registerCapability");
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("client/registerCapability")
        );
    }

    #[test]
    fn test_lsp_diagnostic_conversion() {
        let lsp_diag = LspDiagnostic {
            range: LspRange {
                start: LspPosition {
                    line: 10,
                    character: 5,
                },
            },
            severity: Some(1),
            source: Some("tarqeem".to_string()),
            message: "متغير غير معرف".to_string(),
        };

        let diag = lsp_diag.to_diagnostic();
        assert_eq!(diag.severity(), DiagnosticSeverity::Error);
        assert_eq!(diag.line(), 10);
        assert_eq!(diag.col(), 5);
        assert_eq!(diag.source(), "tarqeem");
    }

    #[test]
    fn test_publish_diagnostics_no_severity() {
        let json = serde_json::json!({
            "uri": "file:///test.trq",
            "diagnostics": [{
                "range": { "start": { "line": 5, "character": 3 }, "end": { "line": 5, "character": 10 } },
                "message": "some warning"
            }]
        });
        let params: PublishDiagnosticsParams = serde_json::from_value(json).unwrap();
        let diag = params.diagnostics[0].to_diagnostic();
        assert_eq!(diag.severity(), DiagnosticSeverity::Warning);
        assert_eq!(diag.source(), "unknown");
    }

    #[test]
    fn test_hover_text_shapes() {
        let markup = serde_json::json!({"contents": {"kind": "markdown", "value": "**عدد**"}});
        assert_eq!(hover_text(&markup).as_deref(), Some("**عدد**"));

        let plain = serde_json::json!({"contents": "نص"});
        assert_eq!(hover_text(&plain).as_deref(), Some("نص"));

        let array = serde_json::json!({"contents": ["a", {"language": "x", "value": "b"}]});
        assert_eq!(hover_text(&array).as_deref(), Some("a\n\nb"));

        assert_eq!(hover_text(&serde_json::json!({"contents": ""})), None);
        assert_eq!(hover_text(&Value::Null), None);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_parse_locations() {
        let single = serde_json::json!({
            "uri": "file:///ws/main.trq",
            "range": {"start": {"line": 3, "character": 4}, "end": {"line": 3, "character": 9}}
        });
        let locations = parse_locations(&single);
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].path(), Path::new("/ws/main.trq"));
        assert_eq!((locations[0].line(), locations[0].character()), (3, 4));

        let many = Value::Array(vec![single.clone(), single]);
        assert_eq!(parse_locations(&many).len(), 2);
        assert!(parse_locations(&Value::Null).is_empty());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_file_uri_round_trip_escapes_arabic_names() {
        let path = PathBuf::from("/ws/مصدر/رئيسي.trq");
        let uri = path_to_file_uri(&path).unwrap();
        assert!(uri.as_str().starts_with("file:///ws/"));
        assert!(uri.as_str().is_ascii());
        assert_eq!(file_uri_to_path(uri.as_str()), Some(path));
    }

    #[test]
    fn test_only_file_uris_map_to_paths() {
        assert_eq!(file_uri_to_path("untitled:Untitled-1"), None);
        assert_eq!(file_uri_to_path("::"), None);
    }

    #[test]
    fn test_envelopes() {
        let shutdown = serde_json::to_value(Request::new(7, "shutdown", None)).unwrap();
        assert_eq!(
            shutdown,
            serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "shutdown"})
        );

        let exit = serde_json::to_value(Notification::new("exit", None)).unwrap();
        assert_eq!(exit, serde_json::json!({"jsonrpc": "2.0", "method": "exit"}));
    }
}
