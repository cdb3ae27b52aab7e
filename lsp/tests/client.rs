//! End-to-end tests of `LspClient` against a scripted in-memory server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use qalam_lsp::{DiagnosticSeverity, LspClient, LspEvent, ServerConfig};
use qalam_rpc::{
    LengthPrefixedDecoder, ProcessSupervisor, RemoteEnd, RpcError, SessionState, StopReason,
    encode_frame,
};

/// The client's side of the conversation, as seen by the fake server.
struct FakeServer {
    remote: RemoteEnd,
    decoder: LengthPrefixedDecoder,
}

impl FakeServer {
    async fn recv(&mut self) -> Value {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return frame.expect("client sent a malformed frame");
            }
            let chunk = self
                .remote
                .recv_written()
                .await
                .expect("client closed stdin");
            self.decoder.extend(&chunk);
        }
    }

    async fn send(&self, message: Value) {
        self.remote
            .send_stdout(encode_frame(&message).unwrap())
            .await;
    }

    async fn reply(&self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }
}

fn workspace_root() -> PathBuf {
    std::env::current_dir().unwrap()
}

fn file_uri(path: &Path) -> String {
    url::Url::from_file_path(path).unwrap().to_string()
}

/// Start a client and walk it through the handshake.
async fn started(capabilities: Value) -> (Arc<LspClient>, FakeServer) {
    let client = Arc::new(LspClient::new(ServerConfig::default()));
    let (process, events, remote) = ProcessSupervisor::in_memory("fake-lsp");
    let mut server = FakeServer {
        remote,
        decoder: LengthPrefixedDecoder::new(),
    };

    let starting = tokio::spawn({
        let client = Arc::clone(&client);
        async move {
            client
                .start_with_process(&workspace_root(), process, events)
                .await
        }
    });

    let init = server.recv().await;
    assert_eq!(init["method"], "initialize");
    assert_eq!(init["params"]["clientInfo"]["name"], "qalam");
    server
        .reply(&init["id"], json!({"capabilities": capabilities}))
        .await;

    let initialized = server.recv().await;
    assert_eq!(initialized["method"], "initialized");
    assert!(initialized.get("id").is_none());

    let declared = starting.await.unwrap().expect("handshake should succeed");
    assert_eq!(declared, capabilities);
    (client, server)
}

#[tokio::test]
async fn handshake_stores_capabilities_and_becomes_ready() {
    let (client, _server) = started(json!({"hoverProvider": true, "definitionProvider": false})).await;

    assert!(client.is_running());
    assert_eq!(client.state(), SessionState::Ready);
    assert!(client.supports("hoverProvider"));
    assert!(!client.supports("definitionProvider"));
    assert!(!client.supports("renameProvider"));
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let (client, _server) = started(json!({})).await;
    let (process, events, _remote) = ProcessSupervisor::in_memory("second");

    let err = client
        .start_with_process(&workspace_root(), process, events)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::AlreadyStarted);
}

#[tokio::test]
async fn responses_out_of_order_reach_their_own_callers() {
    let (client, mut server) = started(json!({})).await;

    let a = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request("custom/a", Some(json!({"n": 1}))).await }
    });
    let first = server.recv().await;
    let b = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request("custom/b", Some(json!({"n": 2}))).await }
    });
    let second = server.recv().await;
    assert_ne!(first["id"], second["id"]);

    server.reply(&second["id"], json!(second["method"])).await;
    server.reply(&first["id"], json!(first["method"])).await;

    assert_eq!(a.await.unwrap().unwrap(), json!("custom/a"));
    assert_eq!(b.await.unwrap().unwrap(), json!("custom/b"));
}

#[tokio::test]
async fn error_response_carries_remote_message() {
    let (client, mut server) = started(json!({})).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request("custom/fails", None).await }
    });
    let req = server.recv().await;
    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "error": {"code": -32603, "message": "انهار المحلل"}
        }))
        .await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        RpcError::Remote {
            method: "custom/fails".to_string(),
            code: Some(-32603),
            message: "انهار المحلل".to_string(),
        }
    );
    assert!(client.is_running(), "a failed request leaves the session up");
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_and_late_reply_is_ignored() {
    let (client, mut server) = started(json!({})).await;

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request("custom/slow", None).await }
    });
    let req = server.recv().await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        RpcError::Timeout {
            method: "custom/slow".to_string()
        }
    );

    server.reply(&req["id"], json!("too late")).await;
    tokio::task::yield_now().await;
    assert!(client.is_running());
}

#[tokio::test]
async fn diagnostics_are_stored_and_published() {
    let (client, server) = started(json!({})).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = client.on_diagnostics({
        let seen = Arc::clone(&seen);
        move |path, items| seen.lock().unwrap().push((path.to_path_buf(), items.len()))
    });

    let path = workspace_root().join("main.trq");
    server
        .send(json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": file_uri(&path),
                "diagnostics": [{
                    "range": {"start": {"line": 2, "character": 4}, "end": {"line": 2, "character": 9}},
                    "severity": 1,
                    "source": "tarqeem",
                    "message": "متغير غير معرف"
                }]
            }
        }))
        .await;

    let snapshot = loop {
        let snapshot = client.diagnostics_snapshot();
        if !snapshot.is_empty() {
            break snapshot;
        }
        tokio::task::yield_now().await;
    };
    let items = snapshot.for_path(&path).expect("diagnostics for main.trq");
    assert_eq!(items[0].severity(), DiagnosticSeverity::Error);
    assert_eq!((items[0].line(), items[0].col()), (2, 4));
    assert_eq!(seen.lock().unwrap().as_slice(), &[(path, 1)]);
}

#[tokio::test]
async fn server_requests_get_method_not_found() {
    let (_client, mut server) = started(json!({})).await;

    server
        .send(json!({
            "jsonrpc": "2.0",
            "id": "cfg-1",
            "method": "workspace/configuration",
            "params": {"items": []}
        }))
        .await;

    let reply = server.recv().await;
    assert_eq!(reply["id"], "cfg-1");
    assert_eq!(reply["error"]["code"], -32601);
}

#[tokio::test]
async fn log_messages_and_unknown_notifications_reach_subscribers() {
    let (client, server) = started(json!({})).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let _logs = client.on_log({
        let log = Arc::clone(&log);
        move |_, message| log.lock().unwrap().push(message.to_string())
    });
    let _all = client.on_event({
        let log = Arc::clone(&log);
        move |event| {
            if let LspEvent::Notification { method, .. } = event {
                log.lock().unwrap().push(method.clone());
            }
        }
    });

    server
        .send(json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 3, "message": "جاهز"}}))
        .await;
    server
        .send(json!({"jsonrpc": "2.0", "method": "$/progress", "params": {"token": 1}}))
        .await;

    while log.lock().unwrap().len() < 2 {
        tokio::task::yield_now().await;
    }
    assert_eq!(log.lock().unwrap().as_slice(), &["جاهز", "$/progress"]);
}

#[tokio::test]
async fn did_change_opens_then_bumps_version() {
    let (client, mut server) = started(json!({})).await;
    let path = workspace_root().join("doc.trq");

    client.did_change(&path, "اطبع ١").await.unwrap();
    let open = server.recv().await;
    assert_eq!(open["method"], "textDocument/didOpen");
    assert_eq!(open["params"]["textDocument"]["version"], 1);
    assert_eq!(open["params"]["textDocument"]["languageId"], "tarqeem");

    client.did_change(&path, "اطبع ٢").await.unwrap();
    let change = server.recv().await;
    assert_eq!(change["method"], "textDocument/didChange");
    assert_eq!(change["params"]["textDocument"]["version"], 2);
    assert_eq!(change["params"]["contentChanges"][0]["text"], "اطبع ٢");

    client.did_close(&path).await.unwrap();
    let close = server.recv().await;
    assert_eq!(close["method"], "textDocument/didClose");
}

#[tokio::test]
async fn hover_flattens_markup() {
    let (client, mut server) = started(json!({"hoverProvider": true})).await;
    let path = workspace_root().join("doc.trq");

    let hover = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.hover(&path, 0, 3).await }
    });
    let req = server.recv().await;
    assert_eq!(req["method"], "textDocument/hover");
    assert_eq!(req["params"]["position"]["character"], 3);
    server
        .reply(
            &req["id"],
            json!({"contents": {"kind": "markdown", "value": "دالة `اطبع`"}}),
        )
        .await;

    assert_eq!(
        hover.await.unwrap().unwrap().as_deref(),
        Some("دالة `اطبع`")
    );
}

#[tokio::test]
async fn process_exit_rejects_pending_and_stops_session() {
    let (client, mut server) = started(json!({})).await;
    let stops = Arc::new(Mutex::new(Vec::new()));
    let _sub = client.on_stopped({
        let stops = Arc::clone(&stops);
        move |reason| stops.lock().unwrap().push(reason.clone())
    });

    let call = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request("custom/pending", None).await }
    });
    let _ = server.recv().await;
    server.remote.exit(Some(3)).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::SessionStopped { .. }), "{err:?}");
    assert_eq!(client.state(), SessionState::Stopped);
    assert!(client.capabilities().is_none());
    assert_eq!(stops.lock().unwrap().as_slice(), &[StopReason::Exited(Some(3))]);
    assert_eq!(
        client.request("custom/after", None).await.unwrap_err(),
        RpcError::NotRunning
    );
}

#[tokio::test]
async fn stop_sends_shutdown_then_exit() {
    let (client, mut server) = started(json!({})).await;

    let stopping = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.stop().await }
    });

    let shutdown = server.recv().await;
    assert_eq!(shutdown["method"], "shutdown");
    server.reply(&shutdown["id"], Value::Null).await;

    let exit = server.recv().await;
    assert_eq!(exit["method"], "exit");
    assert!(exit.get("id").is_none());

    stopping.await.unwrap();
    assert_eq!(client.state(), SessionState::Stopped);
    assert!(server.remote.recv_written().await.is_none());
}

#[tokio::test]
async fn handshake_error_stops_session() {
    let client = LspClient::new(ServerConfig::default());
    let (process, events, remote) = ProcessSupervisor::in_memory("broken-lsp");
    let mut server = FakeServer {
        remote,
        decoder: LengthPrefixedDecoder::new(),
    };

    let root = workspace_root();
    let (result, ()) = tokio::join!(
        client.start_with_process(&root, process, events),
        async {
            let init = server.recv().await;
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": init["id"],
                    "error": {"code": -32002, "message": "not ready"}
                }))
                .await;
        }
    );

    assert!(matches!(result, Err(RpcError::Handshake(_))), "{result:?}");
    assert_eq!(client.state(), SessionState::Stopped);
}

#[tokio::test]
async fn missing_executable_fails_start() {
    let client = LspClient::new(ServerConfig {
        command: "qalam-test-no-such-language-server".to_string(),
        ..ServerConfig::default()
    });

    let err = client.start(&workspace_root()).await.unwrap_err();
    assert!(matches!(err, RpcError::Spawn(_)), "{err:?}");
    assert_eq!(client.state(), SessionState::Stopped);
}
