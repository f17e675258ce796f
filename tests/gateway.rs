//! End-to-end gateway tests against the scripted stub language server.
//!
//! Each test boots the real axum server on an ephemeral port, connects over a
//! real WebSocket, and drives sessions whose "language server" is the
//! `stub-ls` binary built from this crate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use codelab_lsp_gateway::config::Config;
use codelab_lsp_gateway::language::Language;
use codelab_lsp_gateway::registry::SessionRegistry;
use codelab_lsp_gateway::server::{self, AppState};
use codelab_lsp_gateway::session::uri_for_path;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_DEADLINE: Duration = Duration::from_secs(5);

fn test_config(workspace_root: &Path) -> Config {
    let stub = vec![env!("CARGO_BIN_EXE_stub-ls").to_string()];
    let mut commands = HashMap::new();
    commands.insert(Language::Java, stub.clone());
    commands.insert(Language::Python, stub);
    Config {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        workspace_root: workspace_root.to_path_buf(),
        commands,
        init_timeout: Duration::from_secs(10),
        forward_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_millis(300),
    }
}

async fn start_gateway() -> (SocketAddr, Arc<SessionRegistry>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Arc::new(test_config(dir.path()));
    let registry = Arc::new(SessionRegistry::new());
    let state = AppState {
        config,
        registry: Arc::clone(&registry),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, server::router(state))
            .await
            .expect("serve");
    });

    (addr, registry, dir)
}

async fn connect(addr: SocketAddr, id: &str, language: &str) -> Ws {
    let url = format!("ws://{addr}/ws/{id}?language={language}");
    let (ws, _) = connect_async(url).await.expect("websocket connect");
    ws
}

async fn send_json(ws: &mut Ws, msg: &Value) {
    ws.send(Message::Text(msg.to_string().into()))
        .await
        .expect("send");
}

/// Receive the next text frame as JSON, skipping control frames.
async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(RECV_DEADLINE, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
            Message::Close(_) => panic!("unexpected close frame"),
            _ => {}
        }
    }
}

/// Drive the handshake to completion: the first frame the gateway sends is
/// the forwarded `initialize` response.
async fn connect_initialized(addr: SocketAddr, id: &str) -> Ws {
    let mut ws = connect(addr, id, "java").await;
    let init = recv_json(&mut ws).await;
    assert!(
        init["result"]["capabilities"].is_object(),
        "expected initialize response, got: {init}"
    );
    ws
}

/// Wait until the socket closes (a close frame or end of stream).
async fn expect_closed(ws: &mut Ws) {
    let deadline = tokio::time::Instant::now() + RECV_DEADLINE;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("socket did not close in time");
        match timeout(remaining, ws.next()).await.expect("socket stayed open") {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(_)) => {}
        }
    }
}

async fn wait_for_removal(path: &Path) {
    for _ in 0..100 {
        if !path.exists() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("{} still exists", path.display());
}

fn completion_request(id: i64, uri: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "textDocument/completion",
        "params": {
            "textDocument": { "uri": uri },
            "position": { "line": 0, "character": 0 }
        }
    })
}

#[tokio::test]
async fn happy_path_open_complete_disconnect() {
    let (addr, _registry, dir) = start_gateway().await;
    let workspace = dir.path().join("abc");

    let mut ws = connect_initialized(addr, "abc").await;

    // The scaffold is on disk before the handshake completes.
    assert!(workspace.join("src/Main.java").exists());
    assert!(workspace.join(".project").exists());

    let main_path = workspace.join("src/Main.java");
    let uri = uri_for_path(&main_path);
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {"textDocument": {
                "uri": uri,
                "languageId": "java",
                "version": 1,
                "text": "public class Main{}"
            }}
        }),
    )
    .await;

    send_json(&mut ws, &completion_request(42, &uri)).await;
    let response = recv_json(&mut ws).await;
    assert_eq!(response["id"], json!(42));
    assert_eq!(response["result"]["items"][0]["label"], json!("main"));

    // didOpen was routed before the completion, so the mirror is committed.
    assert_eq!(
        std::fs::read_to_string(&main_path).unwrap(),
        "public class Main{}"
    );

    drop(ws);
    wait_for_removal(&workspace).await;
}

#[tokio::test]
async fn incremental_edits_are_mirrored_to_disk() {
    let (addr, _registry, dir) = start_gateway().await;
    let workspace = dir.path().join("edit");
    let mut ws = connect_initialized(addr, "edit").await;

    let path = workspace.join("src/Main.java");
    let uri = uri_for_path(&path);
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {"textDocument": {
                "uri": uri, "languageId": "java", "version": 1,
                "text": "public class Main {}\n"
            }}
        }),
    )
    .await;
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didChange",
            "params": {
                "textDocument": {"uri": uri, "version": 2},
                "contentChanges": [{
                    "range": {
                        "start": {"line": 0, "character": 13},
                        "end": {"line": 0, "character": 17}
                    },
                    "text": "Demo"
                }]
            }
        }),
    )
    .await;

    // A request behind the notifications acts as a barrier.
    send_json(&mut ws, &completion_request(1, &uri)).await;
    recv_json(&mut ws).await;

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "public class Demo {}\n"
    );
}

#[tokio::test]
async fn malformed_json_is_answered_and_session_survives() {
    let (addr, _registry, dir) = start_gateway().await;
    let mut ws = connect_initialized(addr, "bad-json").await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["id"], json!(null));
    assert_eq!(reply["error"]["code"], json!(-32700));

    // The session still works.
    let uri = uri_for_path(&dir.path().join("bad-json/src/Main.java"));
    send_json(&mut ws, &completion_request(3, &uri)).await;
    assert_eq!(recv_json(&mut ws).await["id"], json!(3));
}

#[tokio::test]
async fn unanswered_request_times_out_with_internal_error() {
    let (addr, _registry, _dir) = start_gateway().await;
    let mut ws = connect_initialized(addr, "timeout").await;

    send_json(
        &mut ws,
        &json!({"jsonrpc": "2.0", "id": 9, "method": "test/blackhole", "params": {}}),
    )
    .await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["id"], json!(9));
    assert_eq!(reply["error"]["code"], json!(-32603));

    // Timing out one request must not poison the next.
    send_json(
        &mut ws,
        &json!({"jsonrpc": "2.0", "id": 10, "method": "test/echo"}),
    )
    .await;
    let next = recv_json(&mut ws).await;
    assert_eq!(next["id"], json!(10));
    assert_eq!(next["result"]["echo"], json!("test/echo"));
}

#[tokio::test]
async fn server_death_closes_transport_and_removes_workspace() {
    let (addr, registry, dir) = start_gateway().await;
    let workspace = dir.path().join("doomed");
    let mut ws = connect_initialized(addr, "doomed").await;
    assert_eq!(registry.count(), 1);

    send_json(
        &mut ws,
        &json!({"jsonrpc": "2.0", "method": "test/die"}),
    )
    .await;

    expect_closed(&mut ws).await;
    wait_for_removal(&workspace).await;
    for _ in 0..100 {
        if registry.count() == 0 {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn sessions_are_isolated_from_each_other() {
    let (addr, _registry, dir) = start_gateway().await;
    let mut ws_a = connect_initialized(addr, "tenant-a").await;
    let mut ws_b = connect_initialized(addr, "tenant-b").await;

    let uri_a = uri_for_path(&dir.path().join("tenant-a/src/Main.java"));
    send_json(&mut ws_a, &completion_request(1, &uri_a)).await;
    assert_eq!(recv_json(&mut ws_a).await["id"], json!(1));

    // Nothing from a's traffic leaks onto b.
    let leaked = timeout(Duration::from_millis(300), ws_b.next()).await;
    assert!(leaked.is_err(), "session b received unexpected traffic");

    // After a disconnects, b keeps working.
    drop(ws_a);
    wait_for_removal(&dir.path().join("tenant-a")).await;

    let uri_b = uri_for_path(&dir.path().join("tenant-b/src/Main.java"));
    send_json(&mut ws_b, &completion_request(2, &uri_b)).await;
    assert_eq!(recv_json(&mut ws_b).await["id"], json!(2));
    assert!(dir.path().join("tenant-b").exists());
}

#[tokio::test]
async fn duplicate_session_ids_are_refused() {
    let (addr, registry, _dir) = start_gateway().await;
    let mut first = connect_initialized(addr, "dup").await;
    let mut second = connect(addr, "dup", "java").await;

    expect_closed(&mut second).await;
    assert_eq!(registry.count(), 1);

    // The original connection is unaffected.
    send_json(
        &mut first,
        &json!({"jsonrpc": "2.0", "id": 5, "method": "test/echo"}),
    )
    .await;
    assert_eq!(recv_json(&mut first).await["id"], json!(5));
}

#[tokio::test]
async fn closing_the_last_document_tears_the_session_down() {
    let (addr, _registry, dir) = start_gateway().await;
    let workspace = dir.path().join("last-doc");
    let mut ws = connect_initialized(addr, "last-doc").await;

    let uri = uri_for_path(&workspace.join("src/Main.java"));
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {"textDocument": {
                "uri": uri, "languageId": "java", "version": 1, "text": "class A{}"
            }}
        }),
    )
    .await;
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didClose",
            "params": {"textDocument": {"uri": uri}}
        }),
    )
    .await;

    expect_closed(&mut ws).await;
    wait_for_removal(&workspace).await;
}

#[tokio::test]
async fn unsupported_language_is_rejected_at_upgrade() {
    let (addr, registry, _dir) = start_gateway().await;
    let url = format!("ws://{addr}/ws/nope?language=cobol");
    assert!(connect_async(url).await.is_err());
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn traversal_shaped_interview_ids_are_rejected() {
    let (addr, registry, _dir) = start_gateway().await;
    let url = format!("ws://{addr}/ws/%2e%2e?language=java");
    assert!(connect_async(url).await.is_err());
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn health_endpoint_reports_connection_count() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (addr, _registry, _dir) = start_gateway().await;
    let _ws = connect_initialized(addr, "counted").await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();
    let mut body = String::new();
    conn.read_to_string(&mut body).await.unwrap();

    assert!(body.contains("200 OK"), "got: {body}");
    assert!(body.contains(r#""status":"healthy""#), "got: {body}");
    assert!(body.contains(r#""connections":1"#), "got: {body}");
}
