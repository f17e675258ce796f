//! Scripted language server for the integration tests.
//!
//! Speaks the LSP base protocol on stdio. Behavior:
//! - `initialize` → fixed capabilities object
//! - `textDocument/completion` → canned completion list
//! - `shutdown` → null result, `exit` → exit 0
//! - `test/blackhole` → request is swallowed, no response ever
//! - `test/die` → process exits 1 immediately
//! - any other request → `{ "echo": <method> }`
//! - notifications are acknowledged with silence

use std::io::{BufRead, Read, Write};

use serde_json::{json, Value};

fn main() {
    let stdin = std::io::stdin();
    let mut reader = stdin.lock();

    while let Some(msg) = read_message(&mut reader) {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        let id = msg.get("id").cloned();

        match (method, id) {
            ("test/die", _) => std::process::exit(1),
            ("exit", _) => std::process::exit(0),
            ("test/blackhole", _) => {}
            ("initialize", Some(id)) => write_message(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "capabilities": {
                        "textDocumentSync": 2,
                        "completionProvider": { "triggerCharacters": ["."] },
                        "hoverProvider": true
                    },
                    "serverInfo": { "name": "stub-ls", "version": "0.1.0" }
                }
            })),
            ("textDocument/completion", Some(id)) => write_message(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "isIncomplete": false,
                    "items": [
                        { "label": "main", "kind": 2 },
                        { "label": "Math", "kind": 7 }
                    ]
                }
            })),
            ("shutdown", Some(id)) => write_message(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": null
            })),
            (_, Some(id)) => write_message(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "echo": method }
            })),
            // Notifications need no reply.
            (_, None) => {}
        }
    }
}

fn read_message<R: BufRead>(reader: &mut R) -> Option<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }

    let len = content_length?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn write_message(msg: &Value) {
    let body = msg.to_string();
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "Content-Length: {}\r\n\r\n{body}", body.len());
    let _ = stdout.flush();
}
