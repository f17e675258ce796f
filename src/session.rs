//! One editor session: a client transport, an exclusive workspace, and a
//! language-server child process, glued together by a message router.
//!
//! The session mirrors client-declared document state onto disk (the language
//! server reads workspace files), forwards LSP traffic in both directions, and
//! tears everything down exactly once no matter which path triggers it.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::doc_sync;
use crate::error::{codes, GatewayError, Result};
use crate::language::{self, Language};
use crate::registry::SessionRegistry;
use crate::rpc::{self, MessageKind};
use crate::supervisor::Supervisor;

/// Outbound traffic to the client transport.
#[derive(Debug)]
pub enum ClientEvent {
    /// A JSON-RPC message to deliver as one text frame.
    Message(String),
    /// The session is gone; the transport should close.
    Close,
}

/// Percent-encoding set for `file://` URI paths: everything but unreserved
/// characters and the path separator.
const URI_PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

pub fn uri_for_path(path: &Path) -> String {
    let raw = path.display().to_string();
    format!("file://{}", utf8_percent_encode(&raw, URI_PATH_SET))
}

pub struct Session {
    id: String,
    language: Language,
    workspace_dir: PathBuf,
    config: Arc<Config>,
    client_tx: mpsc::UnboundedSender<ClientEvent>,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
    /// Client-declared open documents. The lock also serializes workspace
    /// file mutation, making each mirror write atomic within the session.
    open_docs: Mutex<HashSet<String>>,
    initialized: AtomicBool,
    cleaned: AtomicBool,
    registry: Weak<SessionRegistry>,
}

impl Session {
    pub fn new(
        id: String,
        language: Language,
        workspace_dir: PathBuf,
        config: Arc<Config>,
        client_tx: mpsc::UnboundedSender<ClientEvent>,
        registry: Weak<SessionRegistry>,
    ) -> Self {
        Self {
            id,
            language,
            workspace_dir,
            config,
            client_tx,
            supervisor: Mutex::new(None),
            open_docs: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Materialize the workspace, start the language server, and run the LSP
    /// `initialize` handshake. On any failure the session is cleaned up
    /// before the error propagates.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.try_initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(session = %self.id, error = %e, "session initialization failed");
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn try_initialize(self: &Arc<Self>) -> Result<()> {
        // Stale workspace from a previous run with the same id: start fresh.
        if fs::metadata(&self.workspace_dir).await.is_ok() {
            let _ = fs::remove_dir_all(&self.workspace_dir).await;
        }
        fs::create_dir_all(&self.workspace_dir).await?;
        language::scaffold(self.language, &self.workspace_dir, &self.id).await?;

        let command = self
            .config
            .server_command(self.language, &self.workspace_dir)
            .ok_or_else(|| GatewayError::UnsupportedLanguage(self.language.tag().into()))?;
        let supervisor = Arc::new(Supervisor::new(command, self.config.shutdown_timeout));

        // Every server notification goes to the client verbatim, in emission
        // order. The sink runs on the reader task, so it only enqueues.
        let client = self.client_tx.clone();
        supervisor
            .set_notification_sink(Arc::new(move |msg| {
                if let Ok(text) = serde_json::to_string(&msg) {
                    let _ = client.send(ClientEvent::Message(text));
                }
            }))
            .await;

        supervisor.start().await?;
        *self.supervisor.lock().await = Some(Arc::clone(&supervisor));
        self.spawn_death_watch(&supervisor);

        let params = initialize_params(&self.workspace_dir, &self.id);
        let response = match supervisor
            .request("initialize", Some(params), self.config.init_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let tail = supervisor.stderr_tail().await;
                if !tail.is_empty() {
                    error!(session = %self.id, "language server stderr:\n{tail}");
                }
                return Err(GatewayError::Initialization(e.to_string()));
            }
        };
        if let Some(err) = response.get("error") {
            return Err(GatewayError::Initialization(err.to_string()));
        }

        self.send_to_client(&response);
        supervisor.notify("initialized", Some(json!({}))).await?;
        self.initialized.store(true, Ordering::Release);
        info!(session = %self.id, language = %self.language, "session initialized");

        // Warm the server with the scaffolded entry file so first-keystroke
        // completion doesn't pay the indexing latency.
        let main_path = self.workspace_dir.join(self.language.main_file());
        if let Ok(text) = fs::read_to_string(&main_path).await {
            let _ = supervisor
                .notify(
                    "textDocument/didOpen",
                    Some(json!({
                        "textDocument": {
                            "uri": uri_for_path(&main_path),
                            "languageId": self.language.language_id(),
                            "version": 1,
                            "text": text,
                        }
                    })),
                )
                .await;
        }

        Ok(())
    }

    /// Tear the session down when the language server dies underneath it.
    fn spawn_death_watch(self: &Arc<Self>, supervisor: &Arc<Supervisor>) {
        let session = Arc::clone(self);
        let mut exited = supervisor.subscribe_exit();
        tokio::spawn(async move {
            loop {
                if *exited.borrow_and_update() {
                    if !session.cleaned.load(Ordering::Acquire) {
                        warn!(session = %session.id, "language server exited unexpectedly");
                    }
                    session.cleanup().await;
                    break;
                }
                if exited.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Route one text frame from the client. A frame holding a JSON array is
    /// a batch; each element routes independently, in order.
    pub async fn handle_client_message(self: &Arc<Self>, text: &str) {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(session = %self.id, error = %e, "unparseable client frame");
                self.reply_error(Value::Null, codes::PARSE_ERROR, format!("Parse error: {e}"));
                return;
            }
        };
        match parsed {
            Value::Array(batch) => {
                for item in batch {
                    self.route(item).await;
                }
            }
            single => self.route(single).await,
        }
    }

    async fn route(self: &Arc<Self>, msg: Value) {
        if !rpc::is_jsonrpc_2(&msg) {
            self.reply_error(rpc::id_value(&msg), codes::INVALID_REQUEST, "Invalid Request");
            return;
        }

        let method_owned = rpc::method(&msg).map(str::to_owned);
        let method = method_owned.as_deref();

        if !self.initialized.load(Ordering::Acquire) && method != Some("initialize") {
            self.reply_error(
                rpc::id_value(&msg),
                codes::SERVER_NOT_INITIALIZED,
                "Server not initialized",
            );
            return;
        }

        let supervisor = self.supervisor.lock().await.clone();
        let Some(supervisor) = supervisor else {
            if rpc::request_id(&msg).is_some() {
                self.reply_error(
                    rpc::id_value(&msg),
                    codes::INTERNAL_ERROR,
                    "session is shutting down",
                );
            }
            return;
        };

        metrics::counter!("gateway_client_messages_total").increment(1);

        match method {
            Some("textDocument/didOpen") => {
                if let Err(reason) = self.mirror_did_open(&msg).await {
                    self.reply_error(rpc::id_value(&msg), codes::INVALID_PARAMS, reason);
                    return;
                }
                self.forward_notification(&supervisor, &msg).await;
            }
            Some("textDocument/didChange") => match self.mirror_did_change(&msg).await {
                Ok(uri) => {
                    self.forward_notification(&supervisor, &msg).await;
                    // JDT LS re-reads the file once told it changed on disk.
                    let nudge = rpc::notification(
                        "workspace/didChangeWatchedFiles",
                        Some(json!({"changes": [{"uri": uri, "type": 2}]})),
                    );
                    if let Err(e) = supervisor.send(&nudge).await {
                        debug!(session = %self.id, error = %e, "didChangeWatchedFiles nudge failed");
                    }
                }
                Err(reason) => {
                    self.reply_error(rpc::id_value(&msg), codes::INVALID_PARAMS, reason);
                }
            },
            Some("textDocument/didClose") => {
                self.forward_notification(&supervisor, &msg).await;
                if self.mirror_did_close(&msg).await {
                    info!(session = %self.id, "last document closed, tearing down");
                    self.cleanup().await;
                }
            }
            Some("exit") => {
                let _ = supervisor.send(&msg).await;
                self.cleanup().await;
            }
            Some("shutdown") => {
                if rpc::request_id(&msg).is_some() {
                    match supervisor
                        .forward_request(&msg, self.config.forward_timeout)
                        .await
                    {
                        Ok(response) => self.send_to_client(&response),
                        Err(e) => self.reply_error(
                            rpc::id_value(&msg),
                            codes::INTERNAL_ERROR,
                            format!("shutdown failed: {e}"),
                        ),
                    }
                } else {
                    let _ = supervisor.send(&msg).await;
                }
                self.cleanup().await;
            }
            Some(_) if rpc::classify(&msg) == MessageKind::Request => {
                self.forward_client_request(&supervisor, msg).await;
            }
            Some(_) => {
                self.forward_notification(&supervisor, &msg).await;
            }
            // No method: the client answering a server-initiated request.
            None => {
                if let Err(e) = supervisor.send(&msg).await {
                    debug!(session = %self.id, error = %e, "client response not forwarded");
                }
            }
        }
    }

    /// Forward a client request and answer it from a spawned task, so a slow
    /// server stalls neither the transport loop nor unrelated requests.
    /// The registration and write happen here, preserving client order.
    async fn forward_client_request(self: &Arc<Self>, supervisor: &Arc<Supervisor>, msg: Value) {
        let id = rpc::id_value(&msg);
        let Some(key) = rpc::request_id(&msg) else {
            self.reply_error(
                id,
                codes::INVALID_REQUEST,
                "request id must be an integer or a string",
            );
            return;
        };

        let rx = match supervisor.begin_request(&msg).await {
            Ok(rx) => rx,
            Err(e) => {
                self.reply_error(
                    id,
                    codes::INTERNAL_ERROR,
                    format!("failed to forward request: {e}"),
                );
                return;
            }
        };

        let session = Arc::clone(self);
        let supervisor = Arc::clone(supervisor);
        let deadline = self.config.forward_timeout;
        tokio::spawn(async move {
            match supervisor.await_response(&key, rx, deadline).await {
                Ok(response) => session.send_to_client(&response),
                Err(GatewayError::Timeout(_)) => {
                    warn!(session = %session.id, id = %key, "no response from language server");
                    session.reply_error(
                        id,
                        codes::INTERNAL_ERROR,
                        "No response from language server",
                    );
                }
                Err(e) => session.reply_error(
                    id,
                    codes::INTERNAL_ERROR,
                    format!("request failed: {e}"),
                ),
            }
        });
    }

    async fn forward_notification(&self, supervisor: &Supervisor, msg: &Value) {
        if let Err(e) = supervisor.send(msg).await {
            debug!(session = %self.id, error = %e, "notification not forwarded");
        }
    }

    /// Record the document as open and write its declared text to disk.
    async fn mirror_did_open(&self, msg: &Value) -> std::result::Result<(), String> {
        let params: DidOpenTextDocumentParams = parse_params(msg)?;
        let uri = params.text_document.uri.as_str().to_owned();
        let path = self.path_for_uri(&uri)?;

        let mut docs = self.open_docs.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        fs::write(&path, params.text_document.text.as_bytes())
            .await
            .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
        docs.insert(uri.clone());
        debug!(session = %self.id, %uri, "document opened");
        Ok(())
    }

    /// Apply the content changes to the mirrored file. Returns the document
    /// URI on success.
    async fn mirror_did_change(&self, msg: &Value) -> std::result::Result<String, String> {
        let params: DidChangeTextDocumentParams = parse_params(msg)?;
        let uri = params.text_document.uri.as_str().to_owned();
        let path = self.path_for_uri(&uri)?;

        let docs = self.open_docs.lock().await;
        let current = fs::read_to_string(&path).await.unwrap_or_default();
        let updated = doc_sync::apply_changes(&current, &params.content_changes)?;
        fs::write(&path, updated.as_bytes())
            .await
            .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
        drop(docs);

        debug!(session = %self.id, %uri, version = params.text_document.version, "document updated");
        Ok(uri)
    }

    /// Forget the document. Returns `true` when no documents remain open.
    async fn mirror_did_close(&self, msg: &Value) -> bool {
        let params: DidCloseTextDocumentParams = match parse_params(msg) {
            Ok(p) => p,
            Err(reason) => {
                warn!(session = %self.id, %reason, "ignoring malformed didClose");
                return false;
            }
        };
        let uri = params.text_document.uri.as_str().to_owned();
        let mut docs = self.open_docs.lock().await;
        docs.remove(&uri);
        debug!(session = %self.id, %uri, "document closed");
        docs.is_empty()
    }

    /// Resolve a `file://` URI to a path inside this session's workspace.
    fn path_for_uri(&self, uri: &str) -> std::result::Result<PathBuf, String> {
        let raw = uri
            .strip_prefix("file://")
            .ok_or_else(|| format!("unsupported URI scheme: {uri}"))?;
        let decoded = percent_decode_str(raw).decode_utf8_lossy().into_owned();
        let path = PathBuf::from(decoded);
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("URI escapes the session workspace: {uri}"));
        }
        if !path.starts_with(&self.workspace_dir) {
            return Err(format!("URI outside the session workspace: {uri}"));
        }
        Ok(path)
    }

    fn send_to_client(&self, msg: &Value) {
        match serde_json::to_string(msg) {
            Ok(text) => {
                let _ = self.client_tx.send(ClientEvent::Message(text));
            }
            Err(e) => error!(session = %self.id, error = %e, "unserializable outbound message"),
        }
    }

    fn reply_error(&self, id: Value, code: i64, message: impl Into<String>) {
        self.send_to_client(&rpc::error_response(id, code, message));
    }

    /// Release everything the session owns. Idempotent; callable from the
    /// disconnect path, the router, the death watch, and process shutdown.
    pub async fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session = %self.id, "cleaning up session");

        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }

        if let Err(e) = fs::remove_dir_all(&self.workspace_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = %self.id, error = %e, "failed to remove workspace");
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.id);
        }
        let _ = self.client_tx.send(ClientEvent::Close);
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(msg: &Value) -> std::result::Result<T, String> {
    let params = msg.get("params").cloned().unwrap_or(Value::Null);
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}

/// The gateway-originated `initialize` request body. Field shape mirrors what
/// JDT LS is known to accept, including the sync/completion/diagnostics
/// capabilities the editor relies on.
fn initialize_params(workspace_dir: &Path, session_id: &str) -> Value {
    let root_uri = uri_for_path(workspace_dir);
    json!({
        "processId": null,
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "openClose": true,
                    "change": 2,
                    "save": { "includeText": true }
                },
                "completion": {
                    "completionItem": { "snippetSupport": true }
                },
                "publishDiagnostics": { "relatedInformation": true }
            },
            "workspace": {
                "didChangeConfiguration": { "dynamicRegistration": true },
                "workspaceFolders": true
            }
        },
        "workspaceFolders": [
            { "uri": root_uri, "name": session_id }
        ]
    })
}
