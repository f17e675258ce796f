//! Language-server child process supervisor.
//!
//! Spawns the server command with piped stdio and speaks the LSP base
//! protocol over it. Inbound stdout bytes run through the incremental
//! [`FrameDecoder`]; decoded messages are demultiplexed by request id into
//! one-shot completion handles, with unmatched method-bearing messages handed
//! to the notification sink.
//!
//! Correctness hinges on two disciplines:
//! - a pending entry is registered **before** the request bytes hit stdin, so
//!   a fast reply cannot race the registration;
//! - a response is delivered to exactly the caller that registered its id —
//!   unmatched messages are forwarded to the sink or dropped with a log line,
//!   never re-queued.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{self, FrameDecoder};
use crate::error::{GatewayError, Result};
use crate::rpc::{self, RequestKey};

/// Grace period after spawn before checking for an immediate exit.
const SPAWN_GRACE: Duration = Duration::from_millis(200);

/// How long `stop` waits for a natural exit before sending SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Lines of child stderr retained for startup diagnostics.
const STDERR_TAIL_LINES: usize = 100;

/// Callback invoked from the reader task for server-initiated traffic.
/// Must not block.
pub type NotificationSink = Arc<dyn Fn(Value) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<RequestKey, oneshot::Sender<Value>>>>;
type SinkSlot = Arc<Mutex<Option<NotificationSink>>>;
type StderrTail = Arc<Mutex<VecDeque<String>>>;

pub struct Supervisor {
    command: Vec<String>,
    shutdown_timeout: Duration,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    next_id: AtomicI64,
    pending: PendingMap,
    sink: SinkSlot,
    running: Arc<AtomicBool>,
    /// Flipped to `true` once the stdout reader exits; observers use
    /// [`subscribe_exit`](Self::subscribe_exit) to react to server death.
    exited_tx: watch::Sender<bool>,
    stderr_tail: StderrTail,
}

impl Supervisor {
    pub fn new(command: Vec<String>, shutdown_timeout: Duration) -> Self {
        let (exited_tx, _) = watch::channel(false);
        Self {
            command,
            shutdown_timeout,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            next_id: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            exited_tx,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Install the sink for server-initiated requests and notifications.
    /// Call before [`start`](Self::start) so no early message is dropped.
    pub async fn set_notification_sink(&self, sink: NotificationSink) {
        *self.sink.lock().await = Some(sink);
    }

    pub fn alive(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Watch channel that becomes `true` when the server's stdout closes.
    pub fn subscribe_exit(&self) -> watch::Receiver<bool> {
        self.exited_tx.subscribe()
    }

    /// Spawn the child and start the stdout/stderr reader tasks.
    ///
    /// Fails with [`GatewayError::Startup`] when the command cannot be
    /// spawned or the process exits within the grace period; in the latter
    /// case the captured stderr tail is included in the error.
    pub async fn start(&self) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| GatewayError::Startup("empty server command".into()))?;

        info!(command = %self.command.join(" "), "starting language server");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Startup(format!("failed to spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Startup("child has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Startup("child has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Startup("child has no stderr".into()))?;

        tokio::spawn(stderr_loop(stderr, Arc::clone(&self.stderr_tail)));

        tokio::time::sleep(SPAWN_GRACE).await;
        if let Some(status) = child
            .try_wait()
            .map_err(|e| GatewayError::Startup(format!("cannot poll child: {e}")))?
        {
            let tail = self.stderr_tail().await;
            return Err(GatewayError::Startup(format!(
                "language server exited immediately with {status}: {tail}"
            )));
        }

        self.running.store(true, Ordering::Release);
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        tokio::spawn(reader_loop(
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.sink),
            Arc::clone(&self.running),
            self.exited_tx.clone(),
        ));

        Ok(())
    }

    /// Serialize `msg`, frame it, and write it to the child's stdin.
    /// Fails once the supervisor is stopped or the server has died.
    pub async fn send(&self, msg: &Value) -> Result<()> {
        if !self.alive() {
            return Err(GatewayError::Terminated);
        }
        self.write_frame(msg).await
    }

    /// Send a notification built from `method`/`params`.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(&rpc::notification(method, params)).await
    }

    /// Send a gateway-originated request and await its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = rpc::request(id, method, params);
        let key = RequestKey::Number(id);
        let rx = self.begin_request(&msg).await?;
        self.await_response(&key, rx, deadline).await
    }

    /// Forward a request that already carries an id (the client's), awaiting
    /// the matching response.
    pub async fn forward_request(&self, msg: &Value, deadline: Duration) -> Result<Value> {
        let key = rpc::request_id(msg).ok_or(GatewayError::MissingId)?;
        let rx = self.begin_request(msg).await?;
        self.await_response(&key, rx, deadline).await
    }

    /// Register a completion handle for the message's id, then send it.
    /// Registration precedes the write so the reply cannot be lost.
    pub async fn begin_request(&self, msg: &Value) -> Result<oneshot::Receiver<Value>> {
        let key = rpc::request_id(msg).ok_or(GatewayError::MissingId)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.insert(key.clone(), tx).is_some() {
                warn!(id = %key, "request id reused while still pending; earlier waiter cancelled");
            }
        }
        if let Err(e) = self.send(msg).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }
        metrics::counter!("gateway_server_requests_total").increment(1);
        Ok(rx)
    }

    /// Await a completion handle registered by [`begin_request`].
    ///
    /// On timeout the registration is removed and the server-side work is
    /// left alone; other in-flight requests are unaffected.
    pub async fn await_response(
        &self,
        key: &RequestKey,
        rx: oneshot::Receiver<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        match timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(key);
                Err(GatewayError::Terminated)
            }
            Err(_) => {
                self.pending.lock().await.remove(key);
                Err(GatewayError::Timeout(deadline))
            }
        }
    }

    /// Stop the child: LSP `shutdown`/`exit` first, then close stdin, wait up
    /// to [`KILL_GRACE`] for a natural exit, and SIGKILL as the last resort.
    /// All pending completions are cancelled.
    pub async fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let server_up = was_running && !*self.exited_tx.borrow();

        if server_up {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let key = RequestKey::Number(id);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(key.clone(), tx);
            if self.write_frame(&rpc::request(id, "shutdown", None)).await.is_ok() {
                if timeout(self.shutdown_timeout, rx).await.is_err() {
                    debug!("no shutdown response within {:?}", self.shutdown_timeout);
                }
            }
            self.pending.lock().await.remove(&key);
            let _ = self.write_frame(&rpc::notification("exit", None)).await;
        }

        // Dropping stdin closes the pipe; servers that ignore `exit` still
        // see EOF.
        *self.stdin.lock().await = None;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "language server exited"),
                Ok(Err(e)) => warn!(error = %e, "failed waiting for language server"),
                Err(_) => {
                    warn!("language server did not exit within {KILL_GRACE:?}, killing");
                    if let Err(e) = child.kill().await {
                        error!(error = %e, "failed to kill language server");
                    }
                }
            }
        }

        let mut pending = self.pending.lock().await;
        let cancelled = pending.len();
        pending.clear();
        drop(pending);
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending requests on stop");
        }
    }

    /// Recent stderr output, newline-joined.
    pub async fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    async fn write_frame(&self, msg: &Value) -> Result<()> {
        let frame = codec::encode(msg)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(GatewayError::Terminated)?;
        stdin.write_all(&frame).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Read child stdout in 4 KiB chunks through the frame decoder and dispatch
/// each message. On EOF or read error: mark the supervisor dead and cancel
/// every outstanding completion.
async fn reader_loop(
    mut stdout: ChildStdout,
    pending: PendingMap,
    sink: SinkSlot,
    running: Arc<AtomicBool>,
    exited_tx: watch::Sender<bool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                debug!("language server stdout closed");
                break;
            }
            Ok(n) => {
                decoder.feed(&chunk[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(msg)) => dispatch(msg, &pending, &sink).await,
                        Ok(None) => break,
                        Err(e) => warn!(error = %e, "dropped undecodable frame"),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "language server stdout read failed");
                break;
            }
        }
    }

    running.store(false, Ordering::Release);
    let _ = exited_tx.send(true);

    let mut map = pending.lock().await;
    let orphaned = map.len();
    map.clear();
    drop(map);
    if orphaned > 0 {
        warn!(orphaned, "language server died with requests in flight");
    }
}

/// Route one inbound message. A pending id wins: the waiter that registered
/// it gets the message and nobody else sees it. Everything else that carries
/// a `method` (server-initiated request or notification) goes to the sink;
/// unmatched responses are dropped with a log line, never re-queued.
async fn dispatch(msg: Value, pending: &PendingMap, sink: &SinkSlot) {
    metrics::counter!("gateway_server_messages_total").increment(1);

    if let Some(key) = rpc::request_id(&msg) {
        let waiter = pending.lock().await.remove(&key);
        if let Some(tx) = waiter {
            let _ = tx.send(msg);
            return;
        }
    }

    if rpc::method(&msg).is_some() {
        let callback = sink.lock().await.clone();
        if let Some(callback) = callback {
            callback(msg);
        } else {
            debug!("server message dropped: no sink installed");
        }
        return;
    }

    debug!("response for unknown request id dropped");
}

/// Log child stderr line by line, retaining a bounded tail for diagnostics.
async fn stderr_loop(stderr: ChildStderr, tail: StderrTail) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target: "language_server", "{line}");
        let mut tail = tail.lock().await;
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    debug!("language server stderr closed");
}
