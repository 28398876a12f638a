//! One incarnation of the analysis server: the child process, its writer
//! task, the receive loop, the pending-request map and open documents.
//!
//! A session is never reused after its process exits; the client builds a
//! new one on the next `start()`.

use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::ClientState;
use crate::codec::{FrameReader, FrameWriter};
use crate::config::AnalysisConfig;
use crate::error::LspError;
use crate::protocol::{self, Incoming, Notification, Request};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// How long a process that acknowledged `shutdown`/`exit` gets to leave.
const EXIT_GRACE: Duration = Duration::from_secs(2);

pub(crate) type Reply = Result<serde_json::Value, LspError>;

pub(crate) type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

type DocumentMap = Arc<Mutex<HashMap<String, OpenDocument>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

#[derive(Debug)]
struct OpenDocument {
    refs: usize,
    version: i32,
    content_hash: String,
}

/// Keeps a virtual document open on the server until closed or dropped.
///
/// `close()` is the normal path. Dropping an unclosed guard (caller
/// cancelled mid-query) schedules the close on the runtime instead.
pub(crate) struct DocumentGuard {
    uri: String,
    documents: DocumentMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    closed: bool,
}

impl DocumentGuard {
    pub async fn close(mut self) {
        self.closed = true;
        release_document(&self.documents, &self.writer_tx, &self.uri).await;
    }
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let documents = self.documents.clone();
        let writer_tx = self.writer_tx.clone();
        let uri = std::mem::take(&mut self.uri);
        handle.spawn(async move {
            release_document(&documents, &writer_tx, &uri).await;
        });
    }
}

async fn release_document(
    documents: &Mutex<HashMap<String, OpenDocument>>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    uri: &str,
) {
    // Held across the send so a concurrent reopen cannot overtake the close.
    let mut docs = documents.lock().await;
    let Some(doc) = docs.get_mut(uri) else {
        return;
    };
    doc.refs -= 1;
    if doc.refs > 0 {
        return;
    }
    docs.remove(uri);
    let frame = notification_frame("textDocument/didClose", protocol::did_close_params(uri));
    if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
        tracing::debug!(uri, "writer closed before didClose");
    }
}

fn notification_frame(method: &'static str, params: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

fn lock_child(child: &StdMutex<Option<Child>>) -> std::sync::MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn fail_pending(pending: &Mutex<HashMap<u64, oneshot::Sender<Reply>>>, err: &LspError) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(err.clone()));
    }
}

/// Removes a request's pending entry when its caller goes away.
struct PendingSlot {
    pending: PendingMap,
    id: u64,
    armed: bool,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.remove(&id);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pending = self.pending.clone();
        handle.spawn(async move {
            pending.lock().await.remove(&id);
        });
    }
}

pub(crate) struct Session {
    name: String,
    language_id: String,
    child: StdMutex<Option<Child>>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    documents: DocumentMap,
    /// Set once a deliberate shutdown begins.
    closing: Arc<AtomicBool>,
    /// Set when the receive loop has ended for any reason.
    reader_done: Arc<AtomicBool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Spawn the configured server with piped stdio and start its tasks.
    pub fn spawn(
        config: &AnalysisConfig,
        root: &Path,
        state: Arc<watch::Sender<ClientState>>,
    ) -> Result<Self, LspError> {
        let resolved_cmd = which::which(&config.command).map_err(|e| {
            LspError::startup(format!("{} not found in PATH: {e}", config.command))
        })?;
        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(&config.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if config.capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| LspError::startup(format!("spawning {}: {e}", config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::startup("no stdout from child"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::startup("no stdin from child"))?;
        let stderr = child.stderr.take();

        tracing::debug!(
            server = %config.command,
            pid = child.id(),
            root = %root.display(),
            "analysis server spawned"
        );

        Ok(Self::connect(
            config.command.clone(),
            config.language_id.clone(),
            stdout,
            stdin,
            Some(child),
            stderr,
            state,
        ))
    }

    /// Wire a session to an already-open pair of streams.
    pub fn connect<R, W>(
        name: String,
        language_id: String,
        reader: R,
        writer: W,
        child: Option<Child>,
        stderr: Option<ChildStderr>,
        state: Arc<watch::Sender<ClientState>>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::with_capacity(3);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_name = name.clone();
        tasks.push(tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(
                                server = %writer_name,
                                error = %e,
                                "write to analysis server failed"
                            );
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        }));

        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_closing = closing.clone();
        let reader_done_flag = reader_done.clone();
        let reader_name = name.clone();
        tasks.push(tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            &frame,
                            &reader_pending,
                            &reader_writer_tx,
                            &reader_name,
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::debug!(server = %reader_name, "analysis server closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            server = %reader_name,
                            error = %e,
                            "analysis server read failed"
                        );
                        break;
                    }
                }
            }
            reader_done_flag.store(true, Ordering::SeqCst);
            if reader_closing.load(Ordering::SeqCst) {
                fail_pending(&reader_pending, &LspError::ShuttingDown).await;
                return;
            }
            tracing::warn!(server = %reader_name, "analysis server stream ended unexpectedly");
            state.send_if_modified(|s| {
                if *s == ClientState::Ready {
                    *s = ClientState::Crashed;
                    true
                } else {
                    false
                }
            });
            fail_pending(&reader_pending, &LspError::Crashed { exit_status: None }).await;
        }));

        if let Some(stderr) = stderr {
            let stderr_name = name.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %stderr_name, "{line}");
                }
            }));
        }

        Self {
            name,
            language_id,
            child: StdMutex::new(child),
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            documents: Arc::new(Mutex::new(HashMap::new())),
            closing,
            reader_done,
            tasks: StdMutex::new(tasks),
        }
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        pending: &Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
        writer_tx: &mpsc::Sender<WriterCommand>,
        server_name: &str,
    ) {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::warn!(server = server_name, "ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            Incoming::Response { id, outcome } => {
                let sender = pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let reply = outcome.map_err(|e| LspError::ServerError {
                            code: e.code,
                            message: e.message,
                        });
                        let _ = tx.send(reply);
                    }
                    // Already timed out or shut down; nobody is waiting.
                    None => tracing::debug!(server = server_name, id, "dropping late response"),
                }
            }
            Incoming::ServerRequest { id, method, params } => {
                tracing::debug!(server = server_name, %method, "server request");
                let reply = protocol::server_request_reply(&id, &method, params.as_ref());
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => {
                Self::handle_notification(server_name, &method, params.as_ref());
            }
        }
    }

    fn handle_notification(server_name: &str, method: &str, params: Option<&serde_json::Value>) {
        match method {
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                let level = params.and_then(|p| p.get("type")).and_then(|t| t.as_u64());
                match level {
                    Some(1) => tracing::warn!(server = server_name, "{message}"),
                    Some(2) => tracing::info!(server = server_name, "{message}"),
                    _ => tracing::debug!(server = server_name, "{message}"),
                }
            }
            _ => tracing::trace!(server = server_name, method, "ignoring notification"),
        }
    }

    /// Exit status if the child has already terminated.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = lock_child(&self.child);
        child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    /// Dead if the child exited or the receive loop ended.
    pub fn crashed(&self) -> Option<LspError> {
        if let Some(status) = self.exit_status() {
            return Some(LspError::Crashed {
                exit_status: Some(status.to_string()),
            });
        }
        if self.reader_done.load(Ordering::SeqCst) {
            return Some(LspError::Crashed { exit_status: None });
        }
        None
    }

    async fn enqueue(&self, frame: serde_json::Value, deadline: Instant) -> Result<(), LspError> {
        match tokio::time::timeout_at(deadline, self.writer_tx.send(WriterCommand::Send(frame)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) if self.closing.load(Ordering::SeqCst) => Err(LspError::ShuttingDown),
            Ok(Err(_)) => Err(LspError::Crashed { exit_status: None }),
            Err(_) => Err(LspError::Transport("writer queue full".to_string())),
        }
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// Exactly one of response, timeout or shutdown resolves the request.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Reply {
        self.send_request(method, params, timeout, false).await
    }

    async fn send_request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
        during_shutdown: bool,
    ) -> Reply {
        let deadline = Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        let mut slot = PendingSlot {
            pending: self.pending.clone(),
            id,
            armed: true,
        };
        // A drain that ran before our insert would miss us.
        if !during_shutdown && self.closing.load(Ordering::SeqCst) {
            return Err(LspError::ShuttingDown);
        }
        if self.reader_done.load(Ordering::SeqCst) {
            return Err(LspError::Crashed { exit_status: None });
        }

        tracing::trace!(server = %self.name, method, id, "sending request");
        self.enqueue(frame, deadline).await?;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(reply)) => {
                slot.armed = false;
                reply
            }
            Ok(Err(_)) => Err(LspError::Crashed { exit_status: None }),
            Err(_) => {
                slot.armed = false;
                let still_pending = self.pending.lock().await.remove(&id).is_some();
                if !still_pending && let Ok(reply) = rx.try_recv() {
                    // The reply won the race against the deadline.
                    return reply;
                }
                tracing::debug!(server = %self.name, method, id, "request timed out");
                Err(LspError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| LspError::Transport("writer channel closed".to_string()))
    }

    /// The `initialize` request followed by the `initialized` notification.
    pub async fn initialize(&self, root: &Path, timeout: Duration) -> Result<(), LspError> {
        let root_uri =
            protocol::path_to_file_uri(root).map_err(|e| LspError::startup(e.to_string()))?;
        let params = protocol::initialize_params(root_uri.as_str());
        self.request("initialize", Some(params), timeout).await?;
        self.notify("initialized", Some(serde_json::json!({}))).await
    }

    /// Open (or refresh) `uri` with `text` for the lifetime of the guard.
    ///
    /// The first opener sends `didOpen`; an opener with different content
    /// sends `didChange` with the next version; the last close sends
    /// `didClose`.
    pub async fn open_document(
        &self,
        uri: &str,
        text: &str,
        content_hash: &str,
    ) -> Result<DocumentGuard, LspError> {
        let mut docs = self.documents.lock().await;
        let guard = DocumentGuard {
            uri: uri.to_string(),
            documents: self.documents.clone(),
            writer_tx: self.writer_tx.clone(),
            closed: false,
        };

        let frame = match docs.get_mut(uri) {
            None => {
                docs.insert(
                    uri.to_string(),
                    OpenDocument {
                        refs: 1,
                        version: 1,
                        content_hash: content_hash.to_string(),
                    },
                );
                Some(notification_frame(
                    "textDocument/didOpen",
                    protocol::did_open_params(uri, &self.language_id, 1, text),
                ))
            }
            Some(doc) => {
                doc.refs += 1;
                if doc.content_hash == content_hash {
                    None
                } else {
                    doc.version += 1;
                    doc.content_hash = content_hash.to_string();
                    Some(notification_frame(
                        "textDocument/didChange",
                        protocol::did_change_params(uri, doc.version, text),
                    ))
                }
            }
        };

        if let Some(frame) = frame
            && self.writer_tx.send(WriterCommand::Send(frame)).await.is_err()
        {
            drop(docs);
            guard.close().await;
            return Err(if self.closing.load(Ordering::SeqCst) {
                LspError::ShuttingDown
            } else {
                LspError::Crashed { exit_status: None }
            });
        }
        Ok(guard)
    }

    #[cfg(test)]
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[cfg(test)]
    pub async fn open_documents(&self) -> usize {
        self.documents.lock().await.len()
    }

    fn take_child(&self) -> Option<Child> {
        lock_child(&self.child).take()
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Cooperative `shutdown`/`exit`, then force. Always runs to completion:
    /// the child is reaped, every pending request is failed, and all
    /// background tasks have finished when this returns.
    pub async fn shutdown(&self, timeout: Duration) {
        self.closing.store(true, Ordering::SeqCst);

        let cooperative = if self.crashed().is_some() {
            false
        } else {
            match self.send_request("shutdown", None, timeout, true).await {
                Ok(_) => self.notify("exit", None).await.is_ok(),
                Err(e) => {
                    tracing::debug!(server = %self.name, error = %e, "cooperative shutdown failed");
                    false
                }
            }
        };

        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);

        if let Some(mut child) = self.take_child() {
            let exited = if cooperative {
                tokio::time::timeout(EXIT_GRACE, child.wait()).await.ok()
            } else {
                None
            };
            match exited {
                Some(Ok(status)) => {
                    tracing::debug!(server = %self.name, %status, "analysis server exited");
                }
                _ => {
                    tracing::debug!(server = %self.name, "analysis server did not exit, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(
                            server = %self.name,
                            error = %e,
                            "failed to kill analysis server"
                        );
                    }
                }
            }
        }

        fail_pending(&self.pending, &LspError::ShuttingDown).await;

        for task in self.take_tasks() {
            task.abort();
            let _ = task.await;
        }
    }

    /// Kill without the handshake; used when startup fails half-way.
    pub async fn terminate(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.take_child() {
            let _ = child.kill().await;
        }
        fail_pending(&self.pending, &LspError::ShuttingDown).await;
        for task in self.take_tasks() {
            task.abort();
            let _ = task.await;
        }
    }
}
