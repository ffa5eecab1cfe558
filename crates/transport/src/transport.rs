//! Transport implementations.
//!
//! Three ways to speak to a tool server:
//! - **Stdio**: spawn a child process, newline-delimited JSON-RPC over
//!   stdin/stdout, stderr drained into logs.
//! - **Http**: long-lived client, per-call POST to `{base}/tools/{method}`.
//! - **Websocket**: long-lived duplex connection, id-correlated JSON-RPC
//!   frames, protocol-level ping for health.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use mm_domain::error::Error;
use mm_domain::policy::ServerConfig;

use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Faults raised inside a transport. The manager maps these onto the
/// shared error taxonomy via [`TransportFault::into_error`].
#[derive(Debug, thiserror::Error)]
pub enum TransportFault {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server process has exited")]
    ProcessExited,

    #[error("connection closed")]
    Closed,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("{0}")]
    Tool(JsonRpcError),
}

impl TransportFault {
    /// Map onto the shared taxonomy. Tool-error envelopes stay distinct so
    /// they don't count toward the circuit breaker.
    pub fn into_error(self, server: &str) -> Error {
        match self {
            Self::Timeout => Error::Timeout(format!("call to {server} timed out")),
            Self::Tool(e) => Error::Tool {
                code: e.code,
                message: e.message,
            },
            other => Error::Transport(format!("{server}: {other}")),
        }
    }

    /// Whether the fault should count as a transport failure for breaker
    /// purposes.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(self, Self::Tool(_))
    }
}

/// One live channel to a tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a JSON-RPC call and await the correlated response within the
    /// deadline.
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportFault>;

    /// Transport-appropriate liveness probe.
    async fn health_check(&self, timeout: Duration) -> Result<(), TransportFault>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to skip before declaring the server
/// broken (a misconfigured server logging to stdout would otherwise spin).
const MAX_SKIP_LINES: usize = 1000;

/// How long shutdown waits for the child after closing stdin before
/// killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Child-process transport. Each JSON-RPC message is a single
/// newline-delimited line. The `request_lock` serializes entire
/// request/response cycles so concurrent callers cannot read each other's
/// responses.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn the server's command with its configured environment and
    /// working directory, and start draining stderr into logs.
    pub fn spawn(name: &str, config: &ServerConfig) -> Result<Self, TransportFault> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportFault::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportFault::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, line = %line, "server stderr");
                }
            });
        }

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportFault> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportFault::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read one JSON line from stdout, skipping empty or non-JSON lines.
    async fn read_line(&self) -> Result<String, TransportFault> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportFault::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportFault::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportFault::Protocol(
                    "server produced too many non-JSON lines on stdout".into(),
                ));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from server stdout");
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportFault> {
        // Serialize the full request/response cycle; in-flight writes to
        // the same child must not interleave.
        let _guard = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, Some(params));
        let json = serde_json::to_string(&req)?;

        tracing::debug!(id, method, "sending stdio request");
        self.write_line(&json).await?;

        let result = tokio::time::timeout(timeout, async {
            // Servers may interleave notifications (no id); skip until the
            // matching response arrives.
            loop {
                let line = self.read_line().await?;
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return resp.into_result().map_err(TransportFault::Tool);
                    }
                    tracing::debug!(
                        expected_id = id,
                        got_id = resp.id,
                        "response for a different request, continuing"
                    );
                } else {
                    tracing::debug!(line = %line, "skipping non-response frame");
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportFault::Timeout),
        }
    }

    async fn health_check(&self, _timeout: Duration) -> Result<(), TransportFault> {
        // Liveness = the child process is still running.
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(TransportFault::Protocol(format!(
                    "process exited with {status}"
                )))
            }
            Err(e) => Err(TransportFault::Io(e)),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        // Closing stdin asks the server to exit; kill if it lingers.
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing server stdin");
            }
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for server process");
            }
            Err(_) => {
                tracing::warn!("server process did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP transport: a long-lived client, one POST per call.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    health_endpoint: String,
    bearer: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, TransportFault> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| TransportFault::Protocol("http transport requires a url".into()))?;

        // Bearer token resolved once at construction from the named env
        // var; an unset var means unauthenticated requests.
        let bearer = config
            .auth_token_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok());

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportFault::Protocol(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            health_endpoint: config.health.endpoint.clone(),
            bearer,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportFault> {
        let url = format!("{}/tools/{method}", self.base_url);

        let request = self
            .authorized(self.client.post(&url))
            .json(&params)
            .timeout(timeout);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportFault::Timeout
            } else {
                TransportFault::Protocol(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportFault::Protocol(format!("HTTP {status}: {body}")));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| TransportFault::Protocol(e.to_string()))?;

        // A well-formed JSON-RPC error envelope surfaces as a tool error.
        if let Ok(rpc) = serde_json::from_value::<JsonRpcResponse>(value.clone()) {
            if rpc.is_error() {
                return rpc.into_result().map_err(TransportFault::Tool);
            }
        }

        Ok(value)
    }

    async fn health_check(&self, timeout: Duration) -> Result<(), TransportFault> {
        let url = format!("{}{}", self.base_url, self.health_endpoint);
        let response = self
            .authorized(self.client.get(&url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportFault::Timeout
                } else {
                    TransportFault::Protocol(e.to_string())
                }
            })?;

        if response.status().as_u16() == 200 {
            Ok(())
        } else {
            Err(TransportFault::Protocol(format!(
                "health endpoint returned {}",
                response.status()
            )))
        }
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self) {
        // Dropping the client closes its pool.
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Streaming duplex transport. Calls are concurrent: a background reader
/// task correlates responses to waiting callers by request id. Health is a
/// protocol-level ping with a timed pong.
pub struct WsTransport {
    writer: Mutex<WsSink>,
    pending: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
    pong: Arc<parking_lot::Mutex<Option<oneshot::Sender<()>>>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(config: &ServerConfig) -> Result<Self, TransportFault> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| TransportFault::Protocol("websocket transport requires a url".into()))?;

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportFault::Protocol(e.to_string()))?;
        let (writer, reader) = stream.split();

        let pending: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let pong: Arc<parking_lot::Mutex<Option<oneshot::Sender<()>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            pending.clone(),
            pong.clone(),
            alive.clone(),
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            pong,
            next_id: AtomicU64::new(1),
            alive,
            reader: reader_task,
        })
    }

    async fn read_loop(
        mut reader: WsSource,
        pending: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
        pong: Arc<parking_lot::Mutex<Option<oneshot::Sender<()>>>>,
        alive: Arc<AtomicBool>,
    ) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<JsonRpcResponse>(&text) {
                    Ok(resp) => {
                        if let Some(tx) = pending.lock().remove(&resp.id) {
                            let _ = tx.send(resp);
                        } else {
                            tracing::debug!(id = resp.id, "response with no waiting caller");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unparseable frame");
                    }
                },
                Ok(Message::Pong(_)) => {
                    if let Some(tx) = pong.lock().take() {
                        let _ = tx.send(());
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "websocket read error");
                    break;
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        // Wake every waiting caller with a closed-channel error.
        pending.lock().clear();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportFault> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportFault::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let req = JsonRpcRequest::new(id, method, Some(params));
        let frame = serde_json::to_string(&req)?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(Message::Text(frame.into())).await {
                self.pending.lock().remove(&id);
                return Err(TransportFault::Protocol(e.to_string()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => resp.into_result().map_err(TransportFault::Tool),
            Ok(Err(_)) => Err(TransportFault::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportFault::Timeout)
            }
        }
    }

    async fn health_check(&self, timeout: Duration) -> Result<(), TransportFault> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportFault::Closed);
        }
        let (tx, rx) = oneshot::channel();
        *self.pong.lock() = Some(tx);

        {
            let mut writer = self.writer.lock().await;
            writer
                .send(Message::Ping(Vec::new().into()))
                .await
                .map_err(|e| TransportFault::Protocol(e.to_string()))?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportFault::Closed),
            Err(_) => Err(TransportFault::Timeout),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
        self.reader.abort();
    }
}
