//! MCP Transport layer implementations
//!
//! Three transports are supported:
//! - [`StdioTransport`]: newline-delimited JSON over a child process' stdin/stdout
//! - [`WebSocketTransport`]: one JSON message per text frame
//! - [`StreamableHttpTransport`]: JSON-RPC over HTTP POST, with responses
//!   delivered either as a JSON body or as a server-sent event stream

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Header carrying the server-assigned session for streamable HTTP
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Callback receiving each line a stdio server writes to stderr
pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, message: Value) -> io::Result<()>;

    /// Next inbound message. `Ok(None)` means the peer has nothing further to say.
    async fn receive(&mut self) -> io::Result<Option<Value>>;

    async fn close(&mut self) -> io::Result<()>;
}

/// Which wire a server speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Stdio,
    #[serde(alias = "socket", alias = "ws")]
    Websocket,
    #[serde(alias = "streamingHttp", alias = "http")]
    StreamableHttp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Websocket => write!(f, "websocket"),
            TransportKind::StreamableHttp => write!(f, "streamableHttp"),
        }
    }
}

fn other_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::other(e.to_string())
}

/// Stdio transport for subprocess communication
pub struct StdioTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

impl StdioTransport {
    /// Spawn `command` with `args`, layering `env` over the inherited environment.
    ///
    /// Stderr is read line by line and handed to `stderr_sink` when one is
    /// given, otherwise discarded.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&PathBuf>,
        stderr_sink: Option<StderrSink>,
    ) -> io::Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if stderr_sink.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| other_error("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| other_error("Failed to capture stdout"))?;

        if let (Some(sink), Some(stderr)) = (stderr_sink, child.stderr.take()) {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(&line);
                }
            });
        }

        Ok(Self {
            child,
            stdin: Some(stdin),
            reader: BufReader::new(stdout),
        })
    }

    /// OS process id, if the child is still running
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| other_error("Stdin not available"))?;

        let json = serde_json::to_string(&message)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            // Servers sometimes print banners to stdout; only JSON lines are messages
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => {
                    tracing::debug!(line = %trimmed, "Skipping non-JSON stdout line");
                }
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        // Closing stdin lets well-behaved servers exit on their own
        self.stdin.take();
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// WebSocket transport: one JSON-RPC message per text or binary frame
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Open the socket. The handshake is abandoned after `timeout`.
    pub async fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> io::Result<Self> {
        let mut request = url.into_client_request().map_err(other_error)?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| other_error(format!("invalid header name `{key}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| other_error(format!("invalid header value for `{key}`: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("websocket handshake with {url} timed out"),
                )
            })?
            .map_err(other_error)?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let text = serde_json::to_string(&message)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(other_error)
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => return Ok(Some(value)),
                        Err(e) => tracing::debug!("Skipping non-JSON websocket frame: {}", e),
                    }
                }
                Some(Ok(Message::Binary(data))) => match serde_json::from_slice::<Value>(&data) {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) => tracing::debug!("Skipping non-JSON websocket frame: {}", e),
                },
                Some(Ok(Message::Ping(payload))) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(other_error)?;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(other_error(e)),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.close(None).await.map_err(other_error)
    }
}

/// Streamable HTTP transport.
///
/// Every outgoing message is a POST. The reply body is either a single JSON
/// document (object or batch) or an SSE stream; all messages it carries are
/// queued and handed out by [`Transport::receive`].
pub struct StreamableHttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: Option<String>,
    inbox: VecDeque<Value>,
}

impl StreamableHttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
            client: reqwest::Client::new(),
            session_id: None,
            inbox: VecDeque::new(),
        }
    }

    /// Session id assigned by the server, once one has been seen
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn enqueue(&mut self, value: Value) {
        match value {
            Value::Array(batch) => self.inbox.extend(batch),
            other => self.inbox.push_back(other),
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(&message);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_ID_HEADER, session_id.as_str());
        }

        let response = request.send().await.map_err(other_error)?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(other_error(format!("HTTP {} from {}", status, self.url)));
        }

        // 202 Accepted carries no body (notifications)
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_event_stream {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event.map_err(other_error)?;
                if event.data.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(value) => self.enqueue(value),
                    Err(e) => tracing::debug!("Skipping non-JSON SSE event: {}", e),
                }
            }
        } else {
            let body = response.bytes().await.map_err(other_error)?;
            if !body.is_empty() {
                let value: Value = serde_json::from_slice(&body)?;
                self.enqueue(value);
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        Ok(self.inbox.pop_front())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inbox.clear();
        self.session_id = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_transport_kind_aliases() {
        let kind: TransportKind = serde_json::from_str("\"stdio\"").unwrap();
        assert_eq!(kind, TransportKind::Stdio);
        let kind: TransportKind = serde_json::from_str("\"websocket\"").unwrap();
        assert_eq!(kind, TransportKind::Websocket);
        let kind: TransportKind = serde_json::from_str("\"socket\"").unwrap();
        assert_eq!(kind, TransportKind::Websocket);
        let kind: TransportKind = serde_json::from_str("\"streamableHttp\"").unwrap();
        assert_eq!(kind, TransportKind::StreamableHttp);
        let kind: TransportKind = serde_json::from_str("\"streamingHttp\"").unwrap();
        assert_eq!(kind, TransportKind::StreamableHttp);
    }

    #[test]
    fn test_http_enqueue_flattens_batches() {
        let mut transport = StreamableHttpTransport::new("http://localhost:1", HashMap::new());
        transport.enqueue(serde_json::json!([{"id": 1}, {"id": 2}]));
        transport.enqueue(serde_json::json!({"id": 3}));
        assert_eq!(transport.inbox.len(), 3);
        assert_eq!(transport.inbox[0]["id"], 1);
        assert_eq!(transport.inbox[2]["id"], 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_skips_non_json_lines() {
        let args = vec![
            "-c".to_string(),
            "echo 'starting server'; echo '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}'"
                .to_string(),
        ];
        let mut transport = StdioTransport::spawn("sh", &args, &HashMap::new(), None, None)
            .await
            .unwrap();

        let value = transport.receive().await.unwrap().unwrap();
        assert_eq!(value["id"], 1);
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_forwards_stderr() {
        let captured = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_target = captured.clone();
        let sink: StderrSink = Arc::new(move |line: &str| {
            sink_target.lock().unwrap().push(line.to_string());
        });

        let args = vec!["-c".to_string(), "echo 'boot failed' >&2".to_string()];
        let mut transport = StdioTransport::spawn("sh", &args, &HashMap::new(), None, Some(sink))
            .await
            .unwrap();

        assert!(transport.receive().await.unwrap().is_none());
        // stderr is drained on a separate task
        for _ in 0..50 {
            if !captured.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(captured.lock().unwrap().as_slice(), ["boot failed".to_string()]);
    }
}
