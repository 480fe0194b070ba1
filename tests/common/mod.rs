//! Shared test helpers: descriptors, fast hub config, and a small
//! event-stream tool server.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use toolhub::config::{HealthSettings, HubConfig};

/// Path of the line-RPC echo server built alongside the tests.
pub fn echo_bin() -> &'static str {
    env!("CARGO_BIN_EXE_toolhub-echo")
}

pub fn subprocess_descriptor(name: &str, extra_args: &[&str]) -> String {
    json!({
        "name": name,
        "description": format!("{name} echo server"),
        "command": echo_bin(),
        "args": extra_args,
    })
    .to_string()
}

pub fn stream_descriptor(name: &str, url: &str) -> String {
    json!({
        "name": name,
        "description": format!("{name} stream server"),
        "url": url,
        "timeout_ms": 2000,
    })
    .to_string()
}

/// Hub config with short intervals so health transitions happen quickly.
pub fn fast_config(dir: &Path) -> HubConfig {
    HubConfig::builder()
        .servers_dir(dir.to_path_buf())
        .reconcile_interval(Duration::from_secs(60))
        .default_call_timeout(Duration::from_secs(5))
        .health(HealthSettings {
            interval: Duration::from_millis(100),
            failure_threshold: 3,
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            max_reopen_attempts: None,
        })
        .build()
}

/// Poll `check` until it returns true or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// How the event-stream server delivers responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVia {
    /// In the body of the POST that carried the request.
    PostBody,
    /// As a `message` event on the open stream; the POST gets `202`.
    Stream,
}

/// Event-stream tool server exposing `echo` and `sleep`.
///
/// `GET /sse` announces `/messages` as the side channel and stays open;
/// `POST /messages` takes one request envelope.
pub struct SseTestServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

type StreamSlot = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

impl SseTestServer {
    pub async fn start(reply: ReplyVia) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream_slot: StreamSlot = Arc::new(Mutex::new(None));
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let slot = Arc::clone(&stream_slot);
                tokio::spawn(async move {
                    let _ = serve_connection(socket, reply, slot).await;
                });
            }
        });
        Self { addr, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }
}

impl Drop for SseTestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    socket: TcpStream,
    reply: ReplyVia,
    slot: StreamSlot,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 || header == "\r\n" {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    if request_line.starts_with("GET /sse") {
        let (tx, mut rx) = mpsc::unbounded_channel();
        *slot.lock().unwrap() = Some(tx);
        let socket = reader.get_mut();
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n",
            )
            .await?;
        socket.write_all(b"event: endpoint\ndata: /messages\n\n").await?;
        socket.flush().await?;
        while let Some(frame) = rx.recv().await {
            socket
                .write_all(format!("event: message\ndata: {frame}\n\n").as_bytes())
                .await?;
            socket.flush().await?;
        }
        return Ok(());
    }

    if request_line.starts_with("POST /messages") {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let request: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
        let socket = reader.get_mut();
        match reply {
            ReplyVia::PostBody => {
                let response = respond(&request).await.to_string();
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    response.len()
                );
                socket.write_all(head.as_bytes()).await?;
                socket.write_all(response.as_bytes()).await?;
            }
            ReplyVia::Stream => {
                socket
                    .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await?;
                socket.flush().await?;
                let sender = slot.lock().unwrap().clone();
                if let Some(sender) = sender {
                    let _ = sender.send(respond(&request).await.to_string());
                }
                return Ok(());
            }
        }
        socket.flush().await?;
        return Ok(());
    }

    reader
        .get_mut()
        .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await
}

async fn respond(request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(json!(0));
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(json!({}));
    match method {
        "tools/list" => json!({
            "id": id,
            "result": {"tools": [
                {"name": "echo", "description": "Echo arguments", "inputSchema": {"type": "object"}},
                {"name": "sleep", "description": "Sleep for ms", "inputSchema": {"type": "object"}}
            ]}
        }),
        "ping" => json!({"id": id, "result": {}}),
        "tools/call" => {
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            match params.get("name").and_then(Value::as_str) {
                Some("echo") => json!({"id": id, "result": arguments}),
                Some("sleep") => {
                    let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    json!({"id": id, "result": {"slept_ms": ms}})
                }
                _ => json!({"id": id, "error": {"kind": "unknown_tool", "message": "no such tool"}}),
            }
        }
        _ => json!({"id": id, "error": {"kind": "method_not_found", "message": method}}),
    }
}
