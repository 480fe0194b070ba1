use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::common::{FrameSink, PendingRequests, RpcSession};
use crate::error::{HubError, Result};
use crate::registry::{SubprocessSpec, TransportKind};
use crate::rpc::{RpcRequest, RpcResponse};

/// Time a child gets to exit after stdin closes before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Line-framed RPC over a long-lived child process's stdin/stdout.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    server: String,
    spec: SubprocessSpec,
}

impl StdioTransport {
    pub fn new(server: impl Into<String>, spec: SubprocessSpec) -> Self {
        Self {
            server: server.into(),
            spec,
        }
    }

    pub fn command(&self) -> &str {
        &self.spec.command
    }

    pub fn args(&self) -> &[String] {
        &self.spec.args
    }

    /// Spawn the child and wire its pipes into a session.
    pub async fn open(&self) -> Result<RpcSession> {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            HubError::transport(
                &self.server,
                format!("failed to spawn '{}': {e}", self.spec.command),
            )
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::transport(&self.server, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::transport(&self.server, "child stdout unavailable"))?;
        let stderr = child.stderr.take();

        tracing::debug!(server = %self.server, command = %self.spec.command, pid = ?child.id(), "spawned subprocess");

        let pending = PendingRequests::new();
        tokio::spawn(read_responses(
            self.server.clone(),
            stdout,
            Arc::clone(&pending),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(self.server.clone(), stderr));
        }

        let sink = StdioSink {
            server: self.server.clone(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            released: AtomicBool::new(false),
        };
        Ok(RpcSession::new(
            &self.server,
            TransportKind::Subprocess,
            pending,
            Box::new(sink),
        ))
    }
}

struct StdioSink {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    released: AtomicBool,
}

#[async_trait]
impl FrameSink for StdioSink {
    async fn send(&self, request: &RpcRequest) -> Result<Option<RpcResponse>> {
        let line = request.to_line()?;
        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| HubError::transport(&self.server, "subprocess stdin closed"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HubError::transport(&self.server, format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| HubError::transport(&self.server, format!("failed to flush stdin: {e}")))?;
        Ok(None)
    }

    async fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        drop(self.stdin.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        let status = match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::debug!(server = %self.server, "subprocess ignored stdin close, killing");
                child.kill().await?;
                child.wait().await?
            }
        };
        if status.success() {
            tracing::info!(server = %self.server, "subprocess exited");
        } else {
            tracing::warn!(server = %self.server, status = %status, "subprocess exited with failure");
        }
        Ok(())
    }
}

async fn read_responses(server: String, stdout: ChildStdout, pending: Arc<PendingRequests>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match RpcResponse::parse_frame(&line) {
                Some(response) => {
                    if !pending.complete(response) {
                        tracing::debug!(server = %server, "discarding response with no waiting caller");
                    }
                }
                None => {
                    if !line.trim().is_empty() {
                        tracing::debug!(server = %server, line = %line, "skipping non-envelope stdout line");
                    }
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(server = %server, error = %err, "failed to read subprocess stdout");
                break;
            }
        }
    }
    pending.fail_all("subprocess output closed (process may have exited)");
    tracing::debug!(server = %server, "subprocess stdout reader finished");
}

async fn forward_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, stderr = %line, "subprocess stderr");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::ToolSession;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn transport(command: &str, args: &[&str]) -> StdioTransport {
        StdioTransport::new(
            "local",
            SubprocessSpec {
                command: command.into(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                working_dir: None,
            },
        )
    }

    #[test]
    fn constructor_keeps_command_and_args() {
        let transport = transport("node", &["server.js", "--debug"]);
        assert_eq!(transport.command(), "node");
        assert_eq!(
            transport.args(),
            &["server.js".to_string(), "--debug".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_transport_error() {
        let err = transport("/definitely/not/a/real/binary", &[])
            .open()
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, HubError::Transport { message, .. } if message.contains("spawn")));
    }

    #[tokio::test]
    async fn echoed_request_is_routed_back_by_id() {
        // `cat` mirrors the request line; it parses as an envelope with the
        // same id but no result, which surfaces as an invalid response.
        let session = transport("cat", &[]).open().await.expect("cat should spawn");
        let err = session
            .call("echo", json!({"text": "hi"}))
            .await
            .expect_err("mirrored request has no result");
        assert!(matches!(err, HubError::Remote { kind, .. } if kind == "invalid_response"));
        session.close().await.expect("close should succeed");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn exited_child_marks_session_closed() {
        let session = transport("true", &[]).open().await.expect("true should spawn");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session should notice the exit");

        let err = session
            .ping()
            .await
            .expect_err("ping on dead process must fail");
        assert!(matches!(err, HubError::Transport { .. }));
    }

    #[tokio::test]
    async fn abandoned_calls_do_not_leak_pending_entries() {
        let session = transport("sleep", &["5"]).open().await.expect("sleep should spawn");
        for _ in 0..5 {
            let outcome =
                tokio::time::timeout(Duration::from_millis(30), session.call("x", json!({}))).await;
            assert!(outcome.is_err());
        }
        assert_eq!(session.pending_requests(), 0);
        session.close().await.expect("close should kill the child");
        session.close().await.expect("second close is a no-op");
    }
}
