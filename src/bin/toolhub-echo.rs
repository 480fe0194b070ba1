//! Minimal line-RPC tool server used for local smoke tests.
//!
//! Tools: `echo` returns its arguments, `sleep {ms}` waits before replying,
//! `fail` always answers with an error envelope. `--exit-after N` makes the
//! process exit on the first tool call after N answered ones, simulating a
//! crash. Pings and listings are not counted.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use toolhub::rpc::{
    RpcError, RpcRequest, RpcResponse, METHOD_CALL_TOOL, METHOD_LIST_TOOLS, METHOD_PING,
};

fn tool_listing() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Return the arguments unchanged",
                "inputSchema": {"type": "object"}
            },
            {
                "name": "sleep",
                "description": "Wait for `ms` milliseconds, then reply",
                "inputSchema": {
                    "type": "object",
                    "properties": {"ms": {"type": "integer"}},
                    "required": ["ms"]
                }
            },
            {
                "name": "fail",
                "description": "Always fails",
                "inputSchema": {"type": "object"}
            }
        ]
    })
}

async fn handle(request: RpcRequest) -> RpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        METHOD_LIST_TOOLS => RpcResponse::success(id, tool_listing()),
        METHOD_PING => RpcResponse::success(id, json!({})),
        METHOD_CALL_TOOL => {
            let name = request.params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            match name {
                "echo" => RpcResponse::success(id, arguments),
                "sleep" => {
                    let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    RpcResponse::success(id, json!({ "slept_ms": ms }))
                }
                "fail" => RpcResponse::failure(id, RpcError::new("tool_error", "requested failure")),
                other => RpcResponse::failure(
                    id,
                    RpcError::new("unknown_tool", format!("no tool named '{other}'")),
                ),
            }
        }
        other => RpcResponse::failure(
            id,
            RpcError::new("method_not_found", format!("unknown method '{other}'")),
        ),
    }
}

fn exit_after() -> Option<usize> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--exit-after" {
            return args.next().and_then(|n| n.parse().ok());
        }
    }
    None
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let limit = exit_after();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    // Non-envelope noise the client must skip.
    let _ = tx.send("toolhub-echo ready\n".to_string());
    eprintln!("toolhub-echo: serving on stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut handled = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                eprintln!("toolhub-echo: ignoring malformed line: {err}");
                continue;
            }
        };

        if request.method == METHOD_CALL_TOOL {
            if limit.is_some_and(|n| handled >= n) {
                eprintln!("toolhub-echo: exiting after {handled} tool calls");
                std::process::exit(3);
            }
            handled += 1;
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle(request).await;
            if let Ok(mut text) = serde_json::to_string(&response) {
                text.push('\n');
                let _ = tx.send(text);
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}
