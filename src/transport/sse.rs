use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Url;
use reqwest_eventsource::{retry, Event, EventSource};
use tokio::task::JoinHandle;

use super::common::{FrameSink, PendingRequests, RpcSession};
use crate::error::{HubError, Result};
use crate::registry::{StreamSpec, TransportKind};
use crate::rpc::{RpcRequest, RpcResponse};

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

/// Persistent HTTP event stream plus a POST side channel for requests.
///
/// The server's first `endpoint` event names the side-channel URL; responses
/// come back either in the POST body or as `message` events.
#[derive(Debug, Clone)]
pub struct SseTransport {
    server: String,
    spec: StreamSpec,
}

impl SseTransport {
    pub fn new(server: impl Into<String>, spec: StreamSpec) -> Self {
        Self {
            server: server.into(),
            spec,
        }
    }

    pub fn url(&self) -> &str {
        &self.spec.url
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.spec.timeout_ms)
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.handshake_timeout())
            .danger_accept_invalid_certs(!self.spec.trust)
            .build()
            .map_err(|e| HubError::transport(&self.server, format!("failed to build client: {e}")))
    }

    /// Open the event stream and wait (bounded by `timeout_ms`) for the
    /// endpoint announcement.
    pub async fn open(&self) -> Result<RpcSession> {
        let base = Url::parse(&self.spec.url)
            .map_err(|e| HubError::transport(&self.server, format!("invalid url: {e}")))?;
        let client = self.build_client()?;
        let request = client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream");
        let mut source = EventSource::new(request).map_err(|e| {
            HubError::transport(&self.server, format!("cannot open event stream: {e}"))
        })?;
        source.set_retry_policy(Box::new(retry::Never));

        let endpoint = match tokio::time::timeout(
            self.handshake_timeout(),
            await_endpoint(&self.server, &mut source, &base),
        )
        .await
        {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(err)) => {
                source.close();
                return Err(err);
            }
            Err(_) => {
                source.close();
                return Err(HubError::transport(
                    &self.server,
                    format!("no endpoint event within {}ms", self.spec.timeout_ms),
                ));
            }
        };
        tracing::debug!(server = %self.server, endpoint = %endpoint, "event stream ready");

        let pending = PendingRequests::new();
        let reader = tokio::spawn(read_events(
            self.server.clone(),
            source,
            Arc::clone(&pending),
        ));
        let sink = SseSink {
            server: self.server.clone(),
            client,
            endpoint,
            reader: Mutex::new(Some(reader)),
            released: AtomicBool::new(false),
        };
        Ok(RpcSession::new(
            &self.server,
            TransportKind::Stream,
            pending,
            Box::new(sink),
        ))
    }
}

async fn await_endpoint(server: &str, source: &mut EventSource, base: &Url) -> Result<Url> {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => continue,
            Ok(Event::Message(message)) if message.event == ENDPOINT_EVENT => {
                return resolve_endpoint(base, &message.data).map_err(|e| {
                    HubError::transport(server, format!("invalid endpoint '{}': {e}", message.data))
                });
            }
            Ok(Event::Message(message)) => {
                tracing::debug!(server = %server, event = %message.event, "ignoring event before endpoint");
            }
            Err(err) => {
                return Err(HubError::transport(
                    server,
                    format!("event stream handshake failed: {err}"),
                ))
            }
        }
    }
    Err(HubError::transport(
        server,
        "event stream closed before endpoint event",
    ))
}

/// Resolve the announced side channel against the stream URL.
pub(crate) fn resolve_endpoint(base: &Url, announced: &str) -> std::result::Result<Url, String> {
    base.join(announced.trim()).map_err(|e| e.to_string())
}

async fn read_events(server: String, mut source: EventSource, pending: Arc<PendingRequests>) {
    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {}
            Ok(Event::Message(message)) if message.event == MESSAGE_EVENT => {
                match RpcResponse::parse_frame(&message.data) {
                    Some(response) => {
                        if !pending.complete(response) {
                            tracing::debug!(server = %server, "discarding response with no waiting caller");
                        }
                    }
                    None => {
                        tracing::debug!(server = %server, "skipping non-envelope message event");
                    }
                }
            }
            Ok(Event::Message(message)) => {
                tracing::debug!(server = %server, event = %message.event, "ignoring event");
            }
            Err(err) => {
                tracing::warn!(server = %server, error = %err, "event stream lost");
                break;
            }
        }
    }
    source.close();
    pending.fail_all("event stream closed");
}

struct SseSink {
    server: String,
    client: reqwest::Client,
    endpoint: Url,
    reader: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

#[async_trait]
impl FrameSink for SseSink {
    async fn send(&self, request: &RpcRequest) -> Result<Option<RpcResponse>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| HubError::transport(&self.server, format!("request POST failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HubError::transport(
                &self.server,
                format!("side channel returned {status}"),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| HubError::transport(&self.server, format!("failed to read POST body: {e}")))?;
        Ok(RpcResponse::parse_frame(&body))
    }

    async fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        tracing::info!(server = %self.server, "event stream closed");
        Ok(())
    }
}

impl Drop for SseSink {
    fn drop(&mut self) {
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_endpoint_resolves_against_stream_url() {
        let base = Url::parse("http://127.0.0.1:7000/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/messages?session=abc").unwrap().as_str(),
            "http://127.0.0.1:7000/messages?session=abc"
        );
        assert_eq!(
            resolve_endpoint(&base, " messages \n").unwrap().as_str(),
            "http://127.0.0.1:7000/messages"
        );
    }

    #[test]
    fn absolute_endpoint_is_used_as_is() {
        let base = Url::parse("http://127.0.0.1:7000/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "http://10.0.0.5:9000/rpc").unwrap().as_str(),
            "http://10.0.0.5:9000/rpc"
        );
    }

    #[tokio::test]
    async fn invalid_url_is_transport_error() {
        let transport = SseTransport::new(
            "search",
            StreamSpec {
                url: "not a url".into(),
                timeout_ms: 100,
                trust: true,
            },
        );
        let err = transport.open().await.expect_err("bad url must fail");
        assert!(matches!(err, HubError::Transport { server, .. } if server == "search"));
    }
}
