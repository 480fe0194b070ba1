//! Per-connection health loop: probe while ready, reopen with capped
//! exponential backoff otherwise.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{ConnectionChange, ConnectionObserver, ConnectionState, ManagedConnection};
use crate::config::HealthSettings;
use crate::error::{HubError, Result};
use crate::registry::ServerDescriptor;
use crate::rpc::RemoteTool;
use crate::transport::{Connector, ToolSession};
use crate::util::backoff::Backoff;
use crate::util::timeout::with_timeout;

#[derive(Clone)]
pub(crate) struct HealthContext {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) settings: HealthSettings,
    pub(crate) observer: Arc<dyn ConnectionObserver>,
    pub(crate) revision: watch::Receiver<u64>,
}

/// Open a session and list its tools, bounded by the connect timeout.
pub(crate) async fn connect_once(
    ctx: &HealthContext,
    descriptor: &ServerDescriptor,
) -> Result<(Arc<dyn ToolSession>, Vec<RemoteTool>)> {
    let attempt = async {
        let session = ctx.connector.open(descriptor).await?;
        match session.list_tools().await {
            Ok(tools) => Ok((session, tools)),
            Err(err) => {
                let _ = session.close().await;
                Err(err)
            }
        }
    };
    with_timeout(ctx.settings.connect_timeout, attempt)
        .await
        .map_err(|err| match err {
            HubError::Timeout(ms) => HubError::transport(
                &descriptor.name,
                format!("connect timed out after {ms}ms"),
            ),
            other => other,
        })
}

/// First attempt, awaited by reconciliation. Abandoned if the connection
/// is retired meanwhile.
pub(crate) async fn initial_connect(conn: &Arc<ManagedConnection>, ctx: &HealthContext) {
    let outcome = tokio::select! {
        _ = conn.cancel_token().cancelled() => return,
        outcome = connect_once(ctx, conn.descriptor()) => outcome,
    };
    match outcome {
        Ok((session, tools)) => {
            let count = tools.len();
            if install(conn, ctx, Arc::clone(&session), tools).await {
                tracing::info!(server = %conn.name(), tools = count, "connection ready");
            } else {
                let _ = session.close().await;
            }
        }
        Err(err) => {
            tracing::warn!(server = %conn.name(), error = %err, "initial connection attempt failed");
            note_failure(conn, ctx);
        }
    }
}

/// Background loop owned by one connection; exits on cancellation or when
/// the reopen budget runs out.
pub(crate) async fn run(conn: Arc<ManagedConnection>, ctx: HealthContext) {
    let settings = ctx.settings.clone();
    let cancel = conn.cancel_token().clone();
    let mut backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);

    loop {
        let live = conn.live_session();
        let delay = match (conn.state(), live.is_some()) {
            (ConnectionState::Ready, true) => {
                backoff.reset();
                settings.interval
            }
            (ConnectionState::Ready, false) => std::time::Duration::ZERO,
            _ => backoff.next_delay(),
        };
        drop(live);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let keep_going = match conn.live_session() {
            Some(session) => {
                tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = probe(&conn, &ctx, session) => true,
                }
            }
            None => reopen(&conn, &ctx, &cancel).await,
        };
        if !keep_going {
            break;
        }
    }
    tracing::debug!(server = %conn.name(), "health loop stopped");
}

async fn probe(conn: &Arc<ManagedConnection>, ctx: &HealthContext, session: Arc<dyn ToolSession>) {
    let probe_timeout = ctx.settings.probe_timeout;
    match with_timeout(probe_timeout, session.ping()).await {
        Ok(()) if conn.state() == ConnectionState::Degraded => {
            match with_timeout(probe_timeout, session.list_tools()).await {
                Ok(tools) => {
                    if install(conn, ctx, session, tools).await {
                        tracing::info!(server = %conn.name(), "connection recovered");
                    }
                }
                Err(err) => {
                    tracing::warn!(server = %conn.name(), error = %err, "catalog refresh failed");
                    note_failure(conn, ctx);
                }
            }
        }
        Ok(()) => conn.record_success(),
        Err(err) => {
            if session.is_closed() {
                if conn.mark_closed() {
                    tracing::info!(server = %conn.name(), "connection lost");
                    notify_unavailable(conn, ctx);
                }
                return;
            }
            tracing::warn!(server = %conn.name(), error = %err, "health probe failed");
            note_failure(conn, ctx);
        }
    }
}

/// Returns false once the loop should stop.
async fn reopen(
    conn: &Arc<ManagedConnection>,
    ctx: &HealthContext,
    cancel: &CancellationToken,
) -> bool {
    if conn.mark_closed() {
        tracing::info!(server = %conn.name(), "connection lost");
        notify_unavailable(conn, ctx);
    }

    let attempt = conn.note_reopen_attempt();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return false,
        outcome = connect_once(ctx, conn.descriptor()) => outcome,
    };

    match outcome {
        Ok((session, tools)) => {
            let count = tools.len();
            if !install(conn, ctx, Arc::clone(&session), tools).await {
                let _ = session.close().await;
                return false;
            }
            tracing::info!(server = %conn.name(), attempt, tools = count, "connection re-established");
            true
        }
        Err(err) => {
            tracing::warn!(server = %conn.name(), attempt, error = %err, "reconnect failed");
            note_failure(conn, ctx);
            match ctx.settings.max_reopen_attempts {
                Some(max) if attempt >= max => {
                    let revision = *ctx.revision.borrow();
                    if let Some(session) = conn.mark_exhausted(revision) {
                        let _ = session.close().await;
                    }
                    tracing::warn!(
                        server = %conn.name(),
                        attempts = attempt,
                        "reopen budget exhausted, waiting for a registry change"
                    );
                    notify_unavailable(conn, ctx);
                    false
                }
                _ => true,
            }
        }
    }
}

/// Returns false when the connection was retired first; `session` was not
/// installed then.
async fn install(
    conn: &Arc<ManagedConnection>,
    ctx: &HealthContext,
    session: Arc<dyn ToolSession>,
    tools: Vec<RemoteTool>,
) -> bool {
    match conn.publish_ready(ctx.observer.as_ref(), session, tools) {
        Ok(Some(previous)) => {
            let _ = previous.close().await;
            true
        }
        Ok(None) => true,
        Err(_) => false,
    }
}

fn note_failure(conn: &Arc<ManagedConnection>, ctx: &HealthContext) {
    if conn.record_failure(ctx.settings.failure_threshold) {
        tracing::warn!(
            server = %conn.name(),
            state = %ConnectionState::Degraded,
            "connection degraded"
        );
        notify_unavailable(conn, ctx);
    }
}

fn notify_unavailable(conn: &Arc<ManagedConnection>, ctx: &HealthContext) {
    ctx.observer.connection_changed(ConnectionChange::Unavailable {
        server: conn.name().to_string(),
    });
}
