//! Connection manager: keeps one live session per enabled descriptor.
//!
//! The manager owns every [`ManagedConnection`]. Callers only ever see cloned
//! [`Connection`] snapshots or a short-lived [`CallPermit`].

pub mod health;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HealthSettings;
use crate::error::Result;
use crate::registry::{ServerDescriptor, ServerRegistry};
use crate::rpc::RemoteTool;
use crate::transport::{Connector, ToolSession, TransportConnector};

use health::HealthContext;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub server_name: String,
    pub state: ConnectionState,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub tool_catalog: Vec<RemoteTool>,
    pub consecutive_failures: u32,
}

/// Emitted whenever a connection's routability changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionChange {
    /// Routable, with a freshly listed catalog.
    Ready { server: String, tools: Vec<RemoteTool> },
    /// Still owned by the manager but excluded from routing.
    Unavailable { server: String },
    /// Torn down after disable or removal.
    Removed { server: String },
}

impl ConnectionChange {
    pub fn server(&self) -> &str {
        match self {
            Self::Ready { server, .. } | Self::Unavailable { server } | Self::Removed { server } => {
                server
            }
        }
    }
}

/// Receives connection changes, e.g. to maintain a merged catalog.
pub trait ConnectionObserver: Send + Sync {
    fn connection_changed(&self, change: ConnectionChange);
}

struct NoopObserver;

impl ConnectionObserver for NoopObserver {
    fn connection_changed(&self, _change: ConnectionChange) {}
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

struct ConnectionInner {
    state: ConnectionState,
    session: Option<Arc<dyn ToolSession>>,
    last_health_check_at: Option<DateTime<Utc>>,
    catalog: Vec<RemoteTool>,
    failures: u32,
    reopen_attempts: u32,
    exhausted_at_revision: Option<u64>,
}

/// Live record for one enabled server. Only the manager and the
/// connection's own health task touch it.
pub(crate) struct ManagedConnection {
    descriptor: ServerDescriptor,
    inner: RwLock<ConnectionInner>,
    in_flight: AtomicUsize,
    drained: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Orders `Ready` announcements against `Removed`.
    announce: Mutex<()>,
}

impl ManagedConnection {
    fn new(descriptor: ServerDescriptor, cancel: CancellationToken) -> Self {
        Self {
            descriptor,
            inner: RwLock::new(ConnectionInner {
                state: ConnectionState::Connecting,
                session: None,
                last_health_check_at: None,
                catalog: Vec::new(),
                failures: 0,
                reopen_attempts: 0,
                exhausted_at_revision: None,
            }),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            cancel,
            task: Mutex::new(None),
            announce: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ConnectionInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConnectionInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.read().state
    }

    pub(crate) fn snapshot(&self) -> Connection {
        let inner = self.read();
        Connection {
            server_name: self.descriptor.name.clone(),
            state: inner.state,
            last_health_check_at: inner.last_health_check_at,
            tool_catalog: inner.catalog.clone(),
            consecutive_failures: inner.failures,
        }
    }

    /// The session, if one exists and its channel is still open.
    pub(crate) fn live_session(&self) -> Option<Arc<dyn ToolSession>> {
        self.read()
            .session
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Stop the connection and announce its removal. Once this returns,
    /// [`publish_ready`](Self::publish_ready) refuses every session.
    pub(crate) fn retire(&self, observer: &dyn ConnectionObserver) {
        let _order = self.announce.lock().unwrap_or_else(|p| p.into_inner());
        self.cancel.cancel();
        observer.connection_changed(ConnectionChange::Removed {
            server: self.descriptor.name.clone(),
        });
    }

    /// Install `session` and announce the catalog, unless the connection was
    /// retired first. On refusal the caller gets the session back.
    pub(crate) fn publish_ready(
        &self,
        observer: &dyn ConnectionObserver,
        session: Arc<dyn ToolSession>,
        catalog: Vec<RemoteTool>,
    ) -> std::result::Result<Option<Arc<dyn ToolSession>>, Arc<dyn ToolSession>> {
        let _order = self.announce.lock().unwrap_or_else(|p| p.into_inner());
        if self.cancel.is_cancelled() {
            return Err(session);
        }
        let previous = self.mark_ready(session, catalog.clone());
        observer.connection_changed(ConnectionChange::Ready {
            server: self.descriptor.name.clone(),
            tools: catalog,
        });
        Ok(previous)
    }

    /// Install a fresh session and catalog. Returns the replaced session.
    fn mark_ready(
        &self,
        session: Arc<dyn ToolSession>,
        catalog: Vec<RemoteTool>,
    ) -> Option<Arc<dyn ToolSession>> {
        let mut inner = self.write();
        inner.state = ConnectionState::Ready;
        inner.catalog = catalog;
        inner.failures = 0;
        inner.reopen_attempts = 0;
        inner.exhausted_at_revision = None;
        inner.last_health_check_at = Some(Utc::now());
        let fresh = Arc::as_ptr(&session) as *const ();
        inner
            .session
            .replace(session)
            .filter(|previous| Arc::as_ptr(previous) as *const () != fresh)
    }

    /// Record pipe or stream loss on a ready connection. Returns true if the
    /// connection was routable until now.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut inner = self.write();
        if inner.state != ConnectionState::Ready {
            return false;
        }
        inner.state = ConnectionState::Closed;
        inner.catalog.clear();
        true
    }

    /// Count one failed probe or reopen. Returns true on the transition into
    /// `Degraded`.
    pub(crate) fn record_failure(&self, threshold: u32) -> bool {
        let mut inner = self.write();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_health_check_at = Some(Utc::now());
        if inner.failures >= threshold && inner.state != ConnectionState::Degraded {
            inner.state = ConnectionState::Degraded;
            inner.catalog.clear();
            return true;
        }
        false
    }

    pub(crate) fn record_success(&self) {
        let mut inner = self.write();
        inner.failures = 0;
        inner.last_health_check_at = Some(Utc::now());
    }

    /// Bump and return the reopen attempt counter.
    pub(crate) fn note_reopen_attempt(&self) -> u32 {
        let mut inner = self.write();
        inner.reopen_attempts = inner.reopen_attempts.saturating_add(1);
        inner.reopen_attempts
    }

    /// Give up until the registry moves past `revision`.
    pub(crate) fn mark_exhausted(&self, revision: u64) -> Option<Arc<dyn ToolSession>> {
        let mut inner = self.write();
        inner.state = ConnectionState::Closed;
        inner.catalog.clear();
        inner.exhausted_at_revision = Some(revision);
        inner.session.take()
    }

    fn exhausted_at_revision(&self) -> Option<u64> {
        self.read().exhausted_at_revision
    }

    fn take_session(&self) -> Option<Arc<dyn ToolSession>> {
        let mut inner = self.write();
        inner.state = ConnectionState::Closed;
        inner.catalog.clear();
        inner.session.take()
    }

    fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let inner = self.read();
        if inner.state != ConnectionState::Ready {
            return None;
        }
        let session = inner.session.as_ref().filter(|s| !s.is_closed())?.clone();
        let catalog = inner.catalog.iter().map(|t| t.name.clone()).collect();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(CallPermit {
            connection: Arc::clone(self),
            session,
            tools: catalog,
        })
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Right to issue one call on a ready connection. Disabling a server waits
/// for outstanding permits before releasing the session.
pub struct CallPermit {
    connection: Arc<ManagedConnection>,
    session: Arc<dyn ToolSession>,
    tools: Vec<String>,
}

impl CallPermit {
    pub fn session(&self) -> &Arc<dyn ToolSession> {
        &self.session
    }

    pub fn server_name(&self) -> &str {
        self.connection.name()
    }

    /// Whether the connection's last listing included `tool`.
    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.connection.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.connection.drained.notify_waiters();
        }
    }
}

/// Owns the mapping from enabled descriptors to live connections.
pub struct ConnectionManager {
    registry: Arc<ServerRegistry>,
    connector: Arc<dyn Connector>,
    settings: HealthSettings,
    observer: Arc<dyn ConnectionObserver>,
    connections: RwLock<HashMap<String, Arc<ManagedConnection>>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    server_locks: Mutex<HashMap<String, ServerLock>>,
    shutdown: CancellationToken,
}

type ServerLock = Arc<tokio::sync::Mutex<()>>;

/// Work planned for one server in a reconciliation pass. The guard keeps
/// every other pass off this server until the step finishes.
struct ServerStep {
    guard: OwnedMutexGuard<()>,
    close: Option<Arc<ManagedConnection>>,
    open: Option<Arc<ManagedConnection>>,
}

#[derive(Default)]
struct PassPlan {
    steps: Vec<ServerStep>,
    unchanged: Vec<String>,
    busy: Vec<ServerLock>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<ServerRegistry>, settings: HealthSettings) -> Self {
        Self {
            registry,
            connector: Arc::new(TransportConnector),
            settings,
            observer: Arc::new(NoopObserver),
            connections: RwLock::new(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            server_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    fn map(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ManagedConnection>>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn map_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ManagedConnection>>> {
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn server_lock(&self, server: &str) -> ServerLock {
        let mut locks = self
            .server_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(server.to_string()).or_default())
    }

    /// Bring live connections into agreement with enabled descriptors.
    ///
    /// The diff is taken under a short global lock. Closing and opening then
    /// run behind each server's own guard, so a slow drain or handshake only
    /// holds up work on that server. A server another pass is still working
    /// on is waited for and diffed again. Each newly opened server's first
    /// connection attempt is awaited.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        loop {
            let plan = {
                let _pass = self.reconcile_lock.lock().await;
                if self.shutdown.is_cancelled() {
                    return Ok(report);
                }
                self.plan_pass()?
            };
            report.unchanged = plan.unchanged;

            let steps = join_all(plan.steps.into_iter().map(|step| self.run_step(step)));
            let waits = join_all(plan.busy.iter().map(|lock| async move {
                drop(lock.lock().await);
            }));
            let (outcomes, _) = futures::join!(steps, waits);
            for (closed, opened) in outcomes {
                report.closed.extend(closed);
                report.opened.extend(opened);
            }
            if plan.busy.is_empty() {
                break;
            }
        }

        report.opened.sort();
        report.closed.sort();
        report.unchanged.sort();
        if !report.is_noop() {
            tracing::info!(
                opened = ?report.opened,
                closed = ?report.closed,
                unchanged = report.unchanged.len(),
                "reconciliation complete"
            );
        }
        Ok(report)
    }

    /// Diff the registry against the map. Stale connections leave the map
    /// and are retired here; new ones are claimed in `Connecting` state.
    fn plan_pass(&self) -> Result<PassPlan> {
        let revision = self.registry.revision();
        let mut desired: HashMap<String, ServerDescriptor> = self
            .registry
            .load_all()?
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut plan = PassPlan::default();
        let mut map = self.map_mut();
        let current: Vec<(String, Arc<ManagedConnection>)> = map
            .iter()
            .map(|(name, conn)| (name.clone(), Arc::clone(conn)))
            .collect();
        for (name, conn) in current {
            let wanted = desired.remove(&name);
            let lock = self.server_lock(&name);
            let Ok(guard) = Arc::clone(&lock).try_lock_owned() else {
                plan.busy.push(lock);
                continue;
            };
            let retry_exhausted = conn
                .exhausted_at_revision()
                .is_some_and(|at| at != revision);
            if wanted
                .as_ref()
                .is_some_and(|d| *d == conn.descriptor && !retry_exhausted)
            {
                plan.unchanged.push(name);
                continue;
            }
            map.remove(&name);
            conn.retire(self.observer.as_ref());
            let open = wanted.map(|descriptor| self.claim(&mut map, descriptor));
            plan.steps.push(ServerStep {
                guard,
                close: Some(conn),
                open,
            });
        }

        for (name, descriptor) in desired {
            let lock = self.server_lock(&name);
            let Ok(guard) = Arc::clone(&lock).try_lock_owned() else {
                plan.busy.push(lock);
                continue;
            };
            plan.steps.push(ServerStep {
                guard,
                close: None,
                open: Some(self.claim(&mut map, descriptor)),
            });
        }
        Ok(plan)
    }

    fn claim(
        &self,
        map: &mut HashMap<String, Arc<ManagedConnection>>,
        descriptor: ServerDescriptor,
    ) -> Arc<ManagedConnection> {
        let conn = Arc::new(ManagedConnection::new(
            descriptor,
            self.shutdown.child_token(),
        ));
        map.insert(conn.name().to_string(), Arc::clone(&conn));
        conn
    }

    /// Returns the names closed and opened.
    async fn run_step(&self, step: ServerStep) -> (Option<String>, Option<String>) {
        let ServerStep { guard, close, open } = step;
        let mut closed = None;
        if let Some(conn) = close {
            self.release(&conn).await;
            closed = Some(conn.name().to_string());
        }
        let mut opened = None;
        if let Some(conn) = open {
            self.open_connection(&conn).await;
            opened = Some(conn.name().to_string());
        }
        drop(guard);
        (closed, opened)
    }

    async fn open_connection(&self, conn: &Arc<ManagedConnection>) {
        let ctx = self.health_context();
        health::initial_connect(conn, &ctx).await;
        if conn.cancel.is_cancelled() {
            return;
        }
        let handle = tokio::spawn(health::run(Arc::clone(conn), ctx));
        *conn.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Drain in-flight calls, stop the health task and release the session
    /// of a retired connection.
    async fn release(&self, conn: &Arc<ManagedConnection>) {
        let deadline = tokio::time::Instant::now() + self.settings.drain_timeout;
        loop {
            let drained = conn.drained.notified();
            let outstanding = conn.in_flight.load(Ordering::SeqCst);
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                tracing::warn!(
                    server = %conn.name(),
                    in_flight = conn.in_flight.load(Ordering::SeqCst),
                    "drain timeout elapsed, closing with calls outstanding"
                );
                break;
            }
        }

        let task = conn.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(server = %conn.name(), error = %err, "health task panicked");
                }
            }
        }

        if let Some(session) = conn.take_session() {
            if let Err(err) = session.close().await {
                tracing::warn!(server = %conn.name(), error = %err, "failed to close session");
            }
        }
        tracing::info!(server = %conn.name(), "connection closed");
    }

    /// Wait until no reconciliation step is working on `server`.
    pub async fn settled(&self, server: &str) {
        let lock = self.server_lock(server);
        drop(lock.lock().await);
    }

    fn health_context(&self) -> HealthContext {
        HealthContext {
            connector: Arc::clone(&self.connector),
            settings: self.settings.clone(),
            observer: Arc::clone(&self.observer),
            revision: self.registry.subscribe(),
        }
    }

    /// A permit for one call, or `None` when the server is not routable.
    pub fn acquire(&self, server: &str) -> Option<CallPermit> {
        let conn = self.map().get(server).cloned()?;
        conn.try_acquire()
    }

    pub fn connection(&self, server: &str) -> Option<Connection> {
        self.map().get(server).map(|conn| conn.snapshot())
    }

    /// Snapshots of every managed connection, sorted by server name.
    pub fn connections(&self) -> Vec<Connection> {
        let mut snapshots: Vec<Connection> = self.map().values().map(|c| c.snapshot()).collect();
        snapshots.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        snapshots
    }

    pub fn ready_count(&self) -> usize {
        self.map()
            .values()
            .filter(|c| c.state() == ConnectionState::Ready)
            .count()
    }

    /// Reconcile on every registry revision until shutdown.
    pub fn watch_registry(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut revisions = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if let Err(err) = manager.reconcile().await {
                            tracing::warn!(error = %err, "registry-triggered reconciliation failed");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every connection and stop background tasks. Steps already
    /// running in other passes are waited for.
    pub async fn shutdown(&self) {
        let mut retired: HashMap<String, Arc<ManagedConnection>> = {
            let _pass = self.reconcile_lock.lock().await;
            self.shutdown.cancel();
            let all: HashMap<String, Arc<ManagedConnection>> = self.map_mut().drain().collect();
            for conn in all.values() {
                conn.retire(self.observer.as_ref());
            }
            all
        };
        let locks: Vec<(String, ServerLock)> = self
            .server_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, lock)| (name.clone(), Arc::clone(lock)))
            .collect();
        join_all(locks.into_iter().map(|(name, lock)| {
            let conn = retired.remove(&name);
            async move {
                let _guard = lock.lock().await;
                if let Some(conn) = conn {
                    self.release(&conn).await;
                }
            }
        }))
        .await;
    }
}
