//! The hub facade: wires registry, connections, built-ins and routing, and
//! exposes the administrative surface.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::task::JoinHandle;

use crate::client_config::ConfigGenerator;
use crate::config::HubConfig;
use crate::connection::{ConnectionManager, ConnectionState, ReconcileReport};
use crate::error::Result;
use crate::registry::{RegistrySummary, ServerDescriptor, ServerRegistry, TransportKind};
use crate::router::{CatalogIndex, ToolRouter};
use crate::tools::{BuiltinToolProvider, ToolCallRequest, ToolCallResult, ToolDescriptor};
use crate::transport::{Connector, TransportConnector};

/// One configured server with its live connection state, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub transport: TransportKind,
    /// `None` when no connection is managed (disabled, or not yet reconciled).
    pub state: Option<ConnectionState>,
    pub tools: usize,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

/// Aggregate reachability for deployment tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub configured: usize,
    pub enabled: usize,
    pub reachable: usize,
    pub status: HealthStatus,
}

impl HealthReport {
    fn from_counts(summary: RegistrySummary, reachable: usize) -> Self {
        let status = if reachable >= summary.enabled {
            HealthStatus::Ok
        } else if reachable == 0 {
            HealthStatus::Down
        } else {
            HealthStatus::Degraded
        };
        Self {
            configured: summary.total,
            enabled: summary.enabled,
            reachable,
            status,
        }
    }
}

/// A running hub.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use toolhub::prelude::*;
///
/// # async fn example() -> toolhub::Result<()> {
/// let hub = Hub::start(HubConfig::load(None)?).await?;
/// for tool in hub.catalog().iter() {
///     println!("{}", tool.qualified_name);
/// }
/// let result = hub
///     .call(ToolCallRequest::new("hub.memory_recall", serde_json::json!({}), Duration::from_secs(5)))
///     .await;
/// println!("{}", serde_json::to_string(&result)?);
/// hub.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Hub {
    config: HubConfig,
    registry: Arc<ServerRegistry>,
    manager: Arc<ConnectionManager>,
    router: ToolRouter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Start with the real subprocess and stream transports.
    pub async fn start(config: HubConfig) -> Result<Self> {
        Self::start_with_connector(config, Arc::new(TransportConnector)).await
    }

    pub async fn start_with_connector(config: HubConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ServerRegistry::open(config.registry_config())?);
        let catalog = Arc::new(CatalogIndex::new());
        let manager = Arc::new(
            ConnectionManager::new(Arc::clone(&registry), config.health.clone())
                .with_connector(connector)
                .with_observer(catalog.clone()),
        );
        let builtins = Arc::new(BuiltinToolProvider::from_settings(
            &config.builtins,
            Arc::clone(&manager),
        )?);
        let router = ToolRouter::new(Arc::clone(&manager), catalog, builtins);

        let report = manager.reconcile().await?;
        tracing::info!(
            dir = %registry.dir().display(),
            opened = report.opened.len(),
            ready = manager.ready_count(),
            "hub started"
        );

        let tasks = vec![
            manager.watch_registry(),
            spawn_periodic_reconcile(Arc::clone(&manager), config.reconcile_interval),
        ];

        Ok(Self {
            config,
            registry,
            manager,
            router,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Every configured server, sorted by name, with its live state.
    pub fn list_servers(&self) -> Result<Vec<ServerStatus>> {
        let descriptors = self.registry.load_all()?;
        Ok(descriptors
            .into_iter()
            .map(|descriptor| {
                let conn = self.manager.connection(&descriptor.name);
                ServerStatus {
                    transport: descriptor.transport_kind(),
                    state: conn.as_ref().map(|c| c.state),
                    tools: conn.as_ref().map_or(0, |c| c.tool_catalog.len()),
                    consecutive_failures: conn.as_ref().map_or(0, |c| c.consecutive_failures),
                    name: descriptor.name,
                    description: descriptor.description,
                    enabled: descriptor.enabled,
                }
            })
            .collect())
    }

    pub async fn add_server(&self, descriptor_json: &str) -> Result<ServerDescriptor> {
        let descriptor = self.registry.add(descriptor_json)?;
        self.settle(&descriptor.name).await?;
        Ok(descriptor)
    }

    pub async fn update_server(&self, descriptor_json: &str) -> Result<ServerDescriptor> {
        let descriptor = self.registry.update(descriptor_json)?;
        self.settle(&descriptor.name).await?;
        Ok(descriptor)
    }

    pub async fn enable_server(&self, name: &str) -> Result<()> {
        self.registry.enable(name)?;
        self.settle(name).await
    }

    pub async fn disable_server(&self, name: &str) -> Result<()> {
        self.registry.disable(name)?;
        self.settle(name).await
    }

    pub async fn remove_server(&self, name: &str) -> Result<()> {
        self.registry.remove(name)?;
        self.settle(name).await
    }

    /// Reconcile, then wait until any pass still working on `name` is done,
    /// so the change is live when an admin call returns.
    async fn settle(&self, name: &str) -> Result<()> {
        self.manager.reconcile().await?;
        self.manager.settled(name).await;
        Ok(())
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.manager.reconcile().await
    }

    pub fn summary(&self) -> Result<RegistrySummary> {
        self.registry.summary()
    }

    pub fn health(&self) -> Result<HealthReport> {
        Ok(HealthReport::from_counts(
            self.registry.summary()?,
            self.manager.ready_count(),
        ))
    }

    pub fn catalog(&self) -> Arc<Vec<ToolDescriptor>> {
        self.router.catalog()
    }

    pub async fn call(&self, request: ToolCallRequest) -> ToolCallResult {
        self.router.call(request).await
    }

    /// Call with the configured default timeout.
    pub async fn call_tool(&self, qualified_name: &str, arguments: serde_json::Value) -> ToolCallResult {
        self.call(ToolCallRequest::new(
            qualified_name,
            arguments,
            self.config.default_call_timeout,
        ))
        .await
    }

    pub fn config_generator(&self) -> ConfigGenerator {
        ConfigGenerator::new(
            Arc::clone(&self.registry),
            self.config.address.clone(),
            self.config.clients.clone(),
        )
    }

    /// Stop background tasks and close every connection.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("hub stopped");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry.dir())
            .field("router", &self.router)
            .finish()
    }
}

fn spawn_periodic_reconcile(manager: Arc<ConnectionManager>, every: Duration) -> JoinHandle<()> {
    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = manager.reconcile().await {
                        tracing::warn!(error = %err, "periodic reconciliation failed");
                    }
                }
            }
        }
    })
}
