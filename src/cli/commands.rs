//! CLI command handlers.
//!
//! Registry and config commands work on the registry directly; `tools`,
//! `call` and `health` start a hub, wait for the first reconciliation, and
//! shut it down again.

use std::sync::Arc;
use std::time::Duration;

use super::{CallArgs, Cli, ConfigArgs, ServersCommands};
use crate::client_config::ConfigGenerator;
use crate::config::HubConfig;
use crate::hub::Hub;
use crate::registry::ServerRegistry;
use crate::tools::ToolCallRequest;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Load config from file and environment, then apply command-line overrides.
pub fn load_config(cli: &Cli) -> crate::Result<HubConfig> {
    let mut config = HubConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.servers_dir {
        config.servers_dir = dir.clone();
    }
    if let Some(user) = &cli.user {
        config.user = Some(user.clone());
    }
    Ok(config)
}

/// Handle `toolhub servers ...`.
pub fn handle_servers(config: &HubConfig, command: ServersCommands) -> CliResult {
    let registry = ServerRegistry::open(config.registry_config())?;
    match command {
        ServersCommands::List => {
            let descriptors = registry.load_all()?;
            if descriptors.is_empty() {
                println!("No servers registered in {}", registry.dir().display());
            }
            for descriptor in descriptors {
                let status = if descriptor.enabled { "enabled" } else { "disabled" };
                println!(
                    "{:<24} {:<10} {:<9} {}",
                    descriptor.name,
                    descriptor.transport_kind(),
                    status,
                    descriptor.description
                );
            }
        }
        ServersCommands::Add { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let descriptor = registry.add(&raw)?;
            println!("Added {} ({})", descriptor.name, descriptor.transport_kind());
        }
        ServersCommands::Enable { name } => {
            registry.enable(&name)?;
            println!("Enabled {name}");
        }
        ServersCommands::Disable { name } => {
            registry.disable(&name)?;
            println!("Disabled {name}");
        }
        ServersCommands::Remove { name } => {
            registry.remove(&name)?;
            println!("Removed {name}");
        }
        ServersCommands::Summary => {
            let summary = registry.summary()?;
            println!(
                "total: {}  enabled: {}  disabled: {}",
                summary.total, summary.enabled, summary.disabled
            );
        }
    }
    Ok(())
}

/// Handle `toolhub tools`.
pub async fn handle_tools(config: HubConfig) -> CliResult {
    let hub = Hub::start(config).await?;
    for tool in hub.catalog().iter() {
        println!("{:<40} {}", tool.qualified_name, tool.description);
    }
    hub.shutdown().await;
    Ok(())
}

/// Handle `toolhub call <name>`. Exits non-zero when the call failed.
pub async fn handle_call(config: HubConfig, args: CallArgs) -> CliResult {
    let arguments: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| format!("--args must be valid JSON: {e}"))?;
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.default_call_timeout);

    let hub = Hub::start(config).await?;
    let result = hub
        .call(ToolCallRequest::new(args.name, arguments, timeout))
        .await;
    hub.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(2);
    }
    Ok(())
}

/// Handle `toolhub health`.
pub async fn handle_health(config: HubConfig) -> CliResult {
    let hub = Hub::start(config).await?;
    let report = hub.health()?;
    let servers = hub.list_servers()?;
    hub.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    for server in servers.iter().filter(|s| s.enabled) {
        let state = server
            .state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unmanaged".to_string());
        eprintln!("  {:<24} {:<10} {} tools", server.name, state, server.tools);
    }
    Ok(())
}

/// Handle `toolhub config <kind>`.
pub fn handle_config(config: &HubConfig, args: ConfigArgs) -> CliResult {
    let registry = Arc::new(ServerRegistry::open(config.registry_config())?);
    let generator =
        ConfigGenerator::new(registry, config.address.clone(), config.clients.clone());
    match args.output {
        Some(path) => {
            let written = generator.write(args.kind, &path)?;
            println!("Wrote {} config to {}", args.kind, written.display());
        }
        None => {
            let document = generator.generate(args.kind)?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
    }
    Ok(())
}
