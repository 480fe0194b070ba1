//! CLI entry point for toolhub.

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::client_config::ClientKind;

/// toolhub CLI
#[derive(Parser, Debug)]
#[command(name = "toolhub", version, about = "toolhub: one tool catalog over many tool servers")]
pub struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Registry directory override
    #[arg(long, global = true)]
    pub servers_dir: Option<PathBuf>,

    /// Per-user registry partition
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage registered servers
    Servers(ServersArgs),
    /// Print the merged tool catalog
    Tools,
    /// Call one tool and print the result
    Call(CallArgs),
    /// Print aggregate health
    Health,
    /// Generate a client configuration document
    Config(ConfigArgs),
}

/// Arguments for the `servers` subcommand group.
#[derive(Parser, Debug)]
pub struct ServersArgs {
    #[command(subcommand)]
    pub command: ServersCommands,
}

#[derive(Subcommand, Debug)]
pub enum ServersCommands {
    /// List registered servers
    List,
    /// Register a server from a descriptor file
    Add {
        /// Path to a JSON descriptor
        file: PathBuf,
    },
    /// Enable a server
    Enable { name: String },
    /// Disable a server
    Disable { name: String },
    /// Remove a server
    Remove { name: String },
    /// Print total/enabled/disabled counts
    Summary,
}

/// Arguments for `toolhub call`.
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Qualified tool name (server.tool)
    pub name: String,

    /// JSON arguments
    #[arg(long, default_value = "{}")]
    pub args: String,

    /// Deadline for the call in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Arguments for `toolhub config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Client kind (gemini-cli, claude-desktop, vscode, agent)
    pub kind: ClientKind,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parse_servers_add() {
        let cli = Cli::try_parse_from(["toolhub", "servers", "add", "files.json"]).unwrap();
        match cli.command {
            Commands::Servers(servers) => match servers.command {
                ServersCommands::Add { file } => assert_eq!(file, PathBuf::from("files.json")),
                other => panic!("expected Add, got {other:?}"),
            },
            other => panic!("expected Servers, got {other:?}"),
        }
    }

    #[test]
    fn parse_call_with_defaults() {
        let cli = Cli::try_parse_from(["toolhub", "call", "files.read"]).unwrap();
        match cli.command {
            Commands::Call(args) => {
                assert_eq!(args.name, "files.read");
                assert_eq!(args.args, "{}");
                assert!(args.timeout_ms.is_none());
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "toolhub",
            "health",
            "--servers-dir",
            "/tmp/servers",
            "--user",
            "alice",
            "--log-json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Health));
        assert_eq!(cli.servers_dir, Some(PathBuf::from("/tmp/servers")));
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert!(cli.log_json);
    }

    #[test]
    fn parse_config_kind() {
        let cli = Cli::try_parse_from(["toolhub", "config", "claude-desktop", "-o", "out.json"]).unwrap();
        match cli.command {
            Commands::Config(args) => {
                assert_eq!(args.kind, ClientKind::ClaudeDesktop);
                assert_eq!(args.output, Some(PathBuf::from("out.json")));
            }
            other => panic!("expected Config, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_client_kind_is_error() {
        assert!(Cli::try_parse_from(["toolhub", "config", "cursor"]).is_err());
    }

    #[test]
    fn parse_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["toolhub"]).is_err());
    }
}
