//! toolhub: a gateway that fronts many tool servers behind one catalog.
//!
//! Backend servers are described by JSON descriptor files in a registry
//! directory. The hub keeps one connection per enabled server (a subprocess
//! speaking line-delimited RPC, or an HTTP event stream), merges their tools
//! under `server.tool` names alongside a few in-process `hub.*` tools, and
//! routes each call to its owner under a hard deadline.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use toolhub::prelude::*;
//!
//! # async fn example() -> toolhub::Result<()> {
//! let hub = Hub::start(HubConfig::load(None)?).await?;
//! hub.add_server(r#"{"name":"files","description":"fs","command":"files-server"}"#)
//!     .await?;
//! let result = hub
//!     .call(ToolCallRequest::new(
//!         "files.read",
//!         serde_json::json!({"path": "README.md"}),
//!         Duration::from_secs(10),
//!     ))
//!     .await;
//! println!("{result:?}");
//! hub.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client_config;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod prelude;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod tools;
pub mod transport;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{ErrorKind, HubError, Result};
pub use hub::Hub;
