//! Client configuration documents pointing external agents at the hub.
//!
//! Each [`ClientKind`] consumes a differently shaped JSON document. All of
//! them name the same resolved [`HubAddress`]; none of them embeds secrets
//! or descriptor environment values.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use strum::{Display, EnumIter, EnumString};

use crate::config::{AddressSettings, ClientSettings};
use crate::error::{HubError, Result};
use crate::registry::{write_atomic, ServerRegistry};

/// Key the hub is registered under in every generated document.
pub const HUB_ID: &str = "toolhub";

/// Downstream consumers with their own document shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ClientKind {
    GeminiCli,
    ClaudeDesktop,
    Vscode,
    Agent,
}

/// Read-only view of the runtime environment.
pub trait EnvironmentProbe: Send + Sync {
    fn path_exists(&self, path: &Path) -> bool;
    fn var(&self, key: &str) -> Option<String>;
    fn read_to_string(&self, path: &Path) -> Option<String>;
}

/// Probe backed by the real filesystem and process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl EnvironmentProbe for SystemEnvironment {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

/// Whether the hub appears to run inside a container.
pub fn is_containerized(probe: &dyn EnvironmentProbe) -> bool {
    if probe.path_exists(Path::new("/.dockerenv")) {
        return true;
    }
    if probe
        .var("KUBERNETES_SERVICE_HOST")
        .is_some_and(|v| !v.is_empty())
    {
        return true;
    }
    probe
        .read_to_string(Path::new("/proc/1/cgroup"))
        .is_some_and(|cgroup| {
            ["docker", "kubepods", "containerd"]
                .iter()
                .any(|marker| cgroup.contains(marker))
        })
}

/// How the address was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AddressSource {
    Override,
    Container,
    Loopback,
}

/// The hub's externally reachable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubAddress {
    pub url: String,
    pub source: AddressSource,
}

/// Resolve the hub's address: operator override, then container network,
/// then loopback.
pub fn resolve_address(settings: &AddressSettings, probe: &dyn EnvironmentProbe) -> Result<HubAddress> {
    if let Some(public) = settings.public_url.as_deref() {
        reqwest::Url::parse(public).map_err(|e| {
            HubError::Configuration(format!("invalid public url '{public}': {e}"))
        })?;
        return Ok(HubAddress {
            url: public.to_string(),
            source: AddressSource::Override,
        });
    }

    let path = if settings.path.starts_with('/') {
        settings.path.clone()
    } else {
        format!("/{}", settings.path)
    };
    let (host, source) = if is_containerized(probe) {
        (settings.container_host.as_str(), AddressSource::Container)
    } else {
        ("127.0.0.1", AddressSource::Loopback)
    };
    Ok(HubAddress {
        url: format!("http://{host}:{}{path}", settings.port),
        source,
    })
}

/// Produces client documents from registry state and the resolved address.
pub struct ConfigGenerator {
    registry: Arc<ServerRegistry>,
    address: AddressSettings,
    clients: ClientSettings,
    probe: Arc<dyn EnvironmentProbe>,
}

impl ConfigGenerator {
    pub fn new(registry: Arc<ServerRegistry>, address: AddressSettings, clients: ClientSettings) -> Self {
        Self {
            registry,
            address,
            clients,
            probe: Arc::new(SystemEnvironment),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn EnvironmentProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn address(&self) -> Result<HubAddress> {
        resolve_address(&self.address, self.probe.as_ref())
    }

    /// Build the document for `kind`. Reads state only.
    pub fn generate(&self, kind: ClientKind) -> Result<Value> {
        let url = self.address()?.url;
        let timeout_ms = self.clients.timeout_ms;
        let trust = self.clients.trust;

        let document = match kind {
            ClientKind::GeminiCli => json!({
                "mcpServers": {
                    HUB_ID: { "url": url, "timeout": timeout_ms, "trust": trust }
                }
            }),
            ClientKind::ClaudeDesktop => json!({
                "mcpServers": {
                    HUB_ID: { "type": "sse", "url": url, "timeoutMs": timeout_ms, "trusted": trust }
                }
            }),
            ClientKind::Vscode => json!({
                "servers": {
                    HUB_ID: { "type": "sse", "url": url, "requestTimeout": timeout_ms, "trust": trust }
                }
            }),
            ClientKind::Agent => {
                let servers: Vec<String> = self
                    .registry
                    .load_all()?
                    .into_iter()
                    .filter(|d| d.enabled)
                    .map(|d| d.name)
                    .collect();
                json!({
                    "hub": {
                        "endpoint": url,
                        "timeout_seconds": timeout_ms.div_ceil(1000),
                        "trust": trust,
                    },
                    "servers": servers,
                })
            }
        };
        Ok(document)
    }

    /// Generate and atomically write the document for `kind` to `path`.
    pub fn write(&self, kind: ClientKind, path: &Path) -> Result<PathBuf> {
        let document = self.generate(kind)?;
        let mut contents = serde_json::to_string_pretty(&document)?;
        contents.push('\n');
        write_atomic(path, contents.as_bytes())?;
        tracing::info!(client = %kind, path = %path.display(), "client config written");
        Ok(path.to_path_buf())
    }
}

impl std::fmt::Debug for ConfigGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigGenerator")
            .field("address", &self.address)
            .field("clients", &self.clients)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use pretty_assertions::assert_eq;
    use std::collections::{HashMap, HashSet};
    use strum::IntoEnumIterator;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeEnvironment {
        paths: HashSet<PathBuf>,
        vars: HashMap<String, String>,
        files: HashMap<PathBuf, String>,
    }

    impl EnvironmentProbe for FakeEnvironment {
        fn path_exists(&self, path: &Path) -> bool {
            self.paths.contains(path)
        }

        fn var(&self, key: &str) -> Option<String> {
            self.vars.get(key).cloned()
        }

        fn read_to_string(&self, path: &Path) -> Option<String> {
            self.files.get(path).cloned()
        }
    }

    fn docker() -> FakeEnvironment {
        FakeEnvironment {
            paths: HashSet::from([PathBuf::from("/.dockerenv")]),
            ..Default::default()
        }
    }

    fn generator(dir: &TempDir, probe: FakeEnvironment) -> ConfigGenerator {
        let registry = Arc::new(ServerRegistry::open(RegistryConfig::new(dir.path())).unwrap());
        registry
            .add(r#"{"name":"files","description":"fs","command":"files-server","env":{"API_KEY":"secret"}}"#)
            .unwrap();
        registry
            .add(r#"{"name":"search","description":"web","url":"https://search.example/sse","enabled":false}"#)
            .unwrap();
        ConfigGenerator::new(registry, AddressSettings::default(), ClientSettings::default())
            .with_probe(Arc::new(probe))
    }

    #[test]
    fn container_markers_are_detected() {
        assert!(!is_containerized(&FakeEnvironment::default()));
        assert!(is_containerized(&docker()));

        let k8s = FakeEnvironment {
            vars: HashMap::from([("KUBERNETES_SERVICE_HOST".into(), "10.0.0.1".into())]),
            ..Default::default()
        };
        assert!(is_containerized(&k8s));

        let cgroup = FakeEnvironment {
            files: HashMap::from([(
                PathBuf::from("/proc/1/cgroup"),
                "0::/system.slice/containerd.service".into(),
            )]),
            ..Default::default()
        };
        assert!(is_containerized(&cgroup));
    }

    #[test]
    fn address_resolution_order() {
        let settings = AddressSettings::default();
        let local = resolve_address(&settings, &FakeEnvironment::default()).unwrap();
        assert_eq!(local.url, "http://127.0.0.1:8765/sse");
        assert_eq!(local.source, AddressSource::Loopback);

        let container = resolve_address(&settings, &docker()).unwrap();
        assert_eq!(container.url, "http://toolhub:8765/sse");
        assert_eq!(container.source, AddressSource::Container);

        let overridden = AddressSettings {
            public_url: Some("https://hub.example.com/sse".into()),
            ..AddressSettings::default()
        };
        let public = resolve_address(&overridden, &docker()).unwrap();
        assert_eq!(public.url, "https://hub.example.com/sse");
        assert_eq!(public.source, AddressSource::Override);

        let bare_host = AddressSettings {
            public_url: Some("https://hub.example.com".into()),
            ..AddressSettings::default()
        };
        assert_eq!(
            resolve_address(&bare_host, &docker()).unwrap().url,
            "https://hub.example.com"
        );

        let broken = AddressSettings {
            public_url: Some("not a url".into()),
            ..AddressSettings::default()
        };
        assert!(matches!(
            resolve_address(&broken, &docker()),
            Err(HubError::Configuration(_))
        ));
    }

    #[test]
    fn documents_match_each_client_shape() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir, FakeEnvironment::default());
        let url = "http://127.0.0.1:8765/sse";

        assert_eq!(
            generator.generate(ClientKind::GeminiCli).unwrap(),
            json!({"mcpServers": {"toolhub": {"url": url, "timeout": 30000, "trust": false}}})
        );
        assert_eq!(
            generator.generate(ClientKind::ClaudeDesktop).unwrap(),
            json!({"mcpServers": {"toolhub": {"type": "sse", "url": url, "timeoutMs": 30000, "trusted": false}}})
        );
        assert_eq!(
            generator.generate(ClientKind::Vscode).unwrap(),
            json!({"servers": {"toolhub": {"type": "sse", "url": url, "requestTimeout": 30000, "trust": false}}})
        );
        assert_eq!(
            generator.generate(ClientKind::Agent).unwrap(),
            json!({
                "hub": {"endpoint": url, "timeout_seconds": 30, "trust": false},
                "servers": ["files"],
            })
        );
    }

    #[test]
    fn every_kind_shares_the_address_and_omits_secrets() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir, docker());
        for kind in ClientKind::iter() {
            let text = generator.generate(kind).unwrap().to_string();
            assert!(text.contains("http://toolhub:8765/sse"), "{kind}: {text}");
            assert!(!text.contains("secret"), "{kind}: {text}");
            assert!(!text.contains("API_KEY"), "{kind}: {text}");
        }
    }

    #[test]
    fn kinds_parse_from_kebab_case() {
        assert_eq!("gemini-cli".parse::<ClientKind>().unwrap(), ClientKind::GeminiCli);
        assert_eq!("claude-desktop".parse::<ClientKind>().unwrap(), ClientKind::ClaudeDesktop);
        assert_eq!(ClientKind::Vscode.to_string(), "vscode");
        assert!("cursor".parse::<ClientKind>().is_err());
    }

    #[test]
    fn write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let generator = generator(&dir, FakeEnvironment::default());
        let target = dir.path().join("out").join("gemini.json");

        let written = generator.write(ClientKind::GeminiCli, &target).unwrap();
        let first = std::fs::read_to_string(&written).unwrap();
        generator.write(ClientKind::GeminiCli, &target).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), first);
        let parsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed, generator.generate(ClientKind::GeminiCli).unwrap());
    }
}
