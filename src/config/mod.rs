//! Configuration system (layered: defaults < TOML file < environment).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use serde::Deserialize;

use crate::error::{HubError, Result};
use crate::registry::RegistryConfig;

/// Health-check and reconnection tuning for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub interval: Duration,
    /// Consecutive failures before a ready connection becomes degraded.
    pub failure_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    /// `None` retries forever.
    pub max_reopen_attempts: Option<u32>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            failure_threshold: 3,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            max_reopen_attempts: None,
        }
    }
}

/// Gates for the tools implemented inside the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinSettings {
    pub memory: bool,
    pub document_conversion: bool,
    pub server_status: bool,
    pub converter_command: String,
}

impl Default for BuiltinSettings {
    fn default() -> Self {
        Self {
            memory: true,
            document_conversion: false,
            server_status: true,
            converter_command: "pandoc".to_string(),
        }
    }
}

/// Inputs for resolving the hub's own reachable address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSettings {
    pub port: u16,
    pub path: String,
    /// Operator override; wins over environment detection.
    pub public_url: Option<String>,
    /// Hostname other containers use to reach the hub.
    pub container_host: String,
}

impl Default for AddressSettings {
    fn default() -> Self {
        Self {
            port: 8765,
            path: "/sse".to_string(),
            public_url: None,
            container_host: "toolhub".to_string(),
        }
    }
}

/// Values embedded in generated client configs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub timeout_ms: u64,
    pub trust: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            trust: false,
        }
    }
}

/// Top-level hub configuration.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use toolhub::config::HubConfig;
///
/// let config = HubConfig::builder()
///     .servers_dir("/tmp/toolhub".into())
///     .default_call_timeout(Duration::from_secs(5))
///     .build();
/// assert_eq!(config.health.failure_threshold, 3);
/// ```
#[derive(Debug, Clone, Builder)]
pub struct HubConfig {
    #[builder(default = RegistryConfig::default_dir())]
    pub servers_dir: PathBuf,
    pub user: Option<String>,
    #[builder(default = Duration::from_secs(30))]
    pub reconcile_interval: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub default_call_timeout: Duration,
    #[builder(default)]
    pub health: HealthSettings,
    #[builder(default)]
    pub builtins: BuiltinSettings,
    #[builder(default)]
    pub address: AddressSettings,
    #[builder(default)]
    pub clients: ClientSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HubConfig {
    /// Defaults, then the optional TOML file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Some(path) = path {
            config.apply_file(ConfigFile::read(path)?);
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with one TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(ConfigFile::read(path)?);
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `TOOLHUB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            base_dir: self.servers_dir.clone(),
            user: self.user.clone(),
        }
    }

    /// Overlay `TOOLHUB_*` variables read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("TOOLHUB_SERVERS_DIR") {
            self.servers_dir = PathBuf::from(dir);
        }
        if let Some(user) = var("TOOLHUB_USER") {
            self.user = Some(user);
        }
        if let Some(raw) = var("TOOLHUB_RECONCILE_INTERVAL_MS") {
            self.reconcile_interval = parse_millis("TOOLHUB_RECONCILE_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_CALL_TIMEOUT_MS") {
            self.default_call_timeout = parse_millis("TOOLHUB_CALL_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_HEALTH_INTERVAL_MS") {
            self.health.interval = parse_millis("TOOLHUB_HEALTH_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_HEALTH_FAILURE_THRESHOLD") {
            self.health.failure_threshold = parse_number("TOOLHUB_HEALTH_FAILURE_THRESHOLD", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_BACKOFF_INITIAL_MS") {
            self.health.backoff_initial = parse_millis("TOOLHUB_BACKOFF_INITIAL_MS", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_BACKOFF_MAX_MS") {
            self.health.backoff_max = parse_millis("TOOLHUB_BACKOFF_MAX_MS", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_MAX_REOPEN_ATTEMPTS") {
            self.health.max_reopen_attempts =
                Some(parse_number("TOOLHUB_MAX_REOPEN_ATTEMPTS", &raw)?);
        }
        if let Some(raw) = var("TOOLHUB_BUILTIN_MEMORY") {
            self.builtins.memory = parse_bool("TOOLHUB_BUILTIN_MEMORY", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_BUILTIN_DOCUMENTS") {
            self.builtins.document_conversion = parse_bool("TOOLHUB_BUILTIN_DOCUMENTS", &raw)?;
        }
        if let Some(raw) = var("TOOLHUB_BUILTIN_STATUS") {
            self.builtins.server_status = parse_bool("TOOLHUB_BUILTIN_STATUS", &raw)?;
        }
        if let Some(command) = var("TOOLHUB_CONVERTER") {
            self.builtins.converter_command = command;
        }
        if let Some(raw) = var("TOOLHUB_PORT") {
            self.address.port = parse_number("TOOLHUB_PORT", &raw)?;
        }
        if let Some(url) = var("TOOLHUB_PUBLIC_URL") {
            self.address.public_url = Some(url);
        }
        if let Some(host) = var("TOOLHUB_CONTAINER_HOST") {
            self.address.container_host = host;
        }
        Ok(())
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.servers_dir {
            self.servers_dir = dir;
        }
        if file.user.is_some() {
            self.user = file.user;
        }
        if let Some(ms) = file.reconcile_interval_ms {
            self.reconcile_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.default_call_timeout_ms {
            self.default_call_timeout = Duration::from_millis(ms);
        }

        let health = file.health;
        if let Some(ms) = health.interval_ms {
            self.health.interval = Duration::from_millis(ms);
        }
        if let Some(n) = health.failure_threshold {
            self.health.failure_threshold = n;
        }
        if let Some(ms) = health.backoff_initial_ms {
            self.health.backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = health.backoff_max_ms {
            self.health.backoff_max = Duration::from_millis(ms);
        }
        if let Some(ms) = health.probe_timeout_ms {
            self.health.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = health.connect_timeout_ms {
            self.health.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = health.drain_timeout_ms {
            self.health.drain_timeout = Duration::from_millis(ms);
        }
        if health.max_reopen_attempts.is_some() {
            self.health.max_reopen_attempts = health.max_reopen_attempts;
        }

        let builtins = file.builtins;
        if let Some(on) = builtins.memory {
            self.builtins.memory = on;
        }
        if let Some(on) = builtins.document_conversion {
            self.builtins.document_conversion = on;
        }
        if let Some(on) = builtins.server_status {
            self.builtins.server_status = on;
        }
        if let Some(command) = builtins.converter_command {
            self.builtins.converter_command = command;
        }

        let address = file.address;
        if let Some(port) = address.port {
            self.address.port = port;
        }
        if let Some(path) = address.path {
            self.address.path = path;
        }
        if address.public_url.is_some() {
            self.address.public_url = address.public_url;
        }
        if let Some(host) = address.container_host {
            self.address.container_host = host;
        }

        if let Some(ms) = file.clients.timeout_ms {
            self.clients.timeout_ms = ms;
        }
        if let Some(trust) = file.clients.trust {
            self.clients.trust = trust;
        }
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("reconcile_interval", self.reconcile_interval),
            ("default_call_timeout", self.default_call_timeout),
            ("health.interval", self.health.interval),
            ("health.backoff_initial", self.health.backoff_initial),
            ("health.backoff_max", self.health.backoff_max),
            ("health.probe_timeout", self.health.probe_timeout),
            ("health.connect_timeout", self.health.connect_timeout),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(HubError::Configuration(format!("{name} must be non-zero")));
            }
        }
        if self.health.failure_threshold == 0 {
            return Err(HubError::Configuration(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.health.max_reopen_attempts == Some(0) {
            return Err(HubError::Configuration(
                "health.max_reopen_attempts must be at least 1 when set".into(),
            ));
        }
        if !self.address.path.starts_with('/') {
            return Err(HubError::Configuration(format!(
                "address.path '{}' must start with '/'",
                self.address.path
            )));
        }
        if self.clients.timeout_ms == 0 {
            return Err(HubError::Configuration("clients.timeout_ms must be non-zero".into()));
        }
        if self.builtins.converter_command.trim().is_empty() {
            return Err(HubError::Configuration(
                "builtins.converter_command must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// On-disk TOML shape. Every key is optional; durations are milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    servers_dir: Option<PathBuf>,
    user: Option<String>,
    reconcile_interval_ms: Option<u64>,
    default_call_timeout_ms: Option<u64>,
    health: HealthFile,
    builtins: BuiltinsFile,
    address: AddressFile,
    clients: ClientsFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct HealthFile {
    interval_ms: Option<u64>,
    failure_threshold: Option<u32>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    max_reopen_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BuiltinsFile {
    memory: Option<bool>,
    document_conversion: Option<bool>,
    server_status: Option<bool>,
    converter_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AddressFile {
    port: Option<u16>,
    path: Option<String>,
    public_url: Option<String>,
    container_host: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ClientsFile {
    timeout_ms: Option<u64>,
    trust: Option<bool>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HubError::Configuration(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&raw)?)
    }
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration> {
    parse_number::<u64>(key, raw).map(Duration::from_millis)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| HubError::Configuration(format!("{key}: '{raw}' is not a valid number")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(HubError::Configuration(format!(
            "{key}: '{raw}' is not a valid boolean"
        ))),
    }
}
