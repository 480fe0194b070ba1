//! Server descriptor model and validation.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::HubError;

/// Namespace reserved for tools implemented inside the hub process.
pub const BUILTIN_NAMESPACE: &str = "hub";

const DEFAULT_STREAM_TIMEOUT_MS: u64 = 10_000;

/// Which wire transport a descriptor uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    Subprocess,
    Stream,
}

/// Launch settings for a long-lived child process speaking line-framed RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Connection settings for a persistent event-stream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub url: String,
    pub timeout_ms: u64,
    /// When false, certificate verification is skipped. Loopback hosts only.
    pub trust: bool,
}

/// Exactly one transport's settings, selected once per descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Subprocess(SubprocessSpec),
    Stream(StreamSpec),
}

impl TransportSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Subprocess(_) => TransportKind::Subprocess,
            Self::Stream(_) => TransportKind::Stream,
        }
    }
}

/// One configured backend tool server.
///
/// Descriptors are immutable values: updates replace the whole record.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub transport: TransportSpec,
    /// Operator-added fields, preserved on rewrite and ignored otherwise.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerDescriptor {
    /// Parse and validate a descriptor from its JSON text.
    pub fn from_json(raw: &str) -> Result<Self, HubError> {
        let file: DescriptorFile = serde_json::from_str(raw)
            .map_err(|e| HubError::Validation(format!("malformed descriptor JSON: {e}")))?;
        Self::try_from(file)
    }

    /// Parse and validate a descriptor from an already-decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, HubError> {
        let file: DescriptorFile = serde_json::from_value(value)
            .map_err(|e| HubError::Validation(format!("malformed descriptor JSON: {e}")))?;
        Self::try_from(file)
    }

    /// Serialize to the on-disk JSON shape.
    pub fn to_json_pretty(&self) -> Result<String, HubError> {
        Ok(serde_json::to_string_pretty(&DescriptorFile::from(self))?)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Copy of this descriptor with a different `enabled` flag.
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self {
            enabled,
            ..self.clone()
        }
    }
}

/// On-disk JSON shape: optional fields for both transports plus extras.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trust: Option<bool>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl From<&ServerDescriptor> for DescriptorFile {
    fn from(descriptor: &ServerDescriptor) -> Self {
        let mut file = DescriptorFile {
            name: Some(descriptor.name.clone()),
            description: Some(descriptor.description.clone()),
            enabled: Some(descriptor.enabled),
            transport: Some(descriptor.transport_kind()),
            extra: descriptor.extra.clone(),
            ..Default::default()
        };
        match &descriptor.transport {
            TransportSpec::Subprocess(spec) => {
                file.command = Some(spec.command.clone());
                file.args = Some(spec.args.clone());
                if !spec.env.is_empty() {
                    file.env = Some(spec.env.clone());
                }
                file.working_dir = spec.working_dir.clone();
            }
            TransportSpec::Stream(spec) => {
                file.url = Some(spec.url.clone());
                file.timeout_ms = Some(spec.timeout_ms);
                file.trust = Some(spec.trust);
            }
        }
        file
    }
}

impl TryFrom<DescriptorFile> for ServerDescriptor {
    type Error = HubError;

    fn try_from(file: DescriptorFile) -> Result<Self, Self::Error> {
        let name = file
            .name
            .ok_or_else(|| HubError::Validation("descriptor is missing 'name'".into()))?;
        validate_server_name(&name)?;
        let description = file.description.ok_or_else(|| {
            HubError::Validation(format!("descriptor '{name}' is missing 'description'"))
        })?;

        let has_subprocess_fields = file.command.is_some()
            || file.args.is_some()
            || file.env.is_some()
            || file.working_dir.is_some();
        let has_stream_fields =
            file.url.is_some() || file.timeout_ms.is_some() || file.trust.is_some();

        let inferred = match (has_subprocess_fields, has_stream_fields) {
            (true, false) => TransportKind::Subprocess,
            (false, true) => TransportKind::Stream,
            (true, true) => {
                return Err(HubError::Validation(format!(
                    "descriptor '{name}' mixes subprocess and stream fields"
                )))
            }
            (false, false) => {
                return Err(HubError::Validation(format!(
                    "descriptor '{name}' needs either 'command' or 'url'"
                )))
            }
        };
        if let Some(declared) = file.transport {
            if declared != inferred {
                return Err(HubError::Validation(format!(
                    "descriptor '{name}' declares transport '{declared}' but carries {inferred} fields"
                )));
            }
        }

        let transport = match inferred {
            TransportKind::Subprocess => {
                let command = file.command.unwrap_or_default();
                if command.trim().is_empty() {
                    return Err(HubError::Validation(format!(
                        "descriptor '{name}' has an empty 'command'"
                    )));
                }
                TransportSpec::Subprocess(SubprocessSpec {
                    command,
                    args: file.args.unwrap_or_default(),
                    env: file.env.unwrap_or_default(),
                    working_dir: file.working_dir,
                })
            }
            TransportKind::Stream => {
                let url = file.url.unwrap_or_default();
                let timeout_ms = file.timeout_ms.unwrap_or(DEFAULT_STREAM_TIMEOUT_MS);
                let trust = file.trust.unwrap_or(true);
                validate_stream(&name, &url, timeout_ms, trust)?;
                TransportSpec::Stream(StreamSpec {
                    url,
                    timeout_ms,
                    trust,
                })
            }
        };

        Ok(ServerDescriptor {
            name,
            description,
            enabled: file.enabled.unwrap_or(true),
            transport,
            extra: file.extra,
        })
    }
}

static SERVER_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("server name regex must compile")
});

/// Check that a server name is usable as a file stem and a tool namespace.
pub fn validate_server_name(name: &str) -> Result<(), HubError> {
    if !SERVER_NAME_RE.is_match(name) {
        return Err(HubError::Validation(format!(
            "invalid server name '{name}': use letters, digits, '-' or '_' (max 64)"
        )));
    }
    if name == BUILTIN_NAMESPACE {
        return Err(HubError::Validation(format!(
            "server name '{BUILTIN_NAMESPACE}' is reserved for built-in tools"
        )));
    }
    Ok(())
}

fn validate_stream(name: &str, url: &str, timeout_ms: u64, trust: bool) -> Result<(), HubError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| HubError::Validation(format!("descriptor '{name}' has invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(HubError::Validation(format!(
            "descriptor '{name}' url must use http or https"
        )));
    }
    if timeout_ms == 0 {
        return Err(HubError::Validation(format!(
            "descriptor '{name}' needs a non-zero 'timeout_ms'"
        )));
    }
    if !trust && !is_loopback_url(&parsed) {
        return Err(HubError::Validation(format!(
            "descriptor '{name}' sets trust=false for a non-loopback host"
        )));
    }
    Ok(())
}

/// Whether a URL points at the local machine.
pub fn is_loopback_url(url: &reqwest::Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => host.eq_ignore_ascii_case("localhost"),
    }
}
