//! File-backed server registry.
//!
//! One JSON descriptor per server lives in a well-known directory, optionally
//! namespaced per end user. The files on disk are the source of truth: every
//! read rescans them, and every mutation is an atomic replace.

pub mod descriptor;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{HubError, Result};

pub use descriptor::{
    validate_server_name, ServerDescriptor, StreamSpec, SubprocessSpec, TransportKind,
    TransportSpec, BUILTIN_NAMESPACE,
};

/// Where the registry keeps its descriptor files.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_dir: PathBuf,
    /// Tenant namespace. `None` uses `base_dir` directly.
    pub user: Option<String>,
}

impl RegistryConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            user: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn default_dir() -> PathBuf {
        default_servers_dir()
    }

    /// Directory holding this tenant's descriptor files.
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.user {
            Some(user) => self.base_dir.join("users").join(normalize_user(user)),
            None => self.base_dir.clone(),
        }
    }
}

/// Counts reported by [`ServerRegistry::summary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
}

/// Single source of truth for which tool servers exist.
///
/// # Example
/// ```no_run
/// use toolhub::registry::{RegistryConfig, ServerRegistry};
///
/// let registry = ServerRegistry::open(RegistryConfig::new("/tmp/toolhub"))?;
/// registry.add(r#"{"name":"files","description":"fs","command":"files-server"}"#)?;
/// registry.disable("files")?;
/// # Ok::<(), toolhub::HubError>(())
/// ```
#[derive(Debug)]
pub struct ServerRegistry {
    dir: PathBuf,
    write_lock: Mutex<()>,
    revision: watch::Sender<u64>,
}

impl ServerRegistry {
    /// Open (creating if needed) the registry directory.
    pub fn open(config: RegistryConfig) -> Result<Self> {
        let dir = config.resolved_dir();
        fs::create_dir_all(&dir)?;
        let (revision, _) = watch::channel(0);
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            revision,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory and parse every descriptor.
    ///
    /// Malformed files are logged and skipped. Only an unreadable directory
    /// fails the whole scan.
    pub fn load_all(&self) -> Result<Vec<ServerDescriptor>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if is_descriptor_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable descriptor");
                    continue;
                }
            };
            let descriptor = match ServerDescriptor::from_json(&raw) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping malformed descriptor");
                    continue;
                }
            };
            if !seen.insert(descriptor.name.clone()) {
                tracing::warn!(
                    path = %path.display(),
                    server = %descriptor.name,
                    "skipping descriptor with duplicate name"
                );
                continue;
            }
            descriptors.push(descriptor);
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    /// Look up one descriptor by name.
    pub fn get(&self, name: &str) -> Result<ServerDescriptor> {
        self.load_all()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| HubError::NotFound(name.to_string()))
    }

    /// Validate and persist a new descriptor.
    pub fn add(&self, descriptor_json: &str) -> Result<ServerDescriptor> {
        let descriptor = ServerDescriptor::from_json(descriptor_json)?;
        let _guard = self.lock();
        if self.find(&descriptor.name)?.is_some() {
            return Err(HubError::Validation(format!(
                "server '{}' already exists",
                descriptor.name
            )));
        }
        let path = self.free_path_for(&descriptor.name);
        self.write_descriptor(&path, &descriptor)?;
        tracing::info!(server = %descriptor.name, transport = %descriptor.transport_kind(), "server added");
        self.bump();
        Ok(descriptor)
    }

    /// Replace an existing descriptor wholesale.
    pub fn update(&self, descriptor_json: &str) -> Result<ServerDescriptor> {
        let descriptor = ServerDescriptor::from_json(descriptor_json)?;
        let _guard = self.lock();
        let (path, _) = self
            .find(&descriptor.name)?
            .ok_or_else(|| HubError::NotFound(descriptor.name.clone()))?;
        self.write_descriptor(&path, &descriptor)?;
        tracing::info!(server = %descriptor.name, "server updated");
        self.bump();
        Ok(descriptor)
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    /// Delete a descriptor. A second remove of the same name is `NotFound`.
    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.lock();
        let (path, _) = self
            .find(name)?
            .ok_or_else(|| HubError::NotFound(name.to_string()))?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(HubError::NotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        }
        tracing::info!(server = %name, "server removed");
        self.bump();
        Ok(())
    }

    pub fn summary(&self) -> Result<RegistrySummary> {
        let descriptors = self.load_all()?;
        let enabled = descriptors.iter().filter(|d| d.enabled).count();
        Ok(RegistrySummary {
            total: descriptors.len(),
            enabled,
            disabled: descriptors.len() - enabled,
        })
    }

    /// Revision counter bumped after every successful mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let _guard = self.lock();
        let (path, descriptor) = self
            .find(name)?
            .ok_or_else(|| HubError::NotFound(name.to_string()))?;
        if descriptor.enabled == enabled {
            return Ok(());
        }
        self.write_descriptor(&path, &descriptor.with_enabled(enabled))?;
        tracing::info!(server = %name, enabled, "server toggled");
        self.bump();
        Ok(())
    }

    /// Locate the file currently holding `name`, whatever its file stem.
    fn find(&self, name: &str) -> Result<Option<(PathBuf, ServerDescriptor)>> {
        let canonical = self.path_for(name);
        if let Ok(raw) = fs::read_to_string(&canonical) {
            if let Ok(descriptor) = ServerDescriptor::from_json(&raw) {
                if descriptor.name == name {
                    return Ok(Some((canonical, descriptor)));
                }
            }
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_descriptor_file(path))
            .collect();
        paths.sort();
        for path in paths {
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(descriptor) = ServerDescriptor::from_json(&raw) {
                if descriptor.name == name {
                    return Ok(Some((path, descriptor)));
                }
            }
        }
        Ok(None)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Where a new descriptor goes: `<name>.json`, or `<name>-<n>.json` when
    /// that file already holds something else. Callers hold the write lock.
    fn free_path_for(&self, name: &str) -> PathBuf {
        let canonical = self.path_for(name);
        if !canonical.exists() {
            return canonical;
        }
        let free = (2u32..)
            .map(|n| self.dir.join(format!("{name}-{n}.json")))
            .find(|path| !path.exists())
            .unwrap_or_else(|| canonical.clone());
        tracing::warn!(
            server = %name,
            occupied = %canonical.display(),
            path = %free.display(),
            "descriptor file name taken by another record"
        );
        free
    }

    fn write_descriptor(&self, path: &Path, descriptor: &ServerDescriptor) -> Result<()> {
        let serialized = descriptor.to_json_pretty()?;
        write_atomic(path, serialized.as_bytes())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Write `contents` to `path` via a temp file in the same directory.
///
/// Readers observe either the old file or the new one, never a partial write.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("descriptor");
    let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn is_descriptor_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path.extension().and_then(|e| e.to_str()) == Some("json")
        && path.is_file()
}

fn default_servers_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".toolhub").join("servers"))
        .unwrap_or_else(|| PathBuf::from(".toolhub").join("servers"))
}

fn normalize_user(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || lower == '-' || lower == '_' {
            out.push(lower);
        } else {
            out.push('-');
        }
    }
    if out.trim_matches('-').is_empty() {
        "default".to_string()
    } else {
        out
    }
}
