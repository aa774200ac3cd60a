//! Core domain types: identifiers, module definitions, sources, status.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::SystemTime;

use serde::Deserialize;

use crate::errors::{GovError, GovResult};

/// Instance selection labels, e.g. `{"stage": "canary"}`. Small maps, typically a handful of keys.
pub type Labels = HashMap<String, String>;

fn non_blank(value: &str, what: &str) -> GovResult<()> {
    if value.trim().is_empty() {
        return Err(GovError::InvalidArgument(format!("{what} must not be blank")));
    }
    Ok(())
}

/// Globally unique module identifier within one host process.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ModuleId(Arc<str>);

impl ModuleId {
    /// Creates a validated module id.
    ///
    /// # Errors
    /// Returns `GovError::InvalidArgument` when the id is blank or contains
    /// the service-id separator `:`.
    pub fn new(id: impl AsRef<str>) -> GovResult<Self> {
        let id = id.as_ref();
        non_blank(id, "module id")?;
        if id.contains(':') {
            return Err(GovError::InvalidArgument(format!(
                "module id '{id}' must not contain ':'"
            )));
        }
        Ok(Self(Arc::from(id)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModuleId {
    type Error = GovError;

    fn try_from(value: String) -> GovResult<Self> {
        Self::new(&value)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque module version string. No ordering semantics beyond equality.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct Version(Arc<str>);

impl Version {
    /// Creates a validated version.
    ///
    /// # Errors
    /// Returns `GovError::InvalidArgument` when the version is blank.
    pub fn new(version: impl AsRef<str>) -> GovResult<Self> {
        let version = version.as_ref();
        non_blank(version, "version")?;
        Ok(Self(Arc::from(version)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Version {
    type Error = GovError;

    fn try_from(value: String) -> GovResult<Self> {
        Self::new(&value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified service id: `<module>:<short>`. Equality is byte identity on the full string.
#[derive(Clone)]
pub struct ServiceId {
    full: Arc<str>,
    split: usize,
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        self.full == other.full
    }
}

impl Eq for ServiceId {}

impl std::hash::Hash for ServiceId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full.hash(state);
    }
}

impl ServiceId {
    /// Builds a service id from a module id and a short id.
    ///
    /// # Errors
    /// Returns `GovError::InvalidArgument` when the short id is blank.
    pub fn new(module: &ModuleId, short: impl AsRef<str>) -> GovResult<Self> {
        let short = short.as_ref();
        non_blank(short, "service short id")?;
        let full = format!("{module}:{short}");
        Ok(Self {
            split: module.as_str().len(),
            full: Arc::from(full.as_str()),
        })
    }

    /// Parses a `<module>:<short>` string.
    ///
    /// # Errors
    /// Returns `GovError::InvalidArgument` when either part is blank or the separator is missing.
    pub fn parse(fqsid: impl AsRef<str>) -> GovResult<Self> {
        let fqsid = fqsid.as_ref();
        non_blank(fqsid, "service id")?;
        let Some(split) = fqsid.find(':') else {
            return Err(GovError::InvalidArgument(format!(
                "service id '{fqsid}' is missing the ':' separator"
            )));
        };
        non_blank(&fqsid[..split], "service id module part")?;
        non_blank(&fqsid[split + 1..], "service id short part")?;
        Ok(Self {
            full: Arc::from(fqsid),
            split,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The `<module>` part.
    #[must_use]
    pub fn module_part(&self) -> &str {
        &self.full[..self.split]
    }

    /// The `<short>` part.
    #[must_use]
    pub fn short_part(&self) -> &str {
        &self.full[self.split + 1..]
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// How a caller intends to touch a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// A permission granted to a module: pattern plus the access it covers.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub access: AccessKind,
}

/// An audit directive: which operations to record under which action tag.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditRule {
    pub pattern: String,
    pub action: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Immutable description of a module as parsed from its manifest.
///
/// The manager clones definitions on reload so callers' copies are never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDefinition {
    pub id: ModuleId,
    pub version: Version,
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
    #[serde(default)]
    pub audits: Vec<AuditRule>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ModuleDefinition {
    #[must_use]
    pub fn new(id: ModuleId, version: Version) -> Self {
        Self {
            id,
            version,
            permissions: Vec::new(),
            audits: Vec::new(),
            properties: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }
}

/// Where a module's artifact lives. Opaque to the core; loaders interpret it.
#[derive(Debug, Clone)]
pub enum SourceLocation {
    /// A packaged artifact on disk.
    Artifact(PathBuf),
    /// An exploded development directory.
    Directory(PathBuf),
    /// A host-registered in-memory source, addressed by tag.
    InMemory(Arc<str>),
}

/// A module source handle, remembered per module for reloads.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub location: SourceLocation,
    /// Labels attached to instances built from this source (canary routing).
    pub labels: Labels,
}

impl ModuleSource {
    #[must_use]
    pub fn artifact(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SourceLocation::Artifact(path.into()),
            labels: Labels::new(),
        }
    }

    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SourceLocation::Directory(path.into()),
            labels: Labels::new(),
        }
    }

    #[must_use]
    pub fn in_memory(tag: impl AsRef<str>) -> Self {
        Self {
            location: SourceLocation::InMemory(Arc::from(tag.as_ref())),
            labels: Labels::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Module runtime state machine: `Loaded -> Active <-> Loaded -> Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleStatus {
    Loaded = 0,
    Active = 1,
    Shutdown = 2,
}

impl ModuleStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Active,
            2 => Self::Shutdown,
            _ => Self::Loaded,
        }
    }
}

/// Lock-free status cell.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    #[must_use]
    pub fn new(status: ModuleStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[must_use]
    pub fn get(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ModuleStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Transitions `from -> to`; returns whether the swap happened.
    pub fn transition(&self, from: ModuleStatus, to: ModuleStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Point-in-time traffic counters for one module.
#[derive(Debug, Clone, Copy)]
pub struct TrafficStats {
    pub total: u64,
    pub stable: u64,
    pub canary: u64,
    pub window_started: SystemTime,
}

/// Read-only snapshot of one module runtime, for embedding hosts.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub status: ModuleStatus,
    pub versions: Vec<Version>,
    pub default_version: Option<Version>,
    pub canary_version: Option<Version>,
    pub traffic: TrafficStats,
    pub installed_at: SystemTime,
}
