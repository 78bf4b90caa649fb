//! Extension registry
//!
//! An ordered set of discovered extensions. Insertion order is discovery order
//! and is the order in which transformation rules are applied. Identity names
//! are unique.
//!
//! The registry is mutated during discovery only. Afterwards it is frozen
//! behind an `Arc` and read concurrently from host threads without locking;
//! the enabled flag is atomic so it can still be toggled.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use voidloader_api::{ClassTransformer, DeclaredTransform, ModDescriptor, UNKNOWN_VERSION};

/// Artifact kind, fixed at discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    /// Managed-code archive (`.jar`)
    Managed,
    /// Platform dynamic library (`.dll`, `.so`, `.dylib`)
    Native,
}

impl ExtensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Native => "native",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a second extension claims an existing identity name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Drop the earlier record and append the later one
    #[default]
    LastWriteWins,
    /// Keep the earlier record and refuse the later one
    Reject,
}

/// Errors that can occur during registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Extension identity name must not be empty ({0})")]
    EmptyName(PathBuf),

    #[error("Extension already registered: {0}")]
    DuplicateName(String),
}

/// One discovered extension
pub struct ExtensionRecord {
    name: String,
    version: String,
    path: PathBuf,
    kind: ExtensionKind,
    enabled: AtomicBool,
    author: Option<String>,
    description: Option<String>,
    dependencies: Vec<String>,
    digest: Option<blake3::Hash>,
    rule: Option<Arc<dyn ClassTransformer>>,
}

impl ExtensionRecord {
    /// Create an enabled record with an unknown version
    pub fn new(
        name: impl Into<String>,
        kind: ExtensionKind,
        path: impl Into<PathBuf>,
    ) -> Result<Self, RegistryError> {
        let name = name.into().trim().to_string();
        let path = path.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName(path));
        }

        Ok(Self {
            name,
            version: UNKNOWN_VERSION.to_string(),
            path,
            kind,
            enabled: AtomicBool::new(true),
            author: None,
            description: None,
            dependencies: Vec::new(),
            digest: None,
            rule: None,
        })
    }

    /// Create a managed record from an embedded descriptor
    ///
    /// A non-empty `transforms` list becomes a [`DeclaredTransform`] rule.
    pub fn from_descriptor(
        descriptor: ModDescriptor,
        path: impl Into<PathBuf>,
    ) -> Result<Self, RegistryError> {
        let mut record = Self::new(descriptor.name, ExtensionKind::Managed, path)?
            .version(descriptor.version)
            .dependencies(descriptor.dependencies);
        record.author = descriptor.author;
        record.description = descriptor.description;
        if !descriptor.transforms.is_empty() {
            record.rule = Some(Arc::new(DeclaredTransform::new(descriptor.transforms)));
        }
        Ok(record)
    }

    /// Set the version; blank versions stay unknown
    pub fn version(mut self, version: impl Into<String>) -> Self {
        let version = version.into().trim().to_string();
        if !version.is_empty() {
            self.version = version;
        }
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn dependencies(mut self, dependencies: impl IntoIterator<Item = String>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    /// Record the BLAKE3 digest of the artifact bytes
    pub fn digest(mut self, digest: blake3::Hash) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Attach the transformation rule this extension contributes
    pub fn with_rule(mut self, rule: Arc<dyn ClassTransformer>) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Start disabled
    pub fn disabled(self) -> Self {
        self.enabled.store(false, Ordering::Relaxed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version_str(&self) -> &str {
        &self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn author_str(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn description_str(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn dependency_names(&self) -> &[String] {
        &self.dependencies
    }

    pub fn artifact_digest(&self) -> Option<&blake3::Hash> {
        self.digest.as_ref()
    }

    /// The rule this record declares for `class_name`, if any
    pub fn rule_for(&self, class_name: &str) -> Option<&dyn ClassTransformer> {
        self.rule
            .as_deref()
            .filter(|rule| rule.applies_to(class_name))
    }
}

impl fmt::Debug for ExtensionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRecord")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("author", &self.author)
            .field("dependencies", &self.dependencies)
            .field("has_rule", &self.rule.is_some())
            .finish()
    }
}

/// Outcome of admitting a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First record with this name
    Added,
    /// Replaced an earlier record; `identical` when both artifacts hash equal
    Replaced { identical: bool },
}

/// Ordered registry of extensions
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    records: Vec<ExtensionRecord>,
    policy: DuplicatePolicy,
}

impl ExtensionRegistry {
    /// Create an empty registry with the last-write-wins policy
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            records: Vec::new(),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Add a record at the end of the registry, applying the duplicate policy
    pub fn admit(&mut self, record: ExtensionRecord) -> Result<Admission, RegistryError> {
        let Some(index) = self.position(record.name()) else {
            tracing::debug!(extension = %record.name, kind = %record.kind, "Extension registered");
            self.records.push(record);
            return Ok(Admission::Added);
        };

        let previous = &self.records[index];
        let identical = matches!(
            (previous.digest, record.digest),
            (Some(a), Some(b)) if a == b
        );

        match self.policy {
            DuplicatePolicy::Reject => {
                tracing::warn!(
                    extension = %record.name,
                    kept = %previous.path.display(),
                    rejected = %record.path.display(),
                    identical,
                    "Duplicate extension name rejected"
                );
                Err(RegistryError::DuplicateName(record.name))
            }
            DuplicatePolicy::LastWriteWins => {
                tracing::warn!(
                    extension = %record.name,
                    replaced = %previous.path.display(),
                    by = %record.path.display(),
                    identical,
                    "Duplicate extension name, later artifact wins"
                );
                self.records.remove(index);
                self.records.push(record);
                Ok(Admission::Replaced { identical })
            }
        }
    }

    /// Enable or disable an extension by name; returns false if unknown
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.get(name) {
            Some(record) => {
                record.enabled.store(enabled, Ordering::Release);
                tracing::info!(
                    extension = %name,
                    "Extension {}",
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// All records in registry order
    pub fn iter(&self) -> impl Iterator<Item = &ExtensionRecord> {
        self.records.iter()
    }

    /// Enabled records in registry order
    pub fn enabled(&self) -> impl Iterator<Item = &ExtensionRecord> {
        self.records.iter().filter(|record| record.is_enabled())
    }

    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|record| record.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One `name vversion (path)` line per record
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&format!(
                "  - {} v{} ({})",
                record.name,
                record.version,
                record.path.display()
            ));
            if !record.is_enabled() {
                out.push_str(" [disabled]");
            }
            out.push('\n');
        }
        out
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|record| record.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(name: &str, path: &str) -> ExtensionRecord {
        ExtensionRecord::new(name, ExtensionKind::Managed, path).unwrap()
    }

    #[test]
    fn test_record_defaults() {
        let record = managed("examplemod", "mods/examplemod.jar");
        assert_eq!(record.name(), "examplemod");
        assert_eq!(record.version_str(), UNKNOWN_VERSION);
        assert_eq!(record.kind(), ExtensionKind::Managed);
        assert!(record.is_enabled());
        assert!(record.dependency_names().is_empty());
        assert!(record.rule_for("net/minecraft/client/Minecraft").is_none());
    }

    #[test]
    fn test_record_rejects_empty_name() {
        let err = ExtensionRecord::new("  ", ExtensionKind::Native, "mods/.so").unwrap_err();
        assert!(matches!(err, RegistryError::EmptyName(_)));
    }

    #[test]
    fn test_record_from_descriptor_declares_rule() {
        let descriptor = ModDescriptor::new("tweaks", "1.0.0")
            .dependency("corelib")
            .transform("net/minecraft/client/Minecraft");
        let record = ExtensionRecord::from_descriptor(descriptor, "mods/tweaks.jar").unwrap();

        assert_eq!(record.version_str(), "1.0.0");
        assert_eq!(record.dependency_names(), ["corelib".to_string()]);
        assert!(record.rule_for("net/minecraft/client/Minecraft").is_some());
        assert!(record.rule_for("net/minecraft/server/MinecraftServer").is_none());
    }

    #[test]
    fn test_registry_preserves_insertion_order() {
        let mut registry = ExtensionRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            assert_eq!(
                registry.admit(managed(name, "x.jar")).unwrap(),
                Admission::Added
            );
        }
        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_registry_last_write_wins() {
        let mut registry = ExtensionRegistry::new();
        registry.admit(managed("a", "first/a.jar")).unwrap();
        registry.admit(managed("b", "b.jar")).unwrap();

        let admission = registry.admit(managed("a", "second/a.jar")).unwrap();
        assert_eq!(admission, Admission::Replaced { identical: false });
        assert_eq!(registry.names(), vec!["b", "a"]);
        assert_eq!(
            registry.get("a").unwrap().path(),
            Path::new("second/a.jar")
        );
    }

    #[test]
    fn test_registry_detects_identical_duplicate() {
        let digest = blake3::hash(b"same bytes");
        let mut registry = ExtensionRegistry::new();
        registry
            .admit(managed("a", "one/a.jar").digest(digest))
            .unwrap();
        let admission = registry
            .admit(managed("a", "two/a.jar").digest(digest))
            .unwrap();
        assert_eq!(admission, Admission::Replaced { identical: true });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_reject_policy() {
        let mut registry = ExtensionRegistry::with_policy(DuplicatePolicy::Reject);
        registry.admit(managed("a", "first/a.jar")).unwrap();
        let err = registry.admit(managed("a", "second/a.jar")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("a".to_string()));
        assert_eq!(registry.get("a").unwrap().path(), Path::new("first/a.jar"));
    }

    #[test]
    fn test_set_enabled_through_shared_reference() {
        let mut registry = ExtensionRegistry::new();
        registry.admit(managed("a", "a.jar")).unwrap();
        registry.admit(managed("b", "b.jar")).unwrap();

        let shared = Arc::new(registry);
        assert!(shared.set_enabled("a", false));
        assert!(!shared.set_enabled("missing", false));

        let enabled: Vec<&str> = shared.enabled().map(|r| r.name()).collect();
        assert_eq!(enabled, vec!["b"]);
        assert!(shared.summary().contains("a vunknown (a.jar) [disabled]"));

        assert!(shared.set_enabled("a", true));
        assert_eq!(shared.enabled().count(), 2);
    }
}
