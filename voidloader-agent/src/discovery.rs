//! Extension discovery and directory scanning
//!
//! Scans the mods directory for managed (`.jar`) and native (`.dll`, `.so`,
//! `.dylib`) artifacts and admits one record per usable artifact into the
//! registry. A bad artifact is reported and skipped; it never aborts the scan.

use crate::archive::{digest_file, read_managed_artifact, ArchiveError};
use crate::registry::{
    Admission, DuplicatePolicy, ExtensionKind, ExtensionRecord, ExtensionRegistry, RegistryError,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use voidloader_api::UNKNOWN_VERSION;

/// File extension of managed artifacts
pub const MANAGED_EXTENSION: &str = "jar";

/// File extensions of native artifacts
pub const NATIVE_EXTENSIONS: &[&str] = &["dll", "so", "dylib"];

/// Usage note written into a freshly created mods directory
pub const USAGE_NOTE_FILE: &str = "README.txt";

const USAGE_NOTE: &str = "VoidLoader Mods Directory
=======================

Place your .jar mod files here.
Native mods (.dll, .so, .dylib) are picked up as well.
The mod loader will automatically detect and load them on the next start.
";

/// Errors that can occur during discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Failed to read directory: {0}")]
    ReadDirectory(#[source] std::io::Error),

    #[error("Failed to load extension {path}: {source}")]
    LoadArtifact {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("Extension {path} not admitted: {source}")]
    Admission {
        path: PathBuf,
        #[source]
        source: RegistryError,
    },
}

/// Result of one discovery scan
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Identity names admitted during this scan, in registry order
    ///
    /// A name replaced by a later artifact appears once, at its new position.
    pub admitted: Vec<String>,

    /// Number of admitted records later replaced by an artifact with the same name
    pub superseded: usize,

    /// Candidates that failed to load or were refused
    pub failures: Vec<(PathBuf, DiscoveryError)>,

    /// Whether the directory had to be created
    pub created_directory: bool,
}

impl DiscoveryReport {
    /// Returns true if every candidate was admitted
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of candidate artifacts found
    pub fn total_found(&self) -> usize {
        self.admitted.len() + self.superseded + self.failures.len()
    }
}

/// Mods directory scanner
#[derive(Debug, Clone, Copy, Default)]
pub struct ModScanner {
    policy: DuplicatePolicy,
}

impl ModScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }

    /// Scan `dir` into a new registry
    pub fn discover(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<(ExtensionRegistry, DiscoveryReport), DiscoveryError> {
        let mut registry = ExtensionRegistry::with_policy(self.policy);
        let report = self.discover_into(dir, &mut registry)?;
        Ok((registry, report))
    }

    /// Scan `dir` and admit what it finds into `registry`
    ///
    /// A missing directory is created together with a usage note, and the
    /// scan returns an empty report.
    pub fn discover_into(
        &self,
        dir: impl AsRef<Path>,
        registry: &mut ExtensionRegistry,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        let dir = dir.as_ref();
        tracing::info!(dir = %dir.display(), "Scanning for mods");

        if !dir.exists() {
            return Ok(DiscoveryReport {
                created_directory: create_mods_directory(dir),
                ..Default::default()
            });
        }

        if !dir.is_dir() {
            return Err(DiscoveryError::NotADirectory(dir.to_path_buf()));
        }

        let mut report = DiscoveryReport::default();
        let mut candidates = Vec::new();

        for entry in std::fs::read_dir(dir).map_err(DiscoveryError::ReadDirectory)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    report
                        .failures
                        .push((dir.to_path_buf(), DiscoveryError::ReadDirectory(e)));
                    continue;
                }
            };

            let path = entry.path();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(kind) = artifact_kind(&path) {
                candidates.push((path, kind));
            }
        }

        // read_dir order is platform dependent; registry order must not be.
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, kind) in candidates {
            let record = match load_candidate(&path, kind) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to load mod");
                    report.failures.push((path, e));
                    continue;
                }
            };

            let name = record.name().to_string();
            let version = record.version_str().to_string();
            match registry.admit(record) {
                Ok(admission) => {
                    if let Admission::Replaced { .. } = admission {
                        if let Some(pos) = report.admitted.iter().position(|n| n == &name) {
                            report.admitted.remove(pos);
                        }
                        report.superseded += 1;
                    }
                    tracing::info!(
                        extension = %name,
                        version = %version,
                        kind = %kind,
                        path = %path.display(),
                        "Loaded mod"
                    );
                    report.admitted.push(name);
                }
                Err(source) => {
                    report
                        .failures
                        .push((path.clone(), DiscoveryError::Admission { path, source }));
                }
            }
        }

        tracing::info!(
            found = report.total_found(),
            admitted = report.admitted.len(),
            failed = report.failures.len(),
            "Discovery finished"
        );
        if !registry.is_empty() {
            tracing::info!("Loaded mods:\n{}", registry.summary());
        }

        Ok(report)
    }
}

/// Split an artifact file stem into identity name and version
///
/// Follows `<name>-<version>`, splitting on the last `-`. Without a usable
/// split the whole stem is the name and the version is unknown.
pub fn parse_artifact_filename(stem: &str) -> (String, String) {
    match stem.rsplit_once('-') {
        Some((name, version)) if !name.is_empty() => {
            let version = if version.is_empty() {
                UNKNOWN_VERSION
            } else {
                version
            };
            (name.to_string(), version.to_string())
        }
        _ => (stem.to_string(), UNKNOWN_VERSION.to_string()),
    }
}

/// Classify a path by its file extension
pub fn artifact_kind(path: &Path) -> Option<ExtensionKind> {
    let ext = path.extension()?.to_str()?;
    if ext.eq_ignore_ascii_case(MANAGED_EXTENSION) {
        Some(ExtensionKind::Managed)
    } else if NATIVE_EXTENSIONS
        .iter()
        .any(|native| ext.eq_ignore_ascii_case(native))
    {
        Some(ExtensionKind::Native)
    } else {
        None
    }
}

fn load_candidate(path: &Path, kind: ExtensionKind) -> Result<ExtensionRecord, DiscoveryError> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let load_error = |source: ArchiveError| DiscoveryError::LoadArtifact {
        path: path.to_path_buf(),
        source,
    };
    let admission_error = |source: RegistryError| DiscoveryError::Admission {
        path: path.to_path_buf(),
        source,
    };

    match kind {
        ExtensionKind::Managed => {
            let artifact = read_managed_artifact(path).map_err(load_error)?;
            let record = match artifact.descriptor {
                Some(descriptor) => ExtensionRecord::from_descriptor(descriptor, path),
                None => {
                    let (name, version) = parse_artifact_filename(&stem);
                    tracing::debug!(path = %path.display(), "No descriptor, using file name");
                    ExtensionRecord::new(name, kind, path).map(|r| r.version(version))
                }
            };
            Ok(record.map_err(admission_error)?.digest(artifact.digest))
        }
        ExtensionKind::Native => {
            // Metadata query through the library's export is not performed
            // during discovery.
            let digest = digest_file(path).map_err(load_error)?;
            let record = ExtensionRecord::new(stem, kind, path).map_err(admission_error)?;
            Ok(record.digest(digest))
        }
    }
}

/// Returns whether the directory now exists
fn create_mods_directory(dir: &Path) -> bool {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to create mods directory");
        return false;
    }
    tracing::info!(dir = %dir.display(), "Created mods directory");

    if let Err(e) = std::fs::write(dir.join(USAGE_NOTE_FILE), USAGE_NOTE) {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to write usage note");
    }
    true
}
