//! Managed artifact inspection
//!
//! Opens a `.jar` as a zip archive and reads the first descriptor it carries.

use std::io::{Cursor, Read};
use std::path::Path;
use thiserror::Error;
use voidloader_api::{ModDescriptor, DESCRIPTOR_FILES};
use zip::result::ZipError;
use zip::ZipArchive;

/// Errors that make an artifact unusable
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to read artifact: {0}")]
    Io(#[source] std::io::Error),

    #[error("Not a valid archive: {0}")]
    Zip(#[source] ZipError),
}

/// What discovery learns from a managed artifact
#[derive(Debug)]
pub struct ManagedArtifact {
    /// Embedded descriptor, if one was present and well-formed
    pub descriptor: Option<ModDescriptor>,
    /// BLAKE3 digest of the artifact bytes
    pub digest: blake3::Hash,
}

/// Read a managed artifact from disk
pub fn read_managed_artifact(path: &Path) -> Result<ManagedArtifact, ArchiveError> {
    let bytes = std::fs::read(path).map_err(ArchiveError::Io)?;
    inspect_managed_bytes(path, &bytes)
}

/// Inspect managed artifact bytes already in memory
pub fn inspect_managed_bytes(path: &Path, bytes: &[u8]) -> Result<ManagedArtifact, ArchiveError> {
    let digest = blake3::hash(bytes);
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(ArchiveError::Zip)?;

    let mut descriptor = None;
    for file_name in DESCRIPTOR_FILES {
        let text = match read_entry(&mut archive, file_name) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(path = %path.display(), entry = %file_name, error = %e, "Unreadable descriptor entry");
                continue;
            }
        };

        match ModDescriptor::parse(file_name, &text) {
            Ok(parsed) => {
                descriptor = Some(parsed);
                break;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), entry = %file_name, error = %e, "Malformed descriptor");
            }
        }
    }

    Ok(ManagedArtifact { descriptor, digest })
}

/// Hash an artifact whose contents are not inspected
pub fn digest_file(path: &Path) -> Result<blake3::Hash, ArchiveError> {
    let bytes = std::fs::read(path).map_err(ArchiveError::Io)?;
    Ok(blake3::hash(&bytes))
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ArchiveError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(ArchiveError::Zip(e)),
    };

    let mut text = String::new();
    entry.read_to_string(&mut text).map_err(ArchiveError::Io)?;
    Ok(Some(text))
}
