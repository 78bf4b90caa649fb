//! voidloader-api: Shared types for the VoidLoader extension system
//!
//! This crate defines the contract between the agent and extension ("mod")
//! authors: the descriptor a managed artifact embeds, and the transformer
//! trait an extension implements to rewrite class bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Descriptor path inside a managed artifact, in VoidLoader's own format
pub const DESCRIPTOR_FILE: &str = "voidloader.mod.json";

/// Descriptor path inside a Fabric-style managed artifact
pub const FABRIC_DESCRIPTOR_FILE: &str = "fabric.mod.json";

/// Descriptor paths in lookup order
pub const DESCRIPTOR_FILES: &[&str] = &[DESCRIPTOR_FILE, FABRIC_DESCRIPTOR_FILE];

/// Version reported when an artifact does not carry a usable one
pub const UNKNOWN_VERSION: &str = "unknown";

fn unknown_version() -> String {
    UNKNOWN_VERSION.to_string()
}

/// Identity metadata embedded in a managed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModDescriptor {
    /// Identity name (unique across the registry)
    pub name: String,

    /// Free-form version string
    #[serde(default = "unknown_version")]
    pub version: String,

    /// Mod author
    #[serde(default)]
    pub author: Option<String>,

    /// Short description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared dependency names, descriptive only
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Fully-qualified internal class names this mod declares rules for
    #[serde(default)]
    pub transforms: Vec<String>,
}

/// Errors that can occur while reading a descriptor
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Descriptor is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("Descriptor does not name the mod")]
    EmptyName,

    #[error("Unsupported descriptor file: {0}")]
    UnsupportedFile(String),
}

impl ModDescriptor {
    /// Create a descriptor with only a name and version
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: None,
            description: None,
            dependencies: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add a transformation target
    pub fn transform(mut self, class_name: impl Into<String>) -> Self {
        self.transforms.push(class_name.into());
        self
    }

    /// Add a declared dependency
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Parse a descriptor, choosing the format from the file it was read from
    pub fn parse(file_name: &str, text: &str) -> Result<Self, DescriptorError> {
        match file_name {
            DESCRIPTOR_FILE => Self::from_voidloader_json(text),
            FABRIC_DESCRIPTOR_FILE => Self::from_fabric_json(text),
            other => Err(DescriptorError::UnsupportedFile(other.to_string())),
        }
    }

    /// Parse `voidloader.mod.json`
    pub fn from_voidloader_json(text: &str) -> Result<Self, DescriptorError> {
        let descriptor: ModDescriptor =
            serde_json::from_str(text).map_err(DescriptorError::Json)?;
        descriptor.normalized()
    }

    /// Parse `fabric.mod.json`, mapping its fields onto a descriptor
    pub fn from_fabric_json(text: &str) -> Result<Self, DescriptorError> {
        let fabric: FabricModJson = serde_json::from_str(text).map_err(DescriptorError::Json)?;

        let name = fabric.id.or(fabric.name).unwrap_or_default();
        let author = fabric.authors.into_iter().next().map(|person| match person {
            FabricPerson::Name(name) => name,
            FabricPerson::Detailed { name } => name,
        });

        Self {
            name,
            version: fabric.version.unwrap_or_else(unknown_version),
            author,
            description: fabric.description,
            dependencies: fabric.depends.into_keys().collect(),
            transforms: Vec::new(),
        }
        .normalized()
    }

    fn normalized(mut self) -> Result<Self, DescriptorError> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }

        self.version = self.version.trim().to_string();
        if self.version.is_empty() {
            self.version = unknown_version();
        }

        for class in &mut self.transforms {
            *class = class.trim().to_string();
        }
        self.transforms.retain(|class| !class.is_empty());
        Ok(self)
    }
}

#[derive(Deserialize)]
struct FabricModJson {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    authors: Vec<FabricPerson>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    depends: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FabricPerson {
    Name(String),
    Detailed { name: String },
}

/// Error raised by a transformation rule
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Rule rejected {class}: {reason}")]
    Rejected { class: String, reason: String },

    #[error("Rule failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("Rule panicked: {0}")]
    Panicked(String),

    #[error("Rule produced an empty class buffer")]
    EmptyOutput,

    #[error("Rule output of {0} bytes exceeds the host buffer limit")]
    Oversized(usize),
}

impl TransformError {
    /// Create a rejection for a class
    pub fn rejected(class: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            class: class.into(),
            reason: reason.into(),
        }
    }
}

/// A transformation rule contributed by an extension
///
/// Rules are invoked synchronously on the host's class-loading thread and may
/// run concurrently for different classes. The input slice is never mutated;
/// a rule returns a new buffer.
///
/// # Example
///
/// ```rust
/// use voidloader_api::{ClassTransformer, TransformError};
///
/// struct Marker;
///
/// impl ClassTransformer for Marker {
///     fn applies_to(&self, class_name: &str) -> bool {
///         class_name == "net/minecraft/client/Minecraft"
///     }
///
///     fn transform(&self, _class_name: &str, class_bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
///         let mut out = class_bytes.to_vec();
///         out.push(0x2A);
///         Ok(out)
///     }
/// }
/// ```
pub trait ClassTransformer: Send + Sync {
    /// Whether this rule wants to rewrite `class_name`
    fn applies_to(&self, class_name: &str) -> bool;

    /// Produce the rewritten class bytes
    fn transform(&self, class_name: &str, class_bytes: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Rule built from a descriptor's `transforms` list
///
/// Applies to exactly the listed classes and returns a verified copy of the
/// input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTransform {
    targets: Vec<String>,
}

impl DeclaredTransform {
    pub fn new(targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        targets.sort();
        targets.dedup();
        Self { targets }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

impl ClassTransformer for DeclaredTransform {
    fn applies_to(&self, class_name: &str) -> bool {
        self.targets
            .binary_search_by(|target| target.as_str().cmp(class_name))
            .is_ok()
    }

    fn transform(&self, _class_name: &str, class_bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(class_bytes.to_vec())
    }
}
