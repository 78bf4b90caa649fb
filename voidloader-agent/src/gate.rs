//! Class classification gate
//!
//! Decides, for every class entering the host, whether it is categorically
//! excluded, a declared transformation target, or ignored.
//!
//! Exclusion is namespace-prefix based and checked first; targeting is
//! exact-name based. A name matching both is excluded.

use thiserror::Error;

/// Host runtime, bundled libraries and the launcher itself
pub const DEFAULT_EXCLUDED_PREFIXES: &[&str] = &[
    "java/",
    "javax/",
    "sun/",
    "jdk/",
    "com/sun/",
    "org/prismlauncher/",
    "org/gtm/",
    "com/google/",
    "org/apache/",
    "org/slf4j/",
    "org/lwjgl/",
    "org/objectweb/",
    "io/",
    "okhttp3/",
    "okio/",
    "kotlin/",
    "scala/",
    "org/json/",
    "com/mojang/",
    "org/spongepowered/",
    "org/reflections/",
    "oshi/",
    "net/minecrell/",
    "org/checkerframework/",
];

/// Classes eligible for transformation
pub const DEFAULT_TARGET_CLASSES: &[&str] = &[
    "net/minecraft/client/Minecraft",
    "net/minecraft/client/main/Main",
    "net/minecraft/server/MinecraftServer",
];

/// Outcome of classifying one class name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Inside an excluded namespace; never transformed
    Excluded,
    /// Exact member of the target set
    Target,
    /// Neither; left alone
    Ignored,
}

/// Errors that can occur while building a gate
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("Exclusion prefix must be a namespace ending in '/': {0:?}")]
    InvalidPrefix(String),

    #[error("Target class name must not be empty")]
    EmptyTarget,
}

/// Read-only classification sets
///
/// Both sets are sorted once at construction. An exclusion lookup probes each
/// `/`-terminated leading segment of the name with a binary search, so the
/// cost grows with namespace depth and `log` of the set size, and never
/// allocates.
#[derive(Debug, Clone)]
pub struct ClassGate {
    excluded: Vec<Box<str>>,
    targets: Vec<Box<str>>,
}

impl ClassGate {
    /// Build a gate from custom sets
    pub fn new<E, T>(
        excluded: impl IntoIterator<Item = E>,
        targets: impl IntoIterator<Item = T>,
    ) -> Result<Self, GateError>
    where
        E: AsRef<str>,
        T: AsRef<str>,
    {
        let mut excluded_set = Vec::new();
        for prefix in excluded {
            let prefix = prefix.as_ref();
            if prefix.len() < 2 || !prefix.ends_with('/') {
                return Err(GateError::InvalidPrefix(prefix.to_string()));
            }
            excluded_set.push(Box::<str>::from(prefix));
        }

        let mut target_set = Vec::new();
        for target in targets {
            let target = target.as_ref();
            if target.is_empty() {
                return Err(GateError::EmptyTarget);
            }
            target_set.push(Box::<str>::from(target));
        }

        excluded_set.sort();
        excluded_set.dedup();
        target_set.sort();
        target_set.dedup();

        Ok(Self {
            excluded: excluded_set,
            targets: target_set,
        })
    }

    /// Classify a fully-qualified internal class name
    pub fn classify(&self, name: &str) -> Classification {
        if self.is_excluded(name) {
            return Classification::Excluded;
        }
        if self.is_target(name) {
            return Classification::Target;
        }
        Classification::Ignored
    }

    /// Whether `name` lies inside an excluded namespace
    pub fn is_excluded(&self, name: &str) -> bool {
        name.match_indices('/').any(|(slash, _)| {
            let segment = &name[..=slash];
            self.excluded
                .binary_search_by(|prefix| prefix.as_ref().cmp(segment))
                .is_ok()
        })
    }

    /// Whether `name` is an exact member of the target set
    pub fn is_target(&self, name: &str) -> bool {
        self.targets
            .binary_search_by(|target| target.as_ref().cmp(name))
            .is_ok()
    }

    pub fn excluded_prefixes(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(AsRef::as_ref)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(AsRef::as_ref)
    }
}

impl Default for ClassGate {
    fn default() -> Self {
        Self {
            excluded: sorted(DEFAULT_EXCLUDED_PREFIXES),
            targets: sorted(DEFAULT_TARGET_CLASSES),
        }
    }
}

fn sorted(values: &[&str]) -> Vec<Box<str>> {
    let mut out: Vec<Box<str>> = values.iter().map(|v| Box::<str>::from(*v)).collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_targets_classify_as_target() {
        let gate = ClassGate::default();
        for name in DEFAULT_TARGET_CLASSES {
            assert_eq!(gate.classify(name), Classification::Target, "{name}");
        }
    }

    #[test]
    fn test_every_excluded_prefix_excludes() {
        let gate = ClassGate::default();
        for prefix in DEFAULT_EXCLUDED_PREFIXES {
            let name = format!("{prefix}Some/Inner$Class");
            assert_eq!(gate.classify(&name), Classification::Excluded, "{name}");
        }
    }

    #[test]
    fn test_exclusion_wins_over_target() {
        let gate = ClassGate::new(["net/minecraft/"], ["net/minecraft/client/Minecraft"]).unwrap();
        assert_eq!(
            gate.classify("net/minecraft/client/Minecraft"),
            Classification::Excluded
        );
    }

    #[test]
    fn test_unlisted_names_are_ignored() {
        let gate = ClassGate::default();
        assert_eq!(
            gate.classify("net/minecraft/client/MinecraftClient"),
            Classification::Ignored
        );
        assert_eq!(gate.classify("net/minecraft/client"), Classification::Ignored);
        assert_eq!(gate.classify("Main"), Classification::Ignored);
        assert_eq!(gate.classify("com/example/Mod"), Classification::Ignored);
    }

    #[test]
    fn test_prefix_match_is_namespace_aligned() {
        let gate = ClassGate::default();
        // "io/" must not swallow "iodine/..." nor "javafx/..." match "java/".
        assert_eq!(gate.classify("iodine/Thing"), Classification::Ignored);
        assert_eq!(gate.classify("javafx/scene/Node"), Classification::Ignored);
        assert_eq!(gate.classify("io/netty/Channel"), Classification::Excluded);
        assert_eq!(gate.classify("com/sun/proxy/$Proxy1"), Classification::Excluded);
        assert_eq!(gate.classify("com/sunny/Day"), Classification::Ignored);
    }

    #[test]
    fn test_nested_prefix_matches_deeper_namespace() {
        let gate = ClassGate::new(["org/apache/logging/"], Vec::<&str>::new()).unwrap();
        assert!(gate.is_excluded("org/apache/logging/log4j/Logger"));
        assert!(!gate.is_excluded("org/apache/commons/Io"));
    }

    #[test]
    fn test_rejects_prefix_without_separator() {
        let err = ClassGate::new(["java"], Vec::<&str>::new()).unwrap_err();
        assert_eq!(err, GateError::InvalidPrefix("java".to_string()));

        let err = ClassGate::new(["/"], Vec::<&str>::new()).unwrap_err();
        assert_eq!(err, GateError::InvalidPrefix("/".to_string()));
    }

    #[test]
    fn test_rejects_empty_target() {
        let err = ClassGate::new(["java/"], [""]).unwrap_err();
        assert_eq!(err, GateError::EmptyTarget);
    }
}
