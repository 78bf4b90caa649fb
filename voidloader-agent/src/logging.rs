//! Tracing and logging support.
//!
//! Installs one process-wide `tracing` subscriber writing to stderr. Every
//! line carries its target (`voidloader_agent::...`), which identifies the
//! agent in the host's console output.

use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingFormat {
    /// Human-readable multi-line format.
    Pretty,

    /// Single-line format (default; interleaves well with host output).
    #[default]
    Compact,

    /// JSON format.
    Json,
}

impl FromStr for TracingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "unsupported log format `{other}`; expected pretty|compact|json"
            )),
        }
    }
}

/// Tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None and no directive is set, defaults to "info".
    pub level: Option<Level>,

    /// Full `EnvFilter` directive; takes precedence over `level`.
    pub directive: Option<String>,

    /// Output format.
    pub format: TracingFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include thread IDs in output.
    pub thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            directive: None,
            format: TracingFormat::Compact,
            timestamps: true,
            thread_ids: true,
        }
    }
}

impl TracingConfig {
    /// The filter directive this configuration resolves to
    pub fn filter_directive(&self) -> String {
        if let Some(directive) = self.directive.as_deref().map(str::trim) {
            if !directive.is_empty() {
                return directive.to_string();
            }
        }
        self.level
            .map(|level| level.to_string().to_ascii_lowercase())
            .unwrap_or_else(|| "info".to_string())
    }

    fn env_filter(&self) -> EnvFilter {
        let directive = self.filter_directive();
        EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            let fallback = self
                .level
                .map(|level| level.to_string().to_ascii_lowercase())
                .unwrap_or_else(|| "info".to_string());
            EnvFilter::new(fallback)
        })
    }
}

/// Install the process-wide subscriber.
///
/// Returns false when a subscriber was already installed (by an earlier call
/// or by an embedding application); the existing one stays in place.
pub fn init(config: &TracingConfig) -> bool {
    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .with(config.env_filter())
        .try_init()
        .is_ok()
}

fn fmt_layer<S>(config: &TracingConfig) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(config.thread_ids);

    match (config.format, config.timestamps) {
        (TracingFormat::Pretty, true) => base.pretty().boxed(),
        (TracingFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (TracingFormat::Compact, true) => base.compact().boxed(),
        (TracingFormat::Compact, false) => base.compact().without_time().boxed(),
        (TracingFormat::Json, true) => base.json().boxed(),
        (TracingFormat::Json, false) => base.json().without_time().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.format, TracingFormat::Compact);
        assert!(config.timestamps);
        assert!(config.thread_ids);
        assert_eq!(config.filter_directive(), "info");
    }

    #[test]
    fn test_directive_overrides_level() {
        let config = TracingConfig {
            level: Some(Level::WARN),
            directive: Some("voidloader_agent=trace".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "voidloader_agent=trace");

        let config = TracingConfig {
            level: Some(Level::WARN),
            directive: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.filter_directive(), "warn");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<TracingFormat>().unwrap(), TracingFormat::Json);
        assert_eq!(" pretty ".parse::<TracingFormat>().unwrap(), TracingFormat::Pretty);
        assert!("xml".parse::<TracingFormat>().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig::default();
        let first = init(&config);
        let second = init(&config);
        // Another test may have installed the subscriber first.
        assert!(!second);
        let _ = first;
    }
}
