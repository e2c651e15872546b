//! Shared tracing configuration for the compute-kernel workspace.
//!
//! Executables, integration tests and benches install their `tracing`
//! subscriber through this crate so every backend logs with the same
//! filter semantics and output formats.
//!
//! A configuration starts from a [`TracingProfile`] and is then adjusted by
//! `COMPUTE_TRACING_*` and `COMPUTE_PERF_*` variables in
//! [`TracingConfig::from_env`].

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::error::Error;
use std::fmt;

pub use tracing;
pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

const PROFILE_VAR: &str = "COMPUTE_TRACING_PROFILE";
const DIRECTIVES_VAR: &str = "COMPUTE_TRACING_DIRECTIVES";
const FORMAT_VAR: &str = "COMPUTE_TRACING_FORMAT";
const PERF_VAR: &str = "COMPUTE_PERF_TRACING";
const PERF_THRESHOLD_VAR: &str = "COMPUTE_PERF_THRESHOLD_US";

/// Named starting points for a [`TracingConfig`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingProfile {
    /// Pretty, coloured output for a developer terminal.
    #[default]
    Local,
    /// JSON lines without colour for log collectors.
    Ci,
    /// JSON with launch and queue timing enabled.
    Performance,
}

impl TracingProfile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" => Some(Self::Local),
            "ci" => Some(Self::Ci),
            "performance" | "perf" => Some(Self::Performance),
            _ => None,
        }
    }
}

/// Formatter used by the fmt layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// How the shared subscriber filters and formats events.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `compute_backends=debug,info`. When unset,
    /// `RUST_LOG` is consulted before `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    /// Print module paths next to each event.
    pub include_targets: bool,
    /// Print thread names; stream workers are named after their queue.
    pub include_thread_names: bool,
    pub ansi: bool,
    pub span_events: FmtSpan,
    pub output: TracingOutput,
    /// Performance spans are always created, but only log when this is set.
    pub enable_performance_tracing: bool,
    /// Spans shorter than this many microseconds stay silent.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_profile(TracingProfile::Local)
    }
}

impl TracingConfig {
    pub fn for_profile(profile: TracingProfile) -> Self {
        let local = profile == TracingProfile::Local;
        Self {
            directives: match profile {
                TracingProfile::Performance => Some("compute_kernel=debug,compute_backends=debug".to_string()),
                _ => None,
            },
            default_directive: "info".to_string(),
            include_targets: true,
            include_thread_names: !local,
            ansi: local,
            span_events: match profile {
                TracingProfile::Performance => FmtSpan::CLOSE,
                _ => FmtSpan::NONE,
            },
            output: if local { TracingOutput::Pretty } else { TracingOutput::Json },
            enable_performance_tracing: match profile {
                TracingProfile::Local => cfg!(debug_assertions),
                TracingProfile::Ci => false,
                TracingProfile::Performance => true,
            },
            performance_threshold_us: None,
        }
    }

    pub fn for_local() -> Self {
        Self::for_profile(TracingProfile::Local)
    }

    pub fn for_ci() -> Self {
        Self::for_profile(TracingProfile::Ci)
    }

    pub fn for_performance() -> Self {
        Self::for_profile(TracingProfile::Performance)
    }

    /// Start from `COMPUTE_TRACING_PROFILE` (`local`, `ci` or `performance`)
    /// and apply the overrides:
    ///
    /// | variable | effect |
    /// |----------|--------|
    /// | `COMPUTE_TRACING_DIRECTIVES` | replaces `directives` |
    /// | `COMPUTE_TRACING_FORMAT` | `pretty`, `compact` or `json` |
    /// | `COMPUTE_PERF_TRACING` | `1`, `true` or `yes` enables performance spans |
    /// | `COMPUTE_PERF_THRESHOLD_US` | minimum span duration that logs |
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let profile = non_empty_var(PROFILE_VAR)
            .and_then(|value| TracingProfile::parse(&value))
            .unwrap_or_default();
        let mut config = Self::for_profile(profile);

        if let Some(directives) = non_empty_var(DIRECTIVES_VAR) {
            config.directives = Some(directives);
        }
        if let Some(output) = non_empty_var(FORMAT_VAR).and_then(|value| TracingOutput::parse(&value)) {
            config.output = output;
            config.ansi &= output != TracingOutput::Json;
        }
        if let Some(flag) = non_empty_var(PERF_VAR) {
            config.enable_performance_tracing = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(threshold) = non_empty_var(PERF_THRESHOLD_VAR).and_then(|value| value.parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }

        config
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        if let Some(directives) = &self.directives {
            return EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()));
        }
        Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive)))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Failure to build or install the shared subscriber.
#[derive(Debug)]
pub enum TracingSetupError {
    InvalidFilter(String),
    /// Usually means another subscriber was installed first.
    SubscriberInit(tracing_subscriber::util::TryInitError),
}

impl fmt::Display for TracingSetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFilter(msg) => write!(f, "invalid tracing directive: {msg}"),
            Self::SubscriberInit(err) => write!(f, "cannot install tracing subscriber: {err}"),
        }
    }
}

impl Error for TracingSetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SubscriberInit(err) => Some(err),
            Self::InvalidFilter(_) => None,
        }
    }
}

/// Build a subscriber from `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, fmt_layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(fmt_layer).with(filter))
}

/// Filter and formatting layers for callers composing their own registry.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.filter()?;
    let base = tracing_fmt::layer::<Registry>()
        .with_target(config.include_targets)
        .with_thread_names(config.include_thread_names)
        .with_span_events(config.span_events.clone())
        .with_ansi(config.ansi && config.output != TracingOutput::Json);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => Box::new(base.compact()),
        TracingOutput::Pretty => Box::new(base.pretty()),
        TracingOutput::Json => Box::new(base.json()),
    };
    Ok((filter, layer))
}

/// Install the configured subscriber process-wide and apply the performance
/// span settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    performance::configure(config.enable_performance_tracing, config.performance_threshold_us);
    build_subscriber(config)?
        .try_init()
        .map_err(TracingSetupError::SubscriberInit)
}

/// Install a subscriber for tests, ignoring "already installed" failures.
pub fn init_test_tracing() {
    let config = TracingConfig {
        output: TracingOutput::Compact,
        ansi: false,
        ..TracingConfig::from_env()
    };
    // Every test binary calls this; only the first install can succeed.
    let _ = init_global_tracing(&config);
}

/// Render a profiling record as a single JSON line for log collectors.
pub fn json_record(event: &str, fields: &[(&str, u64)]) -> String {
    let mut object = serde_json::Map::with_capacity(fields.len() + 1);
    object.insert("event".to_string(), serde_json::Value::String(event.to_string()));
    for (name, value) in fields {
        object.insert((*name).to_string(), serde_json::Value::from(*value));
    }
    serde_json::Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn reset_env(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    const KEYS: &[&str] = &[
        "COMPUTE_TRACING_PROFILE",
        "COMPUTE_TRACING_DIRECTIVES",
        "COMPUTE_TRACING_FORMAT",
        "COMPUTE_PERF_TRACING",
        "COMPUTE_PERF_THRESHOLD_US",
    ];

    #[test]
    #[serial]
    fn rejects_invalid_directive() {
        reset_env(KEYS);
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn builds_with_defaults() {
        reset_env(KEYS);
        assert!(build_subscriber(&TracingConfig::default()).is_ok());
    }

    #[test]
    #[serial]
    fn from_env_respects_profile_and_format() {
        reset_env(KEYS);
        env::set_var("COMPUTE_TRACING_PROFILE", "ci");
        env::set_var("COMPUTE_TRACING_FORMAT", "compact");
        env::set_var("COMPUTE_TRACING_DIRECTIVES", "compute_kernel=debug");

        let config = TracingConfig::from_env();
        assert_eq!(config.directives.as_deref(), Some("compute_kernel=debug"));
        assert!(!config.ansi);
        assert_eq!(config.output, TracingOutput::Compact);
        reset_env(KEYS);
    }

    #[test]
    #[serial]
    fn from_env_respects_performance_settings() {
        reset_env(KEYS);
        env::set_var("COMPUTE_PERF_TRACING", "yes");
        env::set_var("COMPUTE_PERF_THRESHOLD_US", "250");

        let config = TracingConfig::from_env();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));
        reset_env(KEYS);
    }

    #[test]
    #[serial]
    fn unknown_profile_falls_back_to_local() {
        reset_env(KEYS);
        env::set_var("COMPUTE_TRACING_PROFILE", "staging");
        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Pretty);
        assert!(config.directives.is_none());
        reset_env(KEYS);
    }

    #[test]
    fn performance_preset_uses_json() {
        let config = TracingConfig::for_performance();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
    }

    #[test]
    fn json_record_contains_fields() {
        let line = json_record("launch", &[("start", 10), ("end", 25)]);
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["event"], "launch");
        assert_eq!(parsed["end"], 25);
    }
}
