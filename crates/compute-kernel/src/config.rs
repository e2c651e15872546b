//! Context configuration

use std::env;

use serde::{Deserialize, Serialize};

/// Settings fixed when a context is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Record [`crate::ProfilingInfo`] on every event.
    pub profiling: bool,
    /// Asynchronous queues submit automatically once this many commands are
    /// pending. `0` submits only on `flush`, `finish` or an event wait.
    pub stream_batch_size: usize,
    /// Prefix for worker thread names.
    pub worker_name: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            profiling: false,
            stream_batch_size: 32,
            worker_name: "compute-queue".to_string(),
        }
    }
}

impl ContextConfig {
    /// Defaults overridden by `COMPUTE_PROFILING`, `COMPUTE_STREAM_BATCH`
    /// and `COMPUTE_WORKER_NAME`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(flag) = env::var("COMPUTE_PROFILING") {
            config.profiling = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        if let Ok(batch) = env::var("COMPUTE_STREAM_BATCH") {
            match batch.trim().parse::<usize>() {
                Ok(value) => config.stream_batch_size = value,
                Err(_) => tracing::warn!(value = %batch, "ignoring unparsable COMPUTE_STREAM_BATCH"),
            }
        }

        if let Ok(name) = env::var("COMPUTE_WORKER_NAME") {
            if !name.trim().is_empty() {
                config.worker_name = name.trim().to_string();
            }
        }

        config
    }

    pub fn with_profiling(mut self, profiling: bool) -> Self {
        self.profiling = profiling;
        self
    }

    pub fn with_stream_batch_size(mut self, batch: usize) -> Self {
        self.stream_batch_size = batch;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &["COMPUTE_PROFILING", "COMPUTE_STREAM_BATCH", "COMPUTE_WORKER_NAME"];

    fn reset_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        reset_env();
        env::set_var("COMPUTE_PROFILING", "true");
        env::set_var("COMPUTE_STREAM_BATCH", "4");
        env::set_var("COMPUTE_WORKER_NAME", "gpu-sim");

        let config = ContextConfig::from_env();
        assert!(config.profiling);
        assert_eq!(config.stream_batch_size, 4);
        assert_eq!(config.worker_name, "gpu-sim");
        reset_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_garbage() {
        reset_env();
        env::set_var("COMPUTE_STREAM_BATCH", "lots");
        let config = ContextConfig::from_env();
        assert_eq!(config.stream_batch_size, ContextConfig::default().stream_batch_size);
        reset_env();
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = ContextConfig::default().with_profiling(true).with_stream_batch_size(0);
        let json = serde_json::to_string(&config).unwrap();
        let back: ContextConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
