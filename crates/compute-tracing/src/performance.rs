//! Performance instrumentation: RAII timing spans and standard events.
//!
//! ```rust
//! use compute_tracing::performance::{record_allocation, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("bind", Some(100));
//! // ... work ...
//! drop(span); // logs only if the work took at least 100us
//!
//! record_allocation(1024, "host", 64, 3);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
// u64::MAX means "no global threshold"
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply the process-wide performance tracing settings.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match GLOBAL_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        value => Some(value),
    }
}

/// RAII guard that measures its own lifetime and logs on drop.
///
/// The span logs only when performance tracing is enabled and the elapsed
/// time reaches the larger of the per-span and global thresholds.
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(span_name: impl AsRef<str>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, span_name, threshold_us)
    }

    pub fn with_level(level: Level, span_name: impl AsRef<str>, threshold_us: Option<u64>) -> Self {
        let name = span_name.as_ref();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    fn effective_threshold(&self) -> Option<u64> {
        match (self.threshold_us, global_threshold()) {
            (Some(local), Some(global)) => Some(local.max(global)),
            (local, global) => local.or(global),
        }
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.effective_threshold().is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a memory region allocation.
pub fn record_allocation(size_bytes: usize, backend: &str, alignment: usize, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        backend = backend,
        alignment = alignment,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record a completed kernel launch with the number of grid points visited.
pub fn record_launch(kernel: &str, grid_points: u64, duration_us: u64) {
    let throughput = if duration_us > 0 {
        (grid_points as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };

    tracing::debug!(
        event = "launch",
        kernel = kernel,
        grid_points = grid_points,
        duration_us = duration_us,
        points_per_sec = throughput,
        "kernel_launch"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn span_measures_elapsed_time() {
        configure(true, None);
        let span = PerformanceSpan::new("sleep", None);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(span.elapsed_us() >= 1000);
    }

    #[test]
    #[serial]
    fn global_threshold_combines_with_local() {
        configure(true, Some(500));
        let span = PerformanceSpan::new("threshold", Some(100));
        assert_eq!(span.effective_threshold(), Some(500));
        let span = PerformanceSpan::new("threshold", Some(900));
        assert_eq!(span.effective_threshold(), Some(900));
        configure(true, None);
        let span = PerformanceSpan::new("threshold", None);
        assert_eq!(span.effective_threshold(), None);
    }

    #[test]
    #[serial]
    fn disabling_is_observable() {
        configure(false, None);
        assert!(!is_enabled());
        configure(true, None);
        assert!(is_enabled());
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_allocation(4096, "host", 64, 1);
        record_launch("addOne", 1, 0);
    }
}
