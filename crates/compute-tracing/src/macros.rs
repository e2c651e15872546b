//! Convenience macros for performance tracing.

/// Create a [`crate::performance::PerformanceSpan`] with optional fields.
///
/// ```rust
/// use compute_tracing::perf_span;
///
/// {
///     let _span = perf_span!("launch", kernel = "addOne", points = 1);
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let span = $crate::performance::PerformanceSpan::new($name, None);
        $crate::tracing::debug!(perf = $name, $($field = $value),+);
        span
    }};
}

/// Emit a standardized debug-level performance event.
///
/// ```rust
/// use compute_tracing::perf_event;
///
/// perf_event!("queue_flush", commands = 4);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::tracing::debug!(event = $name, $($field = $value),+);
    };
}

/// Run a block and return `(result, duration_us)`.
///
/// ```rust
/// use compute_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<u32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn perf_span_with_fields() {
        let span = perf_span!("bind", kernel = "addOne", params = 2);
        assert!(span.elapsed_us() < 1_000_000);
    }

    #[test]
    fn timed_block_returns_result() {
        let (value, _) = timed_block!("square", { 7 * 7 });
        assert_eq!(value, 49);
    }

    #[test]
    fn perf_event_compiles_with_trailing_comma() {
        perf_event!("flush", commands = 3,);
    }
}
