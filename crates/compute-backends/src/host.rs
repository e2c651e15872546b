//! Host backend
//!
//! Reference backend: every enqueue runs to completion on the calling thread
//! and returns an already-resolved event.
//!
//! # Usage
//!
//! ```rust
//! use compute_backends::HostContext;
//! use compute_kernel::{ComputeContext, ContextConfig};
//!
//! let ctx = HostContext::with_config(ContextConfig::default().with_profiling(true));
//! let queue = ctx.queue("main").unwrap();
//! assert!(!queue.has_outstanding_work());
//! ```

use std::any::Any;
use std::sync::Arc;

use compute_kernel::{
    cached_kernel, grid_points, register_kernel, validate_launch, validate_region, BackendKind, BoundKernel,
    ComputeContext, ComputeQueue, ContextCache, ContextConfig, ContextId, Event, GridRange, Kernel,
    MemoryRegionHandle, ProfilingClock, ProfilingInfo, Result, ValueDescription,
};
use compute_tracing::perf_span;
use compute_tracing::performance::record_launch;
use tracing::trace;

use crate::memory::ContextState;

/// Synchronous host execution context
#[derive(Clone)]
pub struct HostContext {
    state: Arc<ContextState>,
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HostContext {
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self {
            state: Arc::new(ContextState::new(BackendKind::Host, config)),
        }
    }

    pub fn from_env() -> Self {
        Self::with_config(ContextConfig::from_env())
    }

    /// Bytes currently allocated through this context.
    pub fn allocated_bytes(&self) -> usize {
        self.state.memory.read().allocated_bytes()
    }
}

impl ComputeContext for HostContext {
    fn id(&self) -> ContextId {
        self.state.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Host
    }

    fn config(&self) -> &ContextConfig {
        &self.state.config
    }

    fn clock(&self) -> &ProfilingClock {
        &self.state.clock
    }

    fn queue(&self, label: &str) -> Result<Arc<dyn ComputeQueue>> {
        Ok(Arc::new(HostQueue {
            context: self.clone(),
            label: label.to_string(),
        }))
    }

    fn allocate(&self, name: &str, element: Arc<ValueDescription>, count: usize) -> Result<MemoryRegionHandle> {
        self.state.memory.write().allocate(name, element, count)
    }

    fn free(&self, region: &MemoryRegionHandle) -> Result<()> {
        self.state.memory.write().free(region)
    }

    fn cache(&self) -> &ContextCache {
        &self.state.cache
    }

    fn kernel(&self, name: &str) -> Result<Arc<Kernel>> {
        cached_kernel(self, name)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Queue that executes each command before returning
pub struct HostQueue {
    context: HostContext,
    label: String,
}

impl HostQueue {
    fn timestamps(&self, queued: u64, start: u64, end: u64) -> Option<ProfilingInfo> {
        self.context.config().profiling.then_some(ProfilingInfo {
            queued,
            submit: queued,
            start,
            end,
            complete: Some(end),
        })
    }

    /// Wait for `prereqs`, run `work` and wrap it in a resolved event.
    fn run(&self, op: &str, prereqs: &[Event], work: impl FnOnce() -> Result<()>) -> Result<Event> {
        let clock = self.context.clock();
        let queued = clock.now_ns();
        Event::wait_all(prereqs)?;
        let start = clock.now_ns();
        work()?;
        let end = clock.now_ns();
        Ok(Event::resolved_with(op, self.timestamps(queued, start, end)))
    }
}

impl ComputeQueue for HostQueue {
    fn label(&self) -> &str {
        &self.label
    }

    fn context(&self) -> ContextId {
        self.context.id()
    }

    fn launch_ranges(&self, op: &str, bound: &BoundKernel, grid: &[GridRange], prereqs: &[Event]) -> Result<Event> {
        if validate_launch(self.context.id(), op, bound, grid)? {
            trace!(kernel = bound.kernel_name(), op, "empty grid, nothing to launch");
            return Ok(Event::resolved(op));
        }
        self.run(op, prereqs, || {
            let span = perf_span!("launch", kernel = bound.kernel_name(), queue = self.label.as_str());
            bound.call(&self.context, grid)?;
            record_launch(bound.kernel_name(), grid_points(grid), span.elapsed_us());
            Ok(())
        })
    }

    fn enqueue_fill(
        &self,
        op: &str,
        region: &MemoryRegionHandle,
        pattern: &[u8],
        offset: usize,
        length: usize,
        prereqs: &[Event],
    ) -> Result<Event> {
        validate_region(self.context.id(), op, region)?;
        self.run(op, prereqs, || region.fill_bytes(pattern, offset, length))
    }

    fn enqueue_copy(
        &self,
        op: &str,
        from: &MemoryRegionHandle,
        to: &MemoryRegionHandle,
        prereqs: &[Event],
    ) -> Result<Event> {
        validate_region(self.context.id(), op, from)?;
        validate_region(self.context.id(), op, to)?;
        self.run(op, prereqs, || from.copy_to(to))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn has_outstanding_work(&self) -> bool {
        false
    }
}

/// Register a host kernel factory under `name`.
pub fn register_host_kernel<F>(name: &str, factory: F) -> Result<()>
where
    F: Fn(&dyn ComputeContext) -> Result<Kernel> + Send + Sync + 'static,
{
    register_kernel(BackendKind::Host, name, factory)
}
