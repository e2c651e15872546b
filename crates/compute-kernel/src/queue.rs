//! Command queues.
//!
//! A queue belongs to exactly one context. Every enqueue waits for its
//! prerequisite events before running and returns an [`Event`] for its own
//! completion.

use crate::bound::BoundKernel;
use crate::context::{ensure_same_context, ContextId};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::grid::{is_trivially_empty, GridRange};
use crate::memory::MemoryRegionHandle;

pub trait ComputeQueue: Send + Sync {
    fn label(&self) -> &str;

    /// Context this queue submits to.
    fn context(&self) -> ContextId;

    /// Launch `bound` over explicit ranges.
    fn launch_ranges(&self, op: &str, bound: &BoundKernel, grid: &[GridRange], prereqs: &[Event]) -> Result<Event>;

    /// Launch over zero-based extents, padded where the kernel allows it.
    fn launch(&self, op: &str, bound: &BoundKernel, extents: &[u32], prereqs: &[Event]) -> Result<Event> {
        let grid = bound.grid_for(extents)?;
        self.launch_ranges(op, bound, &grid, prereqs)
    }

    /// Launch over the grid the kernel's dimensions resolved to at bind time.
    fn launch_default(&self, op: &str, bound: &BoundKernel, prereqs: &[Event]) -> Result<Event> {
        let extents = bound
            .default_grid()
            .ok_or_else(|| {
                Error::declaration(
                    bound.kernel_name(),
                    "no default grid: the declared dimensions did not resolve from the bound arguments",
                )
            })?
            .to_vec();
        self.launch(op, bound, &extents, prereqs)
    }

    /// Repeat `pattern` over `length` bytes of `region` starting at `offset`.
    fn enqueue_fill(
        &self,
        op: &str,
        region: &MemoryRegionHandle,
        pattern: &[u8],
        offset: usize,
        length: usize,
        prereqs: &[Event],
    ) -> Result<Event>;

    /// Copy all of `from` into the start of `to`.
    fn enqueue_copy(
        &self,
        op: &str,
        from: &MemoryRegionHandle,
        to: &MemoryRegionHandle,
        prereqs: &[Event],
    ) -> Result<Event>;

    /// Submit pending work without waiting for it.
    fn flush(&self) -> Result<()>;

    /// Submit pending work and wait until all of it completed.
    fn finish(&self) -> Result<()>;

    fn make_already_resolved_event(&self) -> Event {
        Event::resolved(self.label())
    }

    fn has_outstanding_work(&self) -> bool;
}

/// Checks shared by every backend's `launch_ranges`. Returns `true` when
/// the grid is empty and nothing should run.
pub fn validate_launch(queue_context: ContextId, op: &str, bound: &BoundKernel, grid: &[GridRange]) -> Result<bool> {
    ensure_same_context(
        op,
        format_args!("bound kernel '{}'", bound.kernel_name()),
        queue_context,
        bound.context(),
    )?;
    bound.check_grid(grid)?;
    Ok(is_trivially_empty(grid))
}

pub fn validate_region(queue_context: ContextId, op: &str, region: &MemoryRegionHandle) -> Result<()> {
    ensure_same_context(op, region, queue_context, region.context())
}
