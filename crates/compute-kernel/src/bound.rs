//! Bound kernels: a kernel plus converted arguments, ready to launch.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::{ensure_same_context, ComputeContext, ContextId};
use crate::error::{Error, Result};
use crate::expr::Bindings;
use crate::grid::GridRange;
use crate::memory::Pin;

/// Backend-native launchable produced by a [`crate::CallableFactory`].
pub trait BoundCallable: Send + Sync {
    fn call(&self, ctx: &dyn ComputeContext, grid: &[GridRange]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

struct BoundInner {
    kernel: String,
    context: ContextId,
    grid_arity: usize,
    callable: Box<dyn BoundCallable>,
    pins: Vec<Pin>,
    bindings: Bindings,
    default_grid: Option<Vec<u32>>,
    pad_blocks: Vec<Option<u32>>,
}

/// Shared handle to a bound kernel.
///
/// Clones share the converted arguments and pins; pins are released when
/// the last clone is dropped. Queues hold a clone until a launch's event
/// resolves.
#[derive(Clone)]
pub struct BoundKernel {
    inner: Arc<BoundInner>,
}

impl BoundKernel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        kernel: String,
        context: ContextId,
        grid_arity: usize,
        callable: Box<dyn BoundCallable>,
        pins: Vec<Pin>,
        bindings: Bindings,
        default_grid: Option<Vec<u32>>,
        pad_blocks: Vec<Option<u32>>,
    ) -> Self {
        Self {
            inner: Arc::new(BoundInner {
                kernel,
                context,
                grid_arity,
                callable,
                pins,
                bindings,
                default_grid,
                pad_blocks,
            }),
        }
    }

    pub fn kernel_name(&self) -> &str {
        &self.inner.kernel
    }

    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    pub fn grid_arity(&self) -> usize {
        self.inner.grid_arity
    }

    /// Values the kernel's expressions were evaluated against.
    pub fn bindings(&self) -> &Bindings {
        &self.inner.bindings
    }

    /// Grid extents derived from the kernel's declared dimensions, when
    /// they resolved from the bound arguments.
    pub fn default_grid(&self) -> Option<&[u32]> {
        self.inner.default_grid.as_deref()
    }

    pub fn pin_count(&self) -> usize {
        self.inner.pins.len()
    }

    pub fn callable(&self) -> &dyn BoundCallable {
        &*self.inner.callable
    }

    pub fn check_grid(&self, grid: &[GridRange]) -> Result<()> {
        if grid.len() != self.inner.grid_arity {
            return Err(Error::GridDimensions {
                kernel: self.inner.kernel.clone(),
                expected: self.inner.grid_arity,
                supplied: grid.len(),
            });
        }
        if let Some(range) = grid.iter().find(|range| range.end().is_none()) {
            return Err(Error::invalid_region(format!(
                "kernel '{}': grid range {range} runs past u32::MAX",
                self.inner.kernel
            )));
        }
        Ok(())
    }

    /// Materialize extents into ranges starting at zero, padding the
    /// dimensions the kernel declared as padded.
    pub fn grid_for(&self, extents: &[u32]) -> Result<Vec<GridRange>> {
        if extents.len() != self.inner.grid_arity {
            return Err(Error::GridDimensions {
                kernel: self.inner.kernel.clone(),
                expected: self.inner.grid_arity,
                supplied: extents.len(),
            });
        }
        Ok(extents
            .iter()
            .enumerate()
            .map(|(dim, &extent)| {
                let range = GridRange::from_extent(extent);
                match self.inner.pad_blocks.get(dim).copied().flatten() {
                    Some(block) => range.padded_to(block),
                    None => range,
                }
            })
            .collect())
    }

    /// Run the kernel over `grid` on the calling thread.
    pub fn call(&self, ctx: &dyn ComputeContext, grid: &[GridRange]) -> Result<()> {
        self.check_grid(grid)?;
        ensure_same_context(
            "call bound kernel",
            format_args!("bound kernel '{}'", self.inner.kernel),
            self.inner.context,
            ctx.id(),
        )?;
        self.inner.callable.call(ctx, grid)
    }
}

impl fmt::Debug for BoundKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundKernel")
            .field("kernel", &self.inner.kernel)
            .field("context", &self.inner.context)
            .field("grid_arity", &self.inner.grid_arity)
            .field("pins", &self.inner.pins.len())
            .field("default_grid", &self.inner.default_grid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kernel::Kernel;
    use crate::marshal::MutSpan;
    use crate::memory::test_support::region;
    use crate::memory::Argument;
    use crate::testing::NullContext;

    fn counter_kernel() -> Kernel {
        let mut kernel = Kernel::new("count");
        kernel.add_parameter("hits", "rw", "u32[]").unwrap();
        kernel
            .set_compute_function(|_ctx, (hits,): &mut (MutSpan<u32>,)| hits.as_mut_slice()[0] += 1)
            .unwrap();
        kernel
    }

    #[test]
    fn test_zero_dimensional_runs_once() {
        let ctx = NullContext::new();
        let hits = region::<u32>(ctx.id(), "hits", 1);
        let bound = counter_kernel().bind(&ctx, &[Argument::region(&hits)]).unwrap();
        bound.call(&ctx, &[]).unwrap();
        assert_eq!(hits.to_vec::<u32>().unwrap(), vec![1]);

        let err = bound.call(&ctx, &[GridRange::from_extent(4)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GridDimensions);
        assert_eq!(hits.to_vec::<u32>().unwrap(), vec![1]);
    }

    #[test]
    fn test_clones_share_pins() {
        let ctx = NullContext::new();
        let hits = region::<u32>(ctx.id(), "hits", 1);
        let baseline = hits.pin().holders();
        let bound = counter_kernel().bind(&ctx, &[Argument::region(&hits)]).unwrap();
        let clone = bound.clone();
        assert_eq!(hits.pin().holders(), baseline + 1);
        drop(bound);
        assert_eq!(hits.pin().holders(), baseline + 1);
        drop(clone);
        assert_eq!(hits.pin().holders(), baseline);
    }

    #[test]
    fn test_call_from_foreign_context() {
        let ctx = NullContext::new();
        let other = NullContext::new();
        let hits = region::<u32>(ctx.id(), "hits", 1);
        let bound = counter_kernel().bind(&ctx, &[Argument::region(&hits)]).unwrap();
        assert_eq!(bound.call(&other, &[]).unwrap_err().kind(), ErrorKind::ForeignContext);
    }
}
