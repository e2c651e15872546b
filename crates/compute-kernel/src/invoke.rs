//! Host compute bodies and their grid loops.
//!
//! Each invocation shape fixes how a launch grid is handed to the compute
//! function: per index, as a whole range, or a mix. Loops iterate dimension
//! 0 outermost and indices in ascending order.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bound::BoundCallable;
use crate::context::ComputeContext;
use crate::error::{Error, Result};
use crate::grid::GridRange;
use crate::kernel::{Binding, CallableFactory, Kernel};
use crate::marshal::KernelArgs;
use crate::memory::Argument;

/// How a compute function receives the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationShape {
    Grid0,
    Grid1,
    Grid1Range,
    Grid2,
    Grid2IndexRange,
    Grid2RangeIndex,
    Grid3IndexIndexRange,
    Grid3RangeIndexIndex,
}

impl InvocationShape {
    /// Number of grid dimensions a launch must supply.
    pub fn arity(self) -> usize {
        match self {
            InvocationShape::Grid0 => 0,
            InvocationShape::Grid1 | InvocationShape::Grid1Range => 1,
            InvocationShape::Grid2 | InvocationShape::Grid2IndexRange | InvocationShape::Grid2RangeIndex => 2,
            InvocationShape::Grid3IndexIndexRange | InvocationShape::Grid3RangeIndexIndex => 3,
        }
    }
}

impl fmt::Display for InvocationShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type Body0<A> = Box<dyn Fn(&dyn ComputeContext, &mut A) + Send + Sync>;
type Body1<A> = Box<dyn Fn(&dyn ComputeContext, u32, u32, &mut A) + Send + Sync>;
type BodyR<A> = Box<dyn Fn(&dyn ComputeContext, &GridRange, &mut A) + Send + Sync>;
type Body2<A> = Box<dyn Fn(&dyn ComputeContext, u32, u32, u32, u32, &mut A) + Send + Sync>;
type Body2IR<A> = Box<dyn Fn(&dyn ComputeContext, u32, u32, &GridRange, &mut A) + Send + Sync>;
type Body2RI<A> = Box<dyn Fn(&dyn ComputeContext, &GridRange, u32, u32, &mut A) + Send + Sync>;
type Body3IIR<A> = Box<dyn Fn(&dyn ComputeContext, u32, u32, u32, u32, &GridRange, &mut A) + Send + Sync>;
type Body3RII<A> = Box<dyn Fn(&dyn ComputeContext, &GridRange, u32, u32, u32, u32, &mut A) + Send + Sync>;

/// A host compute function tagged with its invocation shape.
pub enum HostBody<A> {
    Grid0(Body0<A>),
    Grid1(Body1<A>),
    Grid1Range(BodyR<A>),
    Grid2(Body2<A>),
    Grid2IndexRange(Body2IR<A>),
    Grid2RangeIndex(Body2RI<A>),
    Grid3IndexIndexRange(Body3IIR<A>),
    Grid3RangeIndexIndex(Body3RII<A>),
}

impl<A> HostBody<A> {
    pub fn shape(&self) -> InvocationShape {
        match self {
            HostBody::Grid0(_) => InvocationShape::Grid0,
            HostBody::Grid1(_) => InvocationShape::Grid1,
            HostBody::Grid1Range(_) => InvocationShape::Grid1Range,
            HostBody::Grid2(_) => InvocationShape::Grid2,
            HostBody::Grid2IndexRange(_) => InvocationShape::Grid2IndexRange,
            HostBody::Grid2RangeIndex(_) => InvocationShape::Grid2RangeIndex,
            HostBody::Grid3IndexIndexRange(_) => InvocationShape::Grid3IndexIndexRange,
            HostBody::Grid3RangeIndexIndex(_) => InvocationShape::Grid3RangeIndexIndex,
        }
    }

    /// Run the body over `grid`.
    pub fn invoke(&self, kernel: &str, ctx: &dyn ComputeContext, grid: &[GridRange], args: &mut A) -> Result<()> {
        let wrong_arity = || Error::GridDimensions {
            kernel: kernel.to_string(),
            expected: self.shape().arity(),
            supplied: grid.len(),
        };
        match self {
            HostBody::Grid0(f) => {
                let [] = grid else { return Err(wrong_arity()) };
                f(ctx, args);
            }
            HostBody::Grid1(f) => {
                let [r0] = grid else { return Err(wrong_arity()) };
                for i0 in r0 {
                    f(ctx, i0, r0.extent(), args);
                }
            }
            HostBody::Grid1Range(f) => {
                let [r0] = grid else { return Err(wrong_arity()) };
                f(ctx, r0, args);
            }
            HostBody::Grid2(f) => {
                let [r0, r1] = grid else { return Err(wrong_arity()) };
                for i0 in r0 {
                    for i1 in r1 {
                        f(ctx, i0, r0.extent(), i1, r1.extent(), args);
                    }
                }
            }
            HostBody::Grid2IndexRange(f) => {
                let [r0, r1] = grid else { return Err(wrong_arity()) };
                for i0 in r0 {
                    f(ctx, i0, r0.extent(), r1, args);
                }
            }
            HostBody::Grid2RangeIndex(f) => {
                let [r0, r1] = grid else { return Err(wrong_arity()) };
                for i1 in r1 {
                    f(ctx, r0, i1, r1.extent(), args);
                }
            }
            HostBody::Grid3IndexIndexRange(f) => {
                let [r0, r1, r2] = grid else { return Err(wrong_arity()) };
                for i0 in r0 {
                    for i1 in r1 {
                        f(ctx, i0, r0.extent(), i1, r1.extent(), r2, args);
                    }
                }
            }
            HostBody::Grid3RangeIndexIndex(f) => {
                let [r0, r1, r2] = grid else { return Err(wrong_arity()) };
                for i1 in r1 {
                    for i2 in r2 {
                        f(ctx, r0, i1, r1.extent(), i2, r2.extent(), args);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Callable holding converted native arguments for one host body.
pub struct HostCallable<A> {
    kernel: String,
    args: Mutex<A>,
    body: Arc<HostBody<A>>,
}

impl<A: KernelArgs> BoundCallable for HostCallable<A> {
    fn call(&self, ctx: &dyn ComputeContext, grid: &[GridRange]) -> Result<()> {
        let mut args = self.args.lock();
        self.body.invoke(&self.kernel, ctx, grid, &mut args)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// [`CallableFactory`] for host compute functions.
pub struct HostFactory<A> {
    body: Arc<HostBody<A>>,
}

impl<A> HostFactory<A> {
    pub fn new(body: HostBody<A>) -> Self {
        Self { body: Arc::new(body) }
    }

    pub fn shape(&self) -> InvocationShape {
        self.body.shape()
    }
}

impl<A: KernelArgs> CallableFactory for HostFactory<A> {
    fn grid_arity(&self) -> usize {
        self.body.shape().arity()
    }

    fn create(&self, ctx: &dyn ComputeContext, kernel: &Kernel, args: &[Argument]) -> Result<Binding> {
        let marshaled = A::marshal_all(kernel.name(), kernel.parameters(), args, ctx)?;
        Ok(Binding {
            callable: Box::new(HostCallable {
                kernel: kernel.name().to_string(),
                args: Mutex::new(marshaled.values),
                body: self.body.clone(),
            }),
            pins: marshaled.pins,
            extents: marshaled.extents,
        })
    }
}
