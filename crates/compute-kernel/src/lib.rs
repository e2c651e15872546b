//! Backend-agnostic kernel binding and dispatch
//!
//! This crate provides:
//! - **Kernel descriptions**: named, typed parameters with grid dimensions
//! - **Argument marshaling**: capability-typed arguments converted into native
//!   parameter types, with pins that keep borrowed memory alive
//! - **Bound kernels**: converted arguments ready to launch over a grid
//! - **Queues and events**: the launch interface every backend implements
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ registry: (backend, name) -> kernel factory  │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │ Kernel::bind(ctx, &[Argument]) -> BoundKernel│
//! │   KernelArg / KernelArgs marshaling          │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │ ComputeQueue::launch(bound, grid) -> Event   │
//! └──────┬───────────────┬───────────────┬───────┘
//!        ▼               ▼               ▼
//!     host            stream           metal
//! ```
//!
//! Backends live in the `compute-backends` crate.
//!
//! # Usage
//!
//! ```rust
//! use compute_kernel::{ConstSpan, Kernel, MutSpan};
//!
//! # fn main() -> compute_kernel::Result<()> {
//! let mut kernel = Kernel::new("addOne");
//! kernel
//!     .add_parameter("output", "rw", "u32[n]")?
//!     .add_parameter("input", "r", "u32[n]")?
//!     .add_parameter("n", "r", "u32")?
//!     .add_dimension("i", "n")?;
//! kernel.set_compute_function_1d(
//!     |_ctx, i, n, (output, input, _): &mut (MutSpan<u32>, ConstSpan<u32>, u32)| {
//!         if i < n {
//!             output.as_mut_slice()[i as usize] = input.as_slice()[i as usize] + 1;
//!         }
//!     },
//! )?;
//! assert_eq!(kernel.grid_arity(), Some(1));
//! # Ok(())
//! # }
//! ```

pub mod bound;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod expr;
pub mod grid;
pub mod invoke;
pub mod kernel;
pub mod marshal;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bound::{BoundCallable, BoundKernel};
pub use config::ContextConfig;
pub use context::{cached_kernel, ensure_same_context, BackendKind, ComputeContext, ContextCache, ContextId};
pub use error::{ArityProblem, BackendStatus, Error, ErrorKind, Result};
pub use event::{Event, EventSignal, ProfilingClock, ProfilingInfo};
pub use expr::{Bindings, Expr};
pub use grid::{grid_points, is_trivially_empty, GridRange};
pub use invoke::{HostBody, HostCallable, HostFactory, InvocationShape};
pub use kernel::{Binding, CallableFactory, GridDimension, GridExpression, Kernel, Parameter, MAX_GRID_DIMENSIONS};
pub use marshal::{
    marshal_scalar, ArrayHandle, ConstArrayHandle, ConstHostPtr, ConstSpan, FrozenRegion, HostPtr, KernelArg,
    KernelArgs, Marshaled, MutSpan, MutableRegion,
};
pub use memory::{
    Argument, ArgumentHandler, Capability, ConstRange, MemoryRegionHandle, MutableRange, Pin, PrimitiveBytes,
    RegionId, RegionStorage,
};
pub use queue::{validate_launch, validate_region, ComputeQueue};
pub use registry::{create_kernel, register_kernel, KernelFactory, KernelRegistry};
pub use types::{
    copy_using_description, lookup_type, register_type, register_type_of, AccessMode, ArrayLength, Describe,
    FieldDescription, KernelType, Primitive, Shape, Value, ValueDescription, ValueKind,
};
