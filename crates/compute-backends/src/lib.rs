//! Execution backends for compute-kernel
//!
//! | Backend  | Queue         | Memory                  |
//! |----------|---------------|-------------------------|
//! | host     | synchronous   | aligned heap blocks     |
//! | stream   | worker thread | aligned heap blocks     |
//! | metal    | worker thread | shared `MTLBuffer`s     |
//!
//! All three implement [`compute_kernel::ComputeContext`], so kernels bind
//! and launch the same way everywhere.
//!
//! # Usage
//!
//! ```rust
//! use compute_backends::{register_stream_kernel, StreamContext};
//! use compute_kernel::{Argument, ComputeContext, Kernel, MutSpan};
//!
//! # fn main() -> compute_kernel::Result<()> {
//! register_stream_kernel("lib_doc_square", |_ctx| {
//!     let mut kernel = Kernel::new("lib_doc_square");
//!     kernel.add_parameter("data", "rw", "u32[n]")?.add_parameter("n", "r", "u32")?;
//!     kernel.add_dimension("i", "n")?;
//!     kernel.set_compute_function_1d(|_ctx, i, _n, (data, _): &mut (MutSpan<u32>, u32)| {
//!         let v = &mut data.as_mut_slice()[i as usize];
//!         *v *= *v;
//!     })?;
//!     Ok(kernel)
//! })?;
//!
//! let ctx = StreamContext::new();
//! let data = ctx.allocate_array::<u32>("data", 3)?;
//! data.write(0, &[1u32, 2, 3])?;
//!
//! let kernel = ctx.kernel("lib_doc_square")?;
//! let bound = kernel.bind(&ctx, &[Argument::region(&data), Argument::value(3u32)])?;
//! let queue = ctx.queue("main")?;
//! queue.launch_default("square", &bound, &[])?.wait()?;
//! assert_eq!(data.to_vec::<u32>()?, vec![1, 4, 9]);
//! # Ok(())
//! # }
//! ```

pub mod host;
pub mod memory;
pub mod metal;
pub mod stream;

pub use host::{register_host_kernel, HostContext, HostQueue};
pub use memory::{HostStorage, RegionTable, HOST_ALIGNMENT};
pub use metal::{register_metal_kernel, MetalContext};
#[cfg(target_vendor = "apple")]
pub use metal::{MetalFunction, MetalStorage};
pub use stream::{register_stream_kernel, StreamContext, StreamQueue};
