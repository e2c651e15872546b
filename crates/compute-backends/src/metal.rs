//! Metal backend for Apple GPUs
//!
//! Regions are shared-storage `MTLBuffer`s, so fills, copies and host reads
//! go through the same host pointer the other backends use. Compute
//! functions are Metal Shading Language sources compiled once per context
//! and cached with their pipelines in the [`ContextCache`].
//!
//! # Argument layout
//!
//! Parameter `i` is bound at buffer index `i`: arrays as buffers, scalars as
//! bytes converted to the declared layout. The grid origin follows at index
//! `params.len()` as a `uint3`.
//!
//! ```rust,ignore
//! use compute_backends::{MetalContext, MetalFunction};
//! use compute_kernel::{ComputeContext, Kernel};
//! use std::sync::Arc;
//!
//! let mut kernel = Kernel::new("double");
//! kernel.add_parameter("data", "rw", "f32[]")?.add_parameter("n", "r", "u32")?;
//! kernel.set_callable_factory(Arc::new(MetalFunction::new("ops", SOURCE, "double_f32", 1)?));
//! ```

use compute_kernel::{register_kernel, BackendKind, ComputeContext, Kernel, Result};

#[cfg(target_vendor = "apple")]
pub use apple::{MetalContext, MetalFunction, MetalStorage};

/// Register a Metal kernel factory under `name`.
pub fn register_metal_kernel<F>(name: &str, factory: F) -> Result<()>
where
    F: Fn(&dyn ComputeContext) -> Result<Kernel> + Send + Sync + 'static,
{
    register_kernel(BackendKind::Metal, name, factory)
}

#[cfg(target_vendor = "apple")]
mod apple {
    use std::any::Any;
    use std::ptr::NonNull;
    use std::sync::Arc;

    use compute_kernel::{
        cached_kernel, copy_using_description, ensure_same_context, Argument, BackendKind, BackendStatus, Binding,
        BoundCallable, CallableFactory, ComputeContext, ComputeQueue, ContextCache, ContextConfig, ContextId, Error,
        GridRange, Kernel, MemoryRegionHandle, Parameter, Pin, ProfilingClock, RegionStorage, Result,
        ValueDescription, MAX_GRID_DIMENSIONS,
    };
    use metal::{
        Buffer, CommandQueue, CompileOptions, ComputePipelineState, Device, Library, MTLCommandBufferStatus,
        MTLResourceOptions, MTLSize,
    };
    use tracing::{debug, trace};

    use crate::memory::ContextState;
    use crate::stream::StreamQueue;

    const BUFFER_ALIGNMENT: usize = 256;

    /// Shared-storage buffer backing a Metal region
    pub struct MetalStorage {
        buffer: Buffer,
        len: usize,
    }

    impl MetalStorage {
        fn zeroed(device: &Device, len: usize) -> Result<Self> {
            let buffer = device.new_buffer(len.max(1) as u64, MTLResourceOptions::StorageModeShared);
            let contents = buffer.contents() as *mut u8;
            if contents.is_null() {
                return Err(Error::backend(
                    "allocate metal region",
                    BackendStatus::OutOfResources,
                    format!("could not allocate a {len} byte buffer"),
                ));
            }
            // SAFETY: shared buffers expose at least `len.max(1)` host-visible bytes
            unsafe { std::ptr::write_bytes(contents, 0, len) };
            Ok(Self { buffer, len })
        }

        pub fn buffer(&self) -> &Buffer {
            &self.buffer
        }
    }

    impl RegionStorage for MetalStorage {
        fn len(&self) -> usize {
            self.len
        }

        fn host_ptr(&self) -> Option<NonNull<u8>> {
            NonNull::new(self.buffer.contents() as *mut u8)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct MetalDevice {
        device: Device,
        command_queue: CommandQueue,
    }

    /// Context bound to the system default Metal device
    #[derive(Clone)]
    pub struct MetalContext {
        state: Arc<ContextState>,
        gpu: Arc<MetalDevice>,
    }

    impl MetalContext {
        pub fn new() -> Result<Self> {
            Self::with_config(ContextConfig::default())
        }

        pub fn with_config(config: ContextConfig) -> Result<Self> {
            let device = Device::system_default().ok_or_else(|| {
                Error::backend("create metal context", BackendStatus::DeviceNotAvailable, "no Metal device found")
            })?;
            let command_queue = device.new_command_queue();
            debug!(device = device.name(), "opened metal device");
            Ok(Self {
                state: Arc::new(ContextState::new(BackendKind::Metal, config)),
                gpu: Arc::new(MetalDevice { device, command_queue }),
            })
        }

        pub fn is_available() -> bool {
            Device::system_default().is_some()
        }

        pub fn device(&self) -> &Device {
            &self.gpu.device
        }

        fn library(&self, name: &str, source: &str) -> Result<Arc<Library>> {
            self.cache().get_or_try_create(&format!("metal:library:{name}"), || {
                debug!(library = name, "compiling metal library");
                self.gpu
                    .device
                    .new_library_with_source(source, &CompileOptions::new())
                    .map_err(|e| {
                        Error::backend(format!("compile library {name}"), BackendStatus::CompileFailed, e)
                    })
            })
        }

        fn pipeline(&self, library: &str, source: &str, function: &str) -> Result<Arc<ComputePipelineState>> {
            self.cache()
                .get_or_try_create(&format!("metal:pipeline:{library}:{function}"), || {
                    let lib = self.library(library, source)?;
                    let func = lib.get_function(function, None).map_err(|e| {
                        Error::backend(
                            format!("load function {function}"),
                            BackendStatus::CompileFailed,
                            format!("not found in library {library}: {e}"),
                        )
                    })?;
                    self.gpu
                        .device
                        .new_compute_pipeline_state_with_function(&func)
                        .map_err(|e| {
                            Error::backend(format!("create pipeline {function}"), BackendStatus::CompileFailed, e)
                        })
                })
        }
    }

    impl ComputeContext for MetalContext {
        fn id(&self) -> ContextId {
            self.state.id
        }

        fn backend(&self) -> BackendKind {
            BackendKind::Metal
        }

        fn config(&self) -> &ContextConfig {
            &self.state.config
        }

        fn clock(&self) -> &ProfilingClock {
            &self.state.clock
        }

        fn queue(&self, label: &str) -> Result<Arc<dyn ComputeQueue>> {
            Ok(Arc::new(StreamQueue::new(self.clone(), label)?))
        }

        fn allocate(&self, name: &str, element: Arc<ValueDescription>, count: usize) -> Result<MemoryRegionHandle> {
            let device = &self.gpu.device;
            self.state
                .memory
                .write()
                .allocate_with(name, element, count, BUFFER_ALIGNMENT, |len| {
                    Ok(Arc::new(MetalStorage::zeroed(device, len)?))
                })
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

    /// Compute function compiled from Metal Shading Language source
    pub struct MetalFunction {
        library: String,
        source: Arc<str>,
        function: String,
        grid_arity: usize,
    }

    impl MetalFunction {
        pub fn new(library: &str, source: &str, function: &str, grid_arity: usize) -> Result<Self> {
            if !(1..=MAX_GRID_DIMENSIONS).contains(&grid_arity) {
                return Err(Error::declaration(
                    function,
                    format!("metal functions iterate over 1 to {MAX_GRID_DIMENSIONS} dimensions, not {grid_arity}"),
                ));
            }
            Ok(Self {
                library: library.to_string(),
                source: Arc::from(source),
                function: function.to_string(),
                grid_arity,
            })
        }
    }

    enum Slot {
        Buffer(Buffer),
        Bytes(Vec<u8>),
    }

    fn bind_param(
        ctx: &MetalContext,
        kernel: &Kernel,
        param: &Parameter,
        arg: &Argument,
    ) -> Result<(Slot, Option<Pin>, Option<i64>)> {
        let op = format!("kernel {} bind param {} {}", kernel.name(), param.ordinal, param.name);
        if param.ty.is_array() {
            if param.ty.access.is_writable() {
                // rejects read-only arguments before the buffer is taken
                arg.get_range(&op)?;
            }
            let handle = arg.get_handle(&op)?;
            ensure_same_context(&op, &handle, ctx.id(), handle.context())?;
            if handle.element().size != param.ty.base.size {
                return Err(Error::conversion(
                    &handle.element().type_name,
                    &param.ty.base.type_name,
                    "element sizes differ",
                ));
            }
            let storage = handle
                .storage()
                .as_any()
                .downcast_ref::<MetalStorage>()
                .ok_or_else(|| Error::conversion(handle.to_string(), "MTLBuffer", "region is not a metal buffer"))?;
            let extent = i64::try_from(handle.element_count()).ok();
            Ok((Slot::Buffer(storage.buffer.clone()), Some(handle.pin()), extent))
        } else {
            let value = arg.get_primitive(&op)?;
            let mut bytes = vec![0u8; param.ty.base.size];
            copy_using_description(&value.desc, &value.bytes, &param.ty.base, &mut bytes)?;
            let extent = param.ty.base.decode(&bytes)?.as_i64();
            Ok((Slot::Bytes(bytes), None, extent))
        }
    }

    impl CallableFactory for MetalFunction {
        fn grid_arity(&self) -> usize {
            self.grid_arity
        }

        fn create(&self, ctx: &dyn ComputeContext, kernel: &Kernel, args: &[Argument]) -> Result<Binding> {
            let metal = ctx.as_any().downcast_ref::<MetalContext>().ok_or_else(|| {
                Error::backend(
                    format!("bind {}", kernel.name()),
                    BackendStatus::Unsupported,
                    format!("metal functions need a metal context, not {}", ctx.backend()),
                )
            })?;
            let pipeline = metal.pipeline(&self.library, &self.source, &self.function)?;

            let mut slots = Vec::with_capacity(args.len());
            let mut pins = Vec::new();
            let mut extents = Vec::with_capacity(args.len());
            for (param, arg) in kernel.parameters().iter().zip(args) {
                let (slot, pin, extent) = bind_param(metal, kernel, param, arg).map_err(|source| Error::Bind {
                    kernel: kernel.name().to_string(),
                    index: param.ordinal,
                    name: param.name.clone(),
                    passed: arg.type_name(),
                    required: if param.ty.is_array() { "MTLBuffer" } else { "constant bytes" }.to_string(),
                    declared: param.ty.to_string(),
                    source: Box::new(source),
                })?;
                slots.push(slot);
                pins.extend(pin);
                extents.push(extent);
            }

            let block = match kernel.grid_expression().and_then(|g| g.block.as_ref()) {
                Some(expr) => Some(threadgroup_from(kernel, &expr.eval_list(&kernel.resolve_bindings(&extents))?)?),
                None => None,
            };

            Ok(Binding {
                callable: Box::new(MetalCallable {
                    function: self.function.clone(),
                    command_queue: metal.gpu.command_queue.clone(),
                    pipeline,
                    slots,
                    block,
                }),
                pins,
                extents,
            })
        }
    }

    fn threadgroup_from(kernel: &Kernel, sizes: &[i64]) -> Result<[u64; 3]> {
        let mut block = [1u64; 3];
        if sizes.len() > MAX_GRID_DIMENSIONS {
            return Err(Error::declaration(kernel.name(), "block size has more than 3 dimensions"));
        }
        for (slot, &size) in block.iter_mut().zip(sizes) {
            *slot = u64::try_from(size)
                .ok()
                .filter(|&s| s > 0)
                .ok_or_else(|| Error::declaration(kernel.name(), format!("block size {size} must be positive")))?;
        }
        Ok(block)
    }

    struct MetalCallable {
        function: String,
        command_queue: CommandQueue,
        pipeline: Arc<ComputePipelineState>,
        slots: Vec<Slot>,
        block: Option<[u64; 3]>,
    }

    impl MetalCallable {
        fn threadgroup(&self) -> [u64; 3] {
            self.block
                .unwrap_or_else(|| [self.pipeline.thread_execution_width().max(1), 1, 1])
        }
    }

    impl BoundCallable for MetalCallable {
        fn call(&self, _ctx: &dyn ComputeContext, grid: &[GridRange]) -> Result<()> {
            let mut origin = [0u32; 3];
            let mut threads = [1u64; 3];
            for (d, range) in grid.iter().enumerate() {
                origin[d] = range.start();
                threads[d] = u64::from(range.padded_extent());
            }
            let block = self.threadgroup();
            if block.iter().product::<u64>() > self.pipeline.max_total_threads_per_threadgroup() {
                return Err(Error::backend(
                    format!("launch {}", self.function),
                    BackendStatus::InvalidWorkGroupSize,
                    format!("threadgroup {block:?} exceeds the pipeline limit"),
                ));
            }
            let groups: Vec<u64> = threads.iter().zip(&block).map(|(t, b)| t.div_ceil(*b)).collect();
            trace!(function = %self.function, ?threads, ?block, "dispatching metal function");

            let command_buffer = self.command_queue.new_command_buffer();
            let encoder = command_buffer.new_compute_command_encoder();
            encoder.set_compute_pipeline_state(&self.pipeline);
            for (index, slot) in self.slots.iter().enumerate() {
                match slot {
                    Slot::Buffer(buffer) => encoder.set_buffer(index as u64, Some(buffer), 0),
                    Slot::Bytes(bytes) => {
                        encoder.set_bytes(index as u64, bytes.len() as u64, bytes.as_ptr() as *const _)
                    }
                }
            }
            encoder.set_bytes(
                self.slots.len() as u64,
                std::mem::size_of_val(&origin) as u64,
                origin.as_ptr() as *const _,
            );
            encoder.dispatch_thread_groups(
                MTLSize::new(groups[0], groups[1], groups[2]),
                MTLSize::new(block[0], block[1], block[2]),
            );
            encoder.end_encoding();
            command_buffer.commit();
            command_buffer.wait_until_completed();

            if command_buffer.status() == MTLCommandBufferStatus::Error {
                return Err(Error::backend(
                    format!("launch {}", self.function),
                    BackendStatus::ExecutionFailed,
                    "command buffer reported an error",
                ));
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

}

#[cfg(not(target_vendor = "apple"))]
pub use stub::MetalContext;

#[cfg(not(target_vendor = "apple"))]
mod stub {
    use compute_kernel::{BackendStatus, ContextConfig, Error, Result};

    /// Placeholder on platforms without Metal
    pub struct MetalContext;

    impl MetalContext {
        pub fn new() -> Result<Self> {
            Self::with_config(ContextConfig::default())
        }

        pub fn with_config(_config: ContextConfig) -> Result<Self> {
            Err(Error::backend(
                "create metal context",
                BackendStatus::DeviceNotAvailable,
                "Metal is only available on Apple platforms",
            ))
        }

        pub fn is_available() -> bool {
            false
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use compute_kernel::ErrorKind;

        #[test]
        fn test_unavailable_off_apple() {
            assert!(!MetalContext::is_available());
            let err = MetalContext::new().err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Backend);
            assert!(err.to_string().contains("Apple"));
        }
    }
}
