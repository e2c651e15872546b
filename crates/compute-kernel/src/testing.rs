//! Unit-test doubles: a context without a queue and a raw-range argument.

use std::any::Any;
use std::sync::Arc;

use crate::config::ContextConfig;
use crate::context::{cached_kernel, BackendKind, ComputeContext, ContextCache, ContextId};
use crate::error::{BackendStatus, Error, Result};
use crate::event::ProfilingClock;
use crate::kernel::Kernel;
use crate::memory::test_support::VecStorage;
use crate::memory::{ArgumentHandler, MemoryRegionHandle, MutableRange};
use crate::queue::ComputeQueue;
use crate::types::ValueDescription;

pub struct NullContext {
    id: ContextId,
    config: ContextConfig,
    clock: ProfilingClock,
    cache: ContextCache,
}

impl NullContext {
    pub fn new() -> Self {
        Self {
            id: ContextId::next(),
            config: ContextConfig::default(),
            clock: ProfilingClock::new(),
            cache: ContextCache::new(),
        }
    }
}

impl ComputeContext for NullContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Host
    }

    fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn clock(&self) -> &ProfilingClock {
        &self.clock
    }

    fn queue(&self, label: &str) -> Result<Arc<dyn ComputeQueue>> {
        Err(Error::backend(
            format!("create queue {label}"),
            BackendStatus::Unsupported,
            "null context has no queues",
        ))
    }

    fn allocate(&self, name: &str, element: Arc<ValueDescription>, count: usize) -> Result<MemoryRegionHandle> {
        let storage = VecStorage::new(element.size * count);
        Ok(MemoryRegionHandle::new(self.id, name, element, storage))
    }

    fn free(&self, _region: &MemoryRegionHandle) -> Result<()> {
        Ok(())
    }

    fn cache(&self) -> &ContextCache {
        &self.cache
    }

    fn kernel(&self, name: &str) -> Result<Arc<Kernel>> {
        cached_kernel(self, name)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Mutable range over a region's bytes with no element description.
pub struct RawRange(MemoryRegionHandle);

impl RawRange {
    pub fn of(handle: &MemoryRegionHandle) -> Self {
        Self(handle.clone())
    }
}

impl ArgumentHandler for RawRange {
    fn type_name(&self) -> String {
        "raw bytes".to_string()
    }

    fn can_get_range(&self) -> bool {
        true
    }

    fn get_range(&self, op: &str) -> Result<MutableRange> {
        let (ptr, len, pin) = self.0.range(op)?.into_parts();
        // SAFETY: same pointer, length and pin as the region's own range
        Ok(unsafe { MutableRange::new(ptr, len, None, pin) })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
