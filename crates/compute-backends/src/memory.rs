//! Region bookkeeping shared by every backend
//!
//! Host regions are zero-initialized, 64-byte aligned heap blocks. The table
//! tracks live regions by id; freeing drops its reference and any pins
//! still held by bound kernels keep the storage alive until they are released.

use std::alloc::{self, Layout};
use std::any::Any;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use compute_kernel::{
    ensure_same_context, BackendKind, BackendStatus, ContextCache, ContextConfig, ContextId, Error,
    MemoryRegionHandle, ProfilingClock, RegionId, RegionStorage, Result, ValueDescription,
};
use compute_tracing::performance::record_allocation;
use compute_tracing::timed_block;
use parking_lot::RwLock;

/// Alignment of every host region, one cache line
pub const HOST_ALIGNMENT: usize = 64;

/// Owned, aligned, zeroed heap block
pub struct HostStorage {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the block is uniquely owned and only reached through raw pointers
// whose synchronization is the launch protocol's responsibility
unsafe impl Send for HostStorage {}
unsafe impl Sync for HostStorage {}

impl HostStorage {
    pub fn zeroed(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), HOST_ALIGNMENT)
            .map_err(|e| Error::backend("allocate host region", BackendStatus::InvalidValue, e.to_string()))?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::backend(
                "allocate host region",
                BackendStatus::OutOfHostMemory,
                format!("could not allocate {len} bytes"),
            )
        })?;
        Ok(Self { ptr, len, layout })
    }
}

impl RegionStorage for HostStorage {
    fn len(&self) -> usize {
        self.len
    }

    fn host_ptr(&self) -> Option<NonNull<u8>> {
        Some(self.ptr)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostStorage {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Live regions of one context
pub struct RegionTable {
    backend: BackendKind,
    context: ContextId,
    regions: HashMap<RegionId, MemoryRegionHandle>,
    allocated_bytes: usize,
}

impl RegionTable {
    pub fn new(backend: BackendKind, context: ContextId) -> Self {
        Self {
            backend,
            context,
            regions: HashMap::new(),
            allocated_bytes: 0,
        }
    }

    /// Allocate `count` zeroed host elements.
    pub fn allocate(&mut self, name: &str, element: Arc<ValueDescription>, count: usize) -> Result<MemoryRegionHandle> {
        self.allocate_with(name, element, count, HOST_ALIGNMENT, |len| {
            Ok(Arc::new(HostStorage::zeroed(len)?))
        })
    }

    /// Allocate through a backend-specific storage constructor.
    pub fn allocate_with<F>(
        &mut self,
        name: &str,
        element: Arc<ValueDescription>,
        count: usize,
        alignment: usize,
        make: F,
    ) -> Result<MemoryRegionHandle>
    where
        F: FnOnce(usize) -> Result<Arc<dyn RegionStorage>>,
    {
        let len = element.size.checked_mul(count).ok_or_else(|| {
            Error::backend(
                format!("allocate {name}"),
                BackendStatus::InvalidValue,
                format!("{count} elements of {element} overflow the address space"),
            )
        })?;

        let (storage, duration_us) = timed_block!("allocate", { make(len) });
        let handle = MemoryRegionHandle::new(self.context, name, element, storage?);
        record_allocation(len, self.backend.as_str(), alignment, duration_us);

        self.allocated_bytes += len;
        self.regions.insert(handle.id(), handle.clone());
        Ok(handle)
    }

    pub fn free(&mut self, region: &MemoryRegionHandle) -> Result<()> {
        ensure_same_context("free region", region, self.context, region.context())?;
        let removed = self
            .regions
            .remove(&region.id())
            .ok_or_else(|| Error::invalid_region(format!("{region} is not allocated or was already freed")))?;
        self.allocated_bytes -= removed.len_bytes();
        Ok(())
    }

    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.contains_key(&id)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }
}

/// State every context carries.
pub(crate) struct ContextState {
    pub id: ContextId,
    pub config: ContextConfig,
    pub memory: RwLock<RegionTable>,
    pub cache: ContextCache,
    pub clock: ProfilingClock,
}

impl ContextState {
    pub fn new(backend: BackendKind, config: ContextConfig) -> Self {
        let id = ContextId::next();
        tracing::debug!(%backend, context = %id, profiling = config.profiling, "created context");
        Self {
            id,
            config,
            memory: RwLock::new(RegionTable::new(backend, id)),
            cache: ContextCache::new(),
            clock: ProfilingClock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_kernel::Describe;

    #[test]
    fn test_allocation_is_zeroed_and_aligned() {
        let mut memory = RegionTable::new(BackendKind::Host, ContextId::next());
        let region = memory.allocate("data", u32::describe(), 16).unwrap();
        assert_eq!(region.len_bytes(), 64);
        assert_eq!(region.to_vec::<u32>().unwrap(), vec![0; 16]);
        let ptr = region.storage().host_ptr().unwrap();
        assert_eq!(ptr.as_ptr() as usize % HOST_ALIGNMENT, 0);
        assert_eq!(memory.allocated_bytes(), 64);
    }

    #[test]
    fn test_free_twice_fails() {
        let mut memory = RegionTable::new(BackendKind::Host, ContextId::next());
        let region = memory.allocate("data", u8::describe(), 3).unwrap();
        memory.free(&region).unwrap();
        assert_eq!(memory.region_count(), 0);
        assert!(memory.free(&region).is_err());
    }

    #[test]
    fn test_freed_region_survives_while_pinned() {
        let mut memory = RegionTable::new(BackendKind::Host, ContextId::next());
        let region = memory.allocate("data", u32::describe(), 2).unwrap();
        region.write(0, &[5u32, 6]).unwrap();
        let range = region.const_range("read").unwrap();
        memory.free(&region).unwrap();
        drop(region);
        let (ptr, len, _pin) = range.into_parts();
        // SAFETY: `_pin` keeps the storage alive
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        assert_eq!(bytemuck::cast_slice::<u8, u32>(bytes), &[5, 6]);
    }

    #[test]
    fn test_overflowing_allocation() {
        let mut memory = RegionTable::new(BackendKind::Host, ContextId::next());
        assert!(memory.allocate("huge", u64::describe(), usize::MAX).is_err());
    }

    #[test]
    fn test_foreign_region_free() {
        let mut a = RegionTable::new(BackendKind::Host, ContextId::next());
        let mut b = RegionTable::new(BackendKind::Host, ContextId::next());
        let region = a.allocate("data", u8::describe(), 1).unwrap();
        assert!(b.free(&region).is_err());
    }
}
