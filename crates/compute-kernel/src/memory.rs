//! Memory regions, pins and the capability-typed argument abstraction.
//!
//! An [`Argument`] is what callers hand to [`crate::Kernel::bind`]. It may be
//! able to provide some subset of:
//!
//! - primitive bytes (scalars and described structs, copied by value)
//! - a [`MemoryRegionHandle`] (the owning handle itself)
//! - a [`MutableRange`] (host pointer + length, writable)
//! - a [`ConstRange`] (host pointer + length, read-only)
//!
//! Ranges carry a [`Pin`]: while any clone of the pin is alive the memory
//! the range points at stays valid.

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::ContextId;
use crate::error::{Error, Result};
use crate::types::{Describe, ValueDescription};

/// Capabilities an [`Argument`] may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Primitive,
    Handle,
    MutableRange,
    ConstRange,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Primitive => f.write_str("primitive value"),
            Capability::Handle => f.write_str("memory handle"),
            Capability::MutableRange => f.write_str("mutable range"),
            Capability::ConstRange => f.write_str("const range"),
        }
    }
}

/// Opaque lifetime token. The borrowed resource is released when the last
/// clone is dropped.
#[derive(Clone)]
pub struct Pin(Arc<dyn Any + Send + Sync>);

impl Pin {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(value)
    }

    /// Number of live references to the pinned resource, this one included.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin").field("holders", &self.holders()).finish()
    }
}

/// Region identifier, unique per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Backend storage behind a region.
pub trait RegionStorage: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host-visible base address, `None` for device-private memory.
    fn host_ptr(&self) -> Option<NonNull<u8>>;

    fn as_any(&self) -> &dyn Any;
}

struct RegionInner {
    id: RegionId,
    context: ContextId,
    name: String,
    element: Arc<ValueDescription>,
    storage: Arc<dyn RegionStorage>,
}

/// Reference-counted handle to a region owned by a context's memory manager.
#[derive(Clone)]
pub struct MemoryRegionHandle {
    inner: Arc<RegionInner>,
}

impl MemoryRegionHandle {
    pub fn new(
        context: ContextId,
        name: impl Into<String>,
        element: Arc<ValueDescription>,
        storage: Arc<dyn RegionStorage>,
    ) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                id: RegionId::next(),
                context,
                name: name.into(),
                element,
                storage,
            }),
        }
    }

    pub fn id(&self) -> RegionId {
        self.inner.id
    }

    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn element(&self) -> &Arc<ValueDescription> {
        &self.inner.element
    }

    pub fn len_bytes(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn element_count(&self) -> usize {
        match self.inner.element.size {
            0 => 0,
            size => self.len_bytes() / size,
        }
    }

    pub fn storage(&self) -> &Arc<dyn RegionStorage> {
        &self.inner.storage
    }

    /// A pin keeping this region's storage alive.
    pub fn pin(&self) -> Pin {
        Pin::from_arc(self.inner.clone())
    }

    fn host_ptr(&self, op: &str) -> Result<NonNull<u8>> {
        self.inner
            .storage
            .host_ptr()
            .ok_or_else(|| Error::invalid_region(format!("{op}: {} is not host visible", self)))
    }

    /// Writable range over the whole region.
    pub fn range(&self, op: &str) -> Result<MutableRange> {
        let ptr = self.host_ptr(op)?;
        // SAFETY: the pin keeps the storage, and with it `ptr`, alive
        Ok(unsafe { MutableRange::new(ptr, self.len_bytes(), Some(self.element().clone()), self.pin()) })
    }

    /// Read-only range over the whole region.
    pub fn const_range(&self, op: &str) -> Result<ConstRange> {
        let ptr = self.host_ptr(op)?;
        // SAFETY: as for `range`
        Ok(unsafe { ConstRange::new(ptr, self.len_bytes(), Some(self.element().clone()), self.pin()) })
    }

    /// Copy the region's contents out as `T` elements.
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Result<Vec<T>> {
        let ptr = self.host_ptr("read region")?;
        let count = self.len_bytes() / std::mem::size_of::<T>().max(1);
        let mut out = vec![T::zeroed(); count];
        let bytes = bytemuck::cast_slice_mut::<T, u8>(&mut out);
        // SAFETY: storage is at least `len_bytes` long and alive for `self`
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), bytes.as_mut_ptr(), bytes.len()) };
        Ok(out)
    }

    /// Overwrite the region starting at element `offset` with `data`.
    pub fn write<T: bytemuck::Pod>(&self, offset: usize, data: &[T]) -> Result<()> {
        let bytes = bytemuck::cast_slice::<T, u8>(data);
        let start = offset.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            Error::invalid_region(format!("write region: element offset {offset} overflows the address space of {self}"))
        })?;
        self.check_bounds("write region", start, bytes.len())?;
        let ptr = self.host_ptr("write region")?;
        // SAFETY: bounds checked above
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(start), bytes.len()) };
        Ok(())
    }

    /// Repeat `pattern` over `length` bytes starting at byte `offset`.
    pub fn fill_bytes(&self, pattern: &[u8], offset: usize, length: usize) -> Result<()> {
        if pattern.is_empty() || length % pattern.len() != 0 {
            return Err(Error::invalid_region(format!(
                "fill of {length} bytes is not a whole number of {}-byte patterns",
                pattern.len()
            )));
        }
        self.check_bounds("fill region", offset, length)?;
        let ptr = self.host_ptr("fill region")?;
        // SAFETY: bounds checked above
        let target = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().add(offset), length) };
        for chunk in target.chunks_exact_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
    }

    /// Copy all of `self` into the start of `to`.
    pub fn copy_to(&self, to: &MemoryRegionHandle) -> Result<()> {
        to.check_bounds("copy region", 0, self.len_bytes())?;
        let from_ptr = self.host_ptr("copy region")?;
        let to_ptr = to.host_ptr("copy region")?;
        // SAFETY: `to` holds at least `self.len_bytes()`; `copy` tolerates overlap
        unsafe { std::ptr::copy(from_ptr.as_ptr(), to_ptr.as_ptr(), self.len_bytes()) };
        Ok(())
    }

    fn check_bounds(&self, op: &str, offset: usize, length: usize) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.len_bytes() => Ok(()),
            _ => Err(Error::invalid_region(format!(
                "{op}: offset {offset} + length {length} exceeds {} ({} bytes)",
                self,
                self.len_bytes()
            ))),
        }
    }
}

impl fmt::Display for MemoryRegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.inner.id, self.inner.name)
    }
}

impl fmt::Debug for MemoryRegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegionHandle")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context)
            .field("name", &self.inner.name)
            .field("element", &self.inner.element.type_name)
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

/// Writable host range borrowed from an argument
pub struct MutableRange {
    ptr: NonNull<u8>,
    len: usize,
    element: Option<Arc<ValueDescription>>,
    pin: Pin,
}

impl MutableRange {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as any clone of `pin` is alive.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, element: Option<Arc<ValueDescription>>, pin: Pin) -> Self {
        Self { ptr, len, element, pin }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element(&self) -> Option<&Arc<ValueDescription>> {
        self.element.as_ref()
    }

    pub fn into_parts(self) -> (NonNull<u8>, usize, Pin) {
        (self.ptr, self.len, self.pin)
    }
}

/// Read-only host range borrowed from an argument
pub struct ConstRange {
    ptr: NonNull<u8>,
    len: usize,
    element: Option<Arc<ValueDescription>>,
    pin: Pin,
}

impl ConstRange {
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes for as long as any clone
    /// of `pin` is alive.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, element: Option<Arc<ValueDescription>>, pin: Pin) -> Self {
        Self { ptr, len, element, pin }
    }

    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn element(&self) -> Option<&Arc<ValueDescription>> {
        self.element.as_ref()
    }

    pub fn into_parts(self) -> (NonNull<u8>, usize, Pin) {
        (self.ptr, self.len, self.pin)
    }
}

/// Bytes of a scalar argument plus the layout that produced them
#[derive(Debug, Clone)]
pub struct PrimitiveBytes {
    pub desc: Arc<ValueDescription>,
    pub bytes: Vec<u8>,
}

/// Capability interface behind every [`Argument`].
///
/// Every `get_*` defaults to a [`Error::CapabilityMismatch`] naming `op`;
/// handlers override the pairs they support.
pub trait ArgumentHandler: Send + Sync {
    /// Human-readable type of the passed value, used in bind errors.
    fn type_name(&self) -> String;

    fn can_get_primitive(&self) -> bool {
        false
    }

    fn get_primitive(&self, op: &str) -> Result<PrimitiveBytes> {
        Err(Error::capability(op, Capability::Primitive))
    }

    fn can_get_handle(&self) -> bool {
        false
    }

    fn get_handle(&self, op: &str) -> Result<MemoryRegionHandle> {
        Err(Error::capability(op, Capability::Handle))
    }

    fn can_get_range(&self) -> bool {
        false
    }

    fn get_range(&self, op: &str) -> Result<MutableRange> {
        Err(Error::capability(op, Capability::MutableRange))
    }

    fn can_get_const_range(&self) -> bool {
        false
    }

    fn get_const_range(&self, op: &str) -> Result<ConstRange> {
        Err(Error::capability(op, Capability::ConstRange))
    }

    fn as_any(&self) -> &dyn Any;
}

/// A runtime value passed to `bind`.
#[derive(Clone)]
pub struct Argument(Arc<dyn ArgumentHandler>);

impl Argument {
    pub fn new(handler: impl ArgumentHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }

    /// A scalar or described struct, copied by value.
    pub fn value<T: Describe + bytemuck::Pod>(value: T) -> Self {
        Self::bytes(T::describe(), bytemuck::bytes_of(&value).to_vec())
    }

    pub fn bytes(desc: Arc<ValueDescription>, bytes: Vec<u8>) -> Self {
        Self::new(ValueArgument(PrimitiveBytes { desc, bytes }))
    }

    /// A region the kernel may read and write.
    pub fn region(handle: &MemoryRegionHandle) -> Self {
        Self::new(RegionArgument {
            handle: handle.clone(),
            writable: true,
        })
    }

    /// A region the kernel may only read.
    pub fn const_region(handle: &MemoryRegionHandle) -> Self {
        Self::new(RegionArgument {
            handle: handle.clone(),
            writable: false,
        })
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let handler = &*self.0;
        [
            (handler.can_get_primitive(), Capability::Primitive),
            (handler.can_get_handle(), Capability::Handle),
            (handler.can_get_range(), Capability::MutableRange),
            (handler.can_get_const_range(), Capability::ConstRange),
        ]
        .into_iter()
        .filter_map(|(supported, capability)| supported.then_some(capability))
        .collect()
    }
}

impl std::ops::Deref for Argument {
    type Target = dyn ArgumentHandler;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Argument").field(&self.0.type_name()).finish()
    }
}

impl From<&MemoryRegionHandle> for Argument {
    fn from(handle: &MemoryRegionHandle) -> Self {
        Argument::region(handle)
    }
}

struct ValueArgument(PrimitiveBytes);

impl ArgumentHandler for ValueArgument {
    fn type_name(&self) -> String {
        self.0.desc.type_name.clone()
    }

    fn can_get_primitive(&self) -> bool {
        true
    }

    fn get_primitive(&self, _op: &str) -> Result<PrimitiveBytes> {
        Ok(self.0.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RegionArgument {
    handle: MemoryRegionHandle,
    writable: bool,
}

impl ArgumentHandler for RegionArgument {
    fn type_name(&self) -> String {
        let access = if self.writable { "mutable" } else { "const" };
        format!("{access} region of {}", self.handle.element().type_name)
    }

    fn can_get_handle(&self) -> bool {
        true
    }

    fn get_handle(&self, _op: &str) -> Result<MemoryRegionHandle> {
        Ok(self.handle.clone())
    }

    fn can_get_range(&self) -> bool {
        self.writable && self.handle.storage().host_ptr().is_some()
    }

    fn get_range(&self, op: &str) -> Result<MutableRange> {
        if !self.writable {
            return Err(Error::capability(op, Capability::MutableRange));
        }
        self.handle.range(op)
    }

    fn can_get_const_range(&self) -> bool {
        self.handle.storage().host_ptr().is_some()
    }

    fn get_const_range(&self, op: &str) -> Result<ConstRange> {
        self.handle.const_range(op)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Heap storage for unit tests
    pub struct VecStorage {
        _words: Vec<u64>,
        len: usize,
        base: NonNull<u8>,
    }

    // SAFETY: the buffer is never reallocated, so `base` stays valid
    unsafe impl Send for VecStorage {}
    unsafe impl Sync for VecStorage {}

    impl VecStorage {
        pub fn new(len: usize) -> Arc<Self> {
            let mut words = vec![0u64; len.div_ceil(8).max(1)];
            let base = NonNull::new(words.as_mut_ptr() as *mut u8).unwrap();
            Arc::new(Self {
                _words: words,
                len,
                base,
            })
        }
    }

    impl RegionStorage for VecStorage {
        fn len(&self) -> usize {
            self.len
        }

        fn host_ptr(&self) -> Option<NonNull<u8>> {
            Some(self.base)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub fn region<T: Describe>(context: ContextId, name: &str, count: usize) -> MemoryRegionHandle {
        let element = T::describe();
        let storage = VecStorage::new(element.size * count);
        MemoryRegionHandle::new(context, name, element, storage)
    }
}
