//! Execution contexts and their per-context caches.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::event::ProfilingClock;
use crate::kernel::Kernel;
use crate::memory::MemoryRegionHandle;
use crate::queue::ComputeQueue;
use crate::registry;
use crate::types::{Describe, ValueDescription};

/// Process-unique context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Execution backend families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    /// Synchronous execution on the calling thread
    Host,
    /// Asynchronous worker-thread command stream
    Stream,
    /// Apple Metal devices
    Metal,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Host => "host",
            BackendKind::Stream => "stream",
            BackendKind::Metal => "metal",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend's device/execution environment.
///
/// Contexts own memory, hand out queues and cache expensive per-context
/// objects such as compiled libraries and created kernels.
pub trait ComputeContext: Send + Sync {
    fn id(&self) -> ContextId;

    fn backend(&self) -> BackendKind;

    fn config(&self) -> &ContextConfig;

    /// Clock that profiling timestamps are measured against.
    fn clock(&self) -> &ProfilingClock;

    fn queue(&self, label: &str) -> Result<Arc<dyn ComputeQueue>>;

    fn allocate(&self, name: &str, element: Arc<ValueDescription>, count: usize) -> Result<MemoryRegionHandle>;

    /// Return a region to the context. Outstanding pins keep it alive.
    fn free(&self, region: &MemoryRegionHandle) -> Result<()>;

    fn cache(&self) -> &ContextCache;

    /// Kernel `name` from this backend's registry, created once per context.
    fn kernel(&self, name: &str) -> Result<Arc<Kernel>>;

    fn as_any(&self) -> &dyn Any;

    fn allocate_array<T: Describe>(&self, name: &str, count: usize) -> Result<MemoryRegionHandle>
    where
        Self: Sized,
    {
        self.allocate(name, T::describe(), count)
    }
}

/// Shared implementation of [`ComputeContext::kernel`] for backends.
pub fn cached_kernel(ctx: &dyn ComputeContext, name: &str) -> Result<Arc<Kernel>> {
    ctx.cache()
        .get_or_try_create(&format!("kernel:{name}"), || registry::create_kernel(ctx.backend(), name, ctx))
}

/// Fail with [`Error::ForeignContext`] unless `found` is `expected`.
pub fn ensure_same_context(op: &str, what: impl fmt::Display, expected: ContextId, found: ContextId) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::ForeignContext {
            op: op.to_string(),
            what: what.to_string(),
            expected,
            found,
        })
    }
}

/// Typed get-or-create cache keyed by string.
#[derive(Default)]
pub struct ContextCache {
    entries: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries.read().get(key).cloned()?.downcast::<T>().ok()
    }

    /// Return the entry for `key`, creating it with `create` on a miss.
    ///
    /// `create` runs without the lock held; if two threads race, the first
    /// insert wins and both receive it.
    pub fn get_or_try_create<T, F>(&self, key: &str, create: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(entry) = self.entries.read().get(key).cloned() {
            return Self::downcast(key, entry);
        }

        let created: Arc<dyn Any + Send + Sync> = Arc::new(create()?);
        let entry = self
            .entries
            .write()
            .entry(key.to_string())
            .or_insert(created)
            .clone();
        Self::downcast(key, entry)
    }

    fn downcast<T: Any + Send + Sync>(key: &str, entry: Arc<dyn Any + Send + Sync>) -> Result<Arc<T>> {
        entry.downcast::<T>().map_err(|_| {
            Error::conversion(
                format!("cache entry '{key}'"),
                std::any::type_name::<T>(),
                "key already holds a different type",
            )
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
