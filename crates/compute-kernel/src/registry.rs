//! Process-wide kernel registry.
//!
//! Kernel factories are registered per backend and name. Contexts create a
//! kernel from its factory the first time it is requested and cache it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::context::{BackendKind, ComputeContext};
use crate::error::{Error, Result};
use crate::kernel::Kernel;

/// Builds a kernel description for one context.
pub type KernelFactory = Arc<dyn Fn(&dyn ComputeContext) -> Result<Kernel> + Send + Sync>;

#[derive(Default)]
pub struct KernelRegistry {
    factories: RwLock<HashMap<(BackendKind, String), KernelFactory>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: BackendKind, name: &str, factory: KernelFactory) -> Result<()> {
        let mut factories = self.factories.write();
        let key = (backend, name.to_string());
        if factories.contains_key(&key) {
            return Err(Error::DuplicateRegistration {
                registry: format!("{backend} kernel"),
                name: name.to_string(),
            });
        }
        factories.insert(key, factory);
        debug!(%backend, kernel = name, "registered kernel factory");
        Ok(())
    }

    pub fn lookup(&self, backend: BackendKind, name: &str) -> Result<KernelFactory> {
        self.factories
            .read()
            .get(&(backend, name.to_string()))
            .cloned()
            .ok_or_else(|| Error::UnregisteredKernel {
                registry: format!("{backend} kernel"),
                name: name.to_string(),
            })
    }

    /// Run the registered factory for `name` against `ctx`.
    pub fn create(&self, backend: BackendKind, name: &str, ctx: &dyn ComputeContext) -> Result<Kernel> {
        let factory = self.lookup(backend, name)?;
        factory(ctx)
    }

    pub fn contains(&self, backend: BackendKind, name: &str) -> bool {
        self.factories.read().contains_key(&(backend, name.to_string()))
    }

    /// Registered kernel names for `backend`, sorted.
    pub fn names(&self, backend: BackendKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .keys()
            .filter(|(b, _)| *b == backend)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

pub fn global() -> &'static KernelRegistry {
    static REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(KernelRegistry::new)
}

pub fn register_kernel<F>(backend: BackendKind, name: &str, factory: F) -> Result<()>
where
    F: Fn(&dyn ComputeContext) -> Result<Kernel> + Send + Sync + 'static,
{
    global().register(backend, name, Arc::new(factory))
}

pub fn create_kernel(backend: BackendKind, name: &str, ctx: &dyn ComputeContext) -> Result<Kernel> {
    global().create(backend, name, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::NullContext;

    fn empty_kernel(_ctx: &dyn ComputeContext) -> Result<Kernel> {
        Ok(Kernel::new("empty"))
    }

    #[test]
    fn test_register_and_create() {
        let registry = KernelRegistry::new();
        registry
            .register(BackendKind::Host, "empty", Arc::new(empty_kernel))
            .unwrap();
        assert!(registry.contains(BackendKind::Host, "empty"));
        assert!(!registry.contains(BackendKind::Stream, "empty"));

        let ctx = NullContext::new();
        let kernel = registry.create(BackendKind::Host, "empty", &ctx).unwrap();
        assert_eq!(kernel.name(), "empty");
        assert_eq!(registry.names(BackendKind::Host), vec!["empty".to_string()]);
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = KernelRegistry::new();
        registry
            .register(BackendKind::Host, "empty", Arc::new(empty_kernel))
            .unwrap();
        let err = registry
            .register(BackendKind::Host, "empty", Arc::new(empty_kernel))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
    }

    #[test]
    fn test_unregistered_lookup() {
        let registry = KernelRegistry::new();
        let err = match registry.lookup(BackendKind::Metal, "missing") {
            Err(err) => err,
            Ok(_) => panic!("lookup of unregistered kernel succeeded"),
        };
        assert_eq!(err.kind(), ErrorKind::UnregisteredKernel);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_context_caches_created_kernel() {
        register_kernel(BackendKind::Host, "registry-test-cached", |_ctx: &dyn ComputeContext| {
            Ok(Kernel::new("registry-test-cached"))
        })
        .unwrap();
        let ctx = NullContext::new();
        let first = ctx.kernel("registry-test-cached").unwrap();
        let second = ctx.kernel("registry-test-cached").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
