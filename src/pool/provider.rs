//! Per-worker service provider seam
//!
//! An embedder may hand each worker a scoped service container: the worker
//! acquires a scope when it enters dispatch, resolves services by type while
//! it runs, and releases the scope (by drop) when it retires.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A scope of services held for one worker's lifetime
pub trait WorkerScope: Send {
    /// Resolve a service instance by type
    fn get(&self, service: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Factory producing one scope per worker
pub trait ServiceProviderFactory: Send + Sync {
    /// Acquire a scope; releasing is dropping the returned box
    fn acquire_scope(&self) -> Box<dyn WorkerScope>;
}

/// Simple map-backed provider sharing one service set across scopes
#[derive(Default)]
pub struct MapServiceProvider {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl MapServiceProvider {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service instance
    pub fn insert<T: Any + Send + Sync>(&mut self, service: T) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }
}

struct MapScope {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl WorkerScope for MapScope {
    fn get(&self, service: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&service).cloned()
    }
}

impl ServiceProviderFactory for MapServiceProvider {
    fn acquire_scope(&self) -> Box<dyn WorkerScope> {
        Box::new(MapScope {
            services: self.services.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_resolves_registered_service() {
        let mut provider = MapServiceProvider::new();
        provider.insert(42u64);

        let scope = provider.acquire_scope();
        let service = scope.get(TypeId::of::<u64>());
        assert!(service
            .and_then(|s| s.downcast::<u64>().ok())
            .is_some_and(|v| *v == 42));
        assert!(scope.get(TypeId::of::<String>()).is_none());
    }
}
