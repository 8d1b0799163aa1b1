//! Shared services available to step handlers

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Type-keyed set of shared services (database pools, API clients, ...)
///
/// Registered once on the orchestrator and handed to every handler through
/// [`StepContext`](super::StepContext). One instance per type.
#[derive(Debug, Clone, Default)]
pub struct Services {
    inner: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous one of the same type
    pub fn with<T: Send + Sync + 'static>(self, service: T) -> Self {
        self.with_arc(Arc::new(service))
    }

    /// Register an already shared service
    pub fn with_arc<T: Send + Sync + 'static>(mut self, service: Arc<T>) -> Self {
        Arc::make_mut(&mut self.inner).insert(TypeId::of::<T>(), service);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.inner.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Config {
        region: String,
    }

    #[test]
    fn test_register_and_lookup() {
        let services = Services::new()
            .with(Config {
                region: "eu".to_string(),
            })
            .with(42u64);

        assert_eq!(services.len(), 2);
        assert_eq!(services.get::<Config>().unwrap().region, "eu");
        assert_eq!(*services.get::<u64>().unwrap(), 42);
        assert!(services.get::<u32>().is_none());
    }

    #[test]
    fn test_replace_keeps_one_per_type() {
        let services = Services::new().with(1u8).with(2u8);
        assert_eq!(services.len(), 1);
        assert_eq!(*services.get::<u8>().unwrap(), 2);
    }

    #[test]
    fn test_clones_share_registrations() {
        let shared = Arc::new(Config {
            region: "us".to_string(),
        });
        let services = Services::new().with_arc(shared.clone());
        let copy = services.clone();

        assert!(Arc::ptr_eq(&copy.get::<Config>().unwrap(), &shared));
    }
}
