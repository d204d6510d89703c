use crate::handler::{BeanResolver, Controller, SharedController};
use dashmap::{DashMap, Entry};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during bean registry operations.
#[derive(Error, Debug)]
pub enum BeanRegistryError {
    /// No bean is registered under the name.
    #[error("Bean with name '{name}' not found.")]
    MissingBean { name: String },

    /// A different bean already uses the name.
    #[error("Bean with name '{name}' already exists.")]
    ConflictingBeanName { name: String },
}

impl BeanRegistryError {
    #[inline]
    pub(crate) fn missing_bean(name: impl Into<String>) -> Self {
        Self::MissingBean { name: name.into() }
    }

    #[inline]
    pub(crate) fn conflicting_bean_name(name: impl Into<String>) -> Self {
        Self::ConflictingBeanName { name: name.into() }
    }
}

/// A thread-safe registry of named controller beans.
///
/// Serves as the [`BeanResolver`] for named handler methods and as the source
/// of candidate bean names when handler methods are detected at startup.
pub struct BeanRegistry {
    beans: DashMap<String, SharedController, fnv::FnvBuildHasher>,
}

impl Default for BeanRegistry {
    fn default() -> Self {
        BeanRegistry::new()
    }
}

impl BeanRegistry {
    pub fn new() -> Self {
        Self {
            beans: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    /// Registers a controller under a unique name.
    pub fn register_bean(
        &self,
        name: impl Into<String>,
        controller: impl Controller + 'static,
    ) -> Result<(), BeanRegistryError> {
        self.register_shared(name, Arc::new(controller))
    }

    pub fn register_shared(
        &self,
        name: impl Into<String>,
        controller: SharedController,
    ) -> Result<(), BeanRegistryError> {
        let name = name.into();
        match self.beans.entry(name) {
            Entry::Occupied(entry) => Err(BeanRegistryError::conflicting_bean_name(entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(controller);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }
}

impl BeanResolver for BeanRegistry {
    fn resolve_bean(&self, name: &str) -> Result<SharedController, BeanRegistryError> {
        match self.beans.get(name) {
            None => Err(BeanRegistryError::missing_bean(name)),
            Some(bean) => Ok(bean.value().clone()),
        }
    }

    fn bean_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.beans.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MethodRef;
    use crate::handler::tests::EchoController;
    use std::thread;

    #[test]
    fn test_register_multiple_beans_success() {
        let registry = BeanRegistry::new();
        let result1 = registry.register_bean("users", EchoController::new("UserController", vec![]));
        let result2 = registry.register_bean("orders", EchoController::new("OrderController", vec![]));

        assert!(result1.is_ok());
        assert!(result2.is_ok());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.bean_names(), vec!["orders".to_string(), "users".to_string()]);
    }

    #[test]
    fn test_register_bean_with_conflicting_name() {
        let registry = BeanRegistry::new();
        registry
            .register_bean("users", EchoController::new("UserController", vec![]))
            .unwrap();

        let result = registry.register_bean(
            "users",
            EchoController::new("OtherController", vec![MethodRef::new("list")]),
        );
        assert!(matches!(
            result,
            Err(BeanRegistryError::ConflictingBeanName { .. })
        ));

        // The first bean is still the one registered.
        let bean = registry.resolve_bean("users").unwrap();
        assert_eq!(bean.type_name(), "UserController");
    }

    #[test]
    fn test_resolve_missing_bean() {
        let registry = BeanRegistry::new();
        let result = registry.resolve_bean("missing");
        assert!(matches!(result, Err(BeanRegistryError::MissingBean { .. })));
    }

    #[test]
    fn test_registry_thread_safety() {
        let registry = Arc::new(BeanRegistry::new());
        let mut handles = vec![];

        for i in 0..10 {
            let registry = registry.clone();
            let handle = thread::spawn(move || {
                registry.register_bean(
                    format!("bean_{}", i),
                    EchoController::new(&format!("Controller{}", i), vec![]),
                )
            });
            handles.push(handle);
        }

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert_eq!(registry.len(), 10);
        for i in 0..10 {
            assert!(registry.resolve_bean(&format!("bean_{}", i)).is_ok());
        }
    }
}
