use crate::handler::HandlerMethod;
use crate::logger::MAPPINGS_TARGET;
use crate::mapping::cors::CorsConfiguration;
use crate::mapping::naming::NamingStrategy;
use crate::mapping::{MappingError, MappingKey, MappingStrategy};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// One live registration: a mapping key bound to a handler method, plus what
/// was derived from it at registration time.
#[derive(Debug, Clone)]
pub struct MappingRegistration<T> {
    mapping: T,
    handler_method: HandlerMethod,
    direct_paths: Vec<String>,
    mapping_name: Option<String>,
    has_cors_config: bool,
}

impl<T> MappingRegistration<T> {
    pub fn mapping(&self) -> &T {
        &self.mapping
    }

    pub fn handler_method(&self) -> &HandlerMethod {
        &self.handler_method
    }

    pub fn direct_paths(&self) -> &[String] {
        &self.direct_paths
    }

    pub fn mapping_name(&self) -> Option<&str> {
        self.mapping_name.as_deref()
    }

    pub fn has_cors_config(&self) -> bool {
        self.has_cors_config
    }
}

struct RegistryTable<T> {
    registrations: HashMap<T, MappingRegistration<T>, FnvBuildHasher>,
    path_lookup: HashMap<String, Vec<T>, FnvBuildHasher>,
}

/// The table of registered mappings and the indexes derived from it.
///
/// # Behavior
/// The registration table and the direct-path index sit behind one
/// [`RwLock`]: lookups share it, `register`/`unregister` take it exclusively
/// for the whole mutation, so a reader never sees a key in one but not the
/// other. The name and CORS indexes are [`DashMap`]s whose buckets are
/// immutable `Arc`s replaced whole, so they can be read without the lock.
pub struct MappingRegistry<T>
where
    T: MappingKey,
{
    table: RwLock<RegistryTable<T>>,
    name_lookup: DashMap<String, Arc<Vec<HandlerMethod>>, FnvBuildHasher>,
    cors_lookup: DashMap<HandlerMethod, Arc<CorsConfiguration>, FnvBuildHasher>,
    naming_strategy: Option<Arc<dyn NamingStrategy<T>>>,
}

impl<T> Default for MappingRegistry<T>
where
    T: MappingKey,
{
    fn default() -> Self {
        MappingRegistry::new(None)
    }
}

impl<T> MappingRegistry<T>
where
    T: MappingKey,
{
    pub fn new(naming_strategy: Option<Arc<dyn NamingStrategy<T>>>) -> Self {
        Self {
            table: RwLock::new(RegistryTable {
                registrations: HashMap::with_hasher(FnvBuildHasher::default()),
                path_lookup: HashMap::with_hasher(FnvBuildHasher::default()),
            }),
            name_lookup: DashMap::with_hasher(FnvBuildHasher::default()),
            cors_lookup: DashMap::with_hasher(FnvBuildHasher::default()),
            naming_strategy,
        }
    }

    /// Acquires the shared lock for a multi-step lookup.
    pub fn read(&self) -> RegistryReadView<'_, T> {
        RegistryReadView {
            table: self.table.read(),
        }
    }

    /// Binds `mapping` to `handler_method`.
    ///
    /// # Behavior
    /// Direct paths, name and CORS configuration are all computed before the
    /// table is touched, so a failure leaves the registry unchanged.
    /// Registering the same handler method under an equal key again is a no-op.
    ///
    /// # Errors
    /// - `AmbiguousMapping` if the key is already bound to a different handler method.
    /// - Whatever the strategy's `init_cors_configuration` returns.
    pub fn register(
        &self,
        mapping: T,
        handler_method: HandlerMethod,
        strategy: &dyn MappingStrategy<T>,
    ) -> Result<(), MappingError> {
        let mut table = self.table.write();
        if let Some(existing) = table.registrations.get(&mapping) {
            if existing.handler_method != handler_method {
                return Err(MappingError::ambiguous_mapping(
                    &mapping,
                    &existing.handler_method,
                    &handler_method,
                ));
            }
            log::trace!("{} already mapped to {}", mapping, handler_method);
            return Ok(());
        }

        let direct_paths = strategy.direct_paths(&mapping);
        let mapping_name = self
            .naming_strategy
            .as_ref()
            .map(|naming| naming.name(&handler_method, &mapping));
        let cors_config = strategy.init_cors_configuration(&handler_method, &mapping)?;

        for path in &direct_paths {
            let keys = table.path_lookup.entry(path.clone()).or_default();
            if !keys.contains(&mapping) {
                keys.push(mapping.clone());
            }
        }
        if let Some(name) = &mapping_name {
            self.add_mapping_name(name, &handler_method);
        }
        let has_cors_config = cors_config.is_some();
        if let Some(config) = cors_config {
            self.cors_lookup
                .insert(handler_method.clone(), Arc::new(config));
        }

        log::debug!(target: MAPPINGS_TARGET, "Mapped {} onto {}", mapping, handler_method);
        table.registrations.insert(
            mapping.clone(),
            MappingRegistration {
                mapping,
                handler_method,
                direct_paths,
                mapping_name,
                has_cors_config,
            },
        );
        Ok(())
    }

    /// Removes the registration for `mapping` from the table and every index. No-op if absent.
    pub fn unregister(&self, mapping: &T) {
        let mut table = self.table.write();
        let Some(registration) = table.registrations.remove(mapping) else {
            return;
        };

        for path in &registration.direct_paths {
            if let Some(keys) = table.path_lookup.get_mut(path) {
                keys.retain(|key| key != mapping);
                if keys.is_empty() {
                    table.path_lookup.remove(path);
                }
            }
        }
        if let Some(name) = &registration.mapping_name {
            let still_named = table.registrations.values().any(|other| {
                other.mapping_name.as_deref() == Some(name.as_str())
                    && other.handler_method == registration.handler_method
            });
            if !still_named {
                self.remove_mapping_name(name, &registration.handler_method);
            }
        }
        if registration.has_cors_config {
            let still_referenced = table
                .registrations
                .values()
                .any(|other| other.handler_method == registration.handler_method);
            if !still_referenced {
                self.cors_lookup.remove(&registration.handler_method);
            }
        }
        log::debug!(target: MAPPINGS_TARGET, "Unmapped {}", mapping);
    }

    /// Publishes a new bucket containing `handler_method`. Callers hold the write lock.
    fn add_mapping_name(&self, name: &str, handler_method: &HandlerMethod) {
        let current = self.name_lookup.get(name).map(|entry| entry.value().clone());
        if let Some(current) = &current {
            if current.contains(handler_method) {
                return;
            }
        }
        let mut updated = current.map(|bucket| bucket.as_ref().clone()).unwrap_or_default();
        updated.push(handler_method.clone());
        self.name_lookup.insert(name.to_string(), Arc::new(updated));
    }

    /// Publishes a bucket without `handler_method`, or drops the name. Callers hold the write lock.
    fn remove_mapping_name(&self, name: &str, handler_method: &HandlerMethod) {
        let Some(current) = self.name_lookup.get(name).map(|entry| entry.value().clone()) else {
            return;
        };
        let updated: Vec<HandlerMethod> = current
            .iter()
            .filter(|existing| *existing != handler_method)
            .cloned()
            .collect();
        if updated.is_empty() {
            self.name_lookup.remove(name);
        } else {
            self.name_lookup.insert(name.to_string(), Arc::new(updated));
        }
    }

    /// Handler methods registered under `name`. Does not take the registry lock.
    pub fn handler_methods_by_mapping_name(&self, name: &str) -> Arc<Vec<HandlerMethod>> {
        self.name_lookup
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// CORS configuration of a handler method, keyed by the method it was resolved from, if any.
    /// Does not take the registry lock.
    pub fn cors_configuration(&self, handler_method: &HandlerMethod) -> Option<Arc<CorsConfiguration>> {
        let original = handler_method.resolved_from().unwrap_or(handler_method);
        self.cors_lookup
            .get(original)
            .map(|entry| entry.value().clone())
    }

    /// Keys registered under the exact path. Takes the shared lock for this one call.
    pub fn mappings_by_direct_path(&self, path: &str) -> Vec<T> {
        self.read().mappings_by_direct_path(path).to_vec()
    }

    /// A point-in-time copy of every registration.
    pub fn snapshot(&self) -> Vec<MappingRegistration<T>> {
        self.read().registrations().cloned().collect()
    }

    pub fn registration(&self, mapping: &T) -> Option<MappingRegistration<T>> {
        self.read().registration(mapping).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A consistent view of the registry, held for the duration of one lookup.
pub struct RegistryReadView<'a, T>
where
    T: MappingKey,
{
    table: RwLockReadGuard<'a, RegistryTable<T>>,
}

impl<'a, T> RegistryReadView<'a, T>
where
    T: MappingKey,
{
    pub fn mappings_by_direct_path(&self, path: &str) -> &[T] {
        self.table
            .path_lookup
            .get(path)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn registration(&self, mapping: &T) -> Option<&MappingRegistration<T>> {
        self.table.registrations.get(mapping)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &MappingRegistration<T>> {
        self.table.registrations.values()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &T> {
        self.table.registrations.keys()
    }

    pub fn len(&self) -> usize {
        self.table.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.registrations.is_empty()
    }
}
