use crate::exchange::Exchange;
use crate::exchange::attributes::names;
use crate::handler::{
    BeanResolver, Controller, Handler, HandlerError, HandlerMethod, HandlerOutput, HandlerRef,
    MethodRef, SharedController,
};
use crate::logger::{Component, LogEntry, MAPPINGS_TARGET};
use crate::mapping::cors::{ALLOW_CORS_CONFIG, CorsConfiguration, apply_cors};
use crate::mapping::naming::NamingStrategy;
use crate::mapping::registry::{MappingRegistration, MappingRegistry, RegistryReadView};
use crate::mapping::{HandlerMapping, MappingError, MappingKey, MappingStrategy};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::sync::Arc;

/// Bean name prefix of scoped proxy targets, which are never scanned.
const SCOPED_TARGET_NAME_PREFIX: &str = "scopedTarget.";

/// Stand-in controller behind [`PREFLIGHT_AMBIGUOUS_MATCH`]. Never invoked; preflight
/// requests are answered by the preflight handler.
struct EmptyHandler;

#[async_trait]
impl Controller for EmptyHandler {
    fn type_name(&self) -> &str {
        "EmptyHandler"
    }

    fn methods(&self) -> Vec<MethodRef> {
        vec![MethodRef::new("handle")]
    }

    async fn invoke(
        &self,
        _method: &MethodRef,
        _exchange: &mut Exchange,
    ) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::failed("Not implemented"))
    }
}

/// Returned for a CORS preflight request whose best candidates tie and at least
/// one of them has CORS configuration.
pub static PREFLIGHT_AMBIGUOUS_MATCH: Lazy<HandlerMethod> =
    Lazy::new(|| HandlerMethod::new(Arc::new(EmptyHandler), MethodRef::new("handle")));

/// A candidate: the key narrowed for this request plus its registration.
struct Match<'v, T> {
    mapping: T,
    registration: &'v MappingRegistration<T>,
}

/// Maps requests to controller methods through a [`MappingStrategy`].
///
/// # Behavior
/// Owns the [`MappingRegistry`] for its strategy. Handler methods are
/// registered at startup by scanning beans (`init_handler_methods`) or
/// one controller at a time (`detect_handler_methods`), and can be added
/// or removed at any time afterwards. Every lookup sees one consistent
/// snapshot of the registry.
pub struct HandlerMethodMapping<T, S>
where
    T: MappingKey,
    S: MappingStrategy<T>,
{
    name: String,
    strategy: S,
    registry: MappingRegistry<T>,
    bean_resolver: Option<Arc<dyn BeanResolver>>,
    global_cors: Option<CorsConfiguration>,
}

impl<T, S> HandlerMethodMapping<T, S>
where
    T: MappingKey,
    S: MappingStrategy<T>,
{
    pub fn new(name: impl Into<String>, strategy: S) -> Self {
        Self {
            name: name.into(),
            strategy,
            registry: MappingRegistry::new(None),
            bean_resolver: None,
            global_cors: None,
        }
    }

    /// Sets the naming strategy. Replaces the registry, so call it before registering.
    pub fn with_naming_strategy(mut self, naming_strategy: Arc<dyn NamingStrategy<T>>) -> Self {
        self.registry = MappingRegistry::new(Some(naming_strategy));
        self
    }

    /// Resolver used to turn named handler beans into instances at lookup time.
    pub fn with_bean_resolver(mut self, bean_resolver: Arc<dyn BeanResolver>) -> Self {
        self.bean_resolver = Some(bean_resolver);
        self
    }

    /// Configuration combined with every handler's own CORS configuration.
    pub fn with_global_cors(mut self, global_cors: CorsConfiguration) -> Self {
        self.global_cors = Some(global_cors);
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn registry(&self) -> &MappingRegistry<T> {
        &self.registry
    }

    pub fn register_mapping(&self, mapping: T, handler_method: HandlerMethod) -> Result<(), MappingError> {
        self.registry.register(mapping, handler_method, &self.strategy)
    }

    pub fn unregister_mapping(&self, mapping: &T) {
        self.registry.unregister(mapping);
    }

    /// A point-in-time copy of all mappings and their handler methods.
    pub fn handler_methods(&self) -> Vec<(T, HandlerMethod)> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|registration| {
                (
                    registration.mapping().clone(),
                    registration.handler_method().clone(),
                )
            })
            .collect()
    }

    pub fn handler_methods_for_mapping_name(&self, name: &str) -> Arc<Vec<HandlerMethod>> {
        self.registry.handler_methods_by_mapping_name(name)
    }

    /// Scans every bean the resolver knows about and registers its handler methods.
    ///
    /// # Behavior
    /// Beans named `scopedTarget.*` are skipped, as are controllers the strategy
    /// does not consider handlers. Detected handler methods reference their bean
    /// by name.
    ///
    /// # Errors
    /// Fails on the first bean that cannot be resolved or whose methods cannot
    /// be mapped or registered.
    pub fn init_handler_methods(&self, beans: &dyn BeanResolver) -> Result<(), MappingError> {
        for bean_name in beans.bean_names() {
            if bean_name.starts_with(SCOPED_TARGET_NAME_PREFIX) {
                continue;
            }
            let controller = beans.resolve_bean(&bean_name)?;
            if self.strategy.is_handler(controller.as_ref()) {
                self.detect_with(&controller, HandlerRef::Named(bean_name))?;
            }
        }
        let total = self.registry.len();
        log::debug!(target: MAPPINGS_TARGET, "{} mappings in '{}'", total, self.name);
        log::trace!(
            "{}",
            LogEntry::new(Component::Registry, format!("{} mappings in '{}'", total, self.name))
                .to_json()
        );
        Ok(())
    }

    /// Registers every handler method of one controller.
    ///
    /// # Returns
    /// The number of methods mapped.
    pub fn detect_handler_methods(&self, handler: HandlerRef) -> Result<usize, MappingError> {
        let controller = match &handler {
            HandlerRef::Instance(controller) => controller.clone(),
            HandlerRef::Named(name) => match &self.bean_resolver {
                Some(resolver) => resolver.resolve_bean(name)?,
                None => {
                    return Err(MappingError::invalid_mapping(
                        name,
                        "named handler without a bean resolver",
                    ));
                }
            },
        };
        self.detect_with(&controller, handler)
    }

    fn detect_with(&self, controller: &SharedController, handler: HandlerRef) -> Result<usize, MappingError> {
        let type_cors = controller.type_cross_origin();
        let mut methods = Vec::new();
        for method in controller.methods() {
            let Some(mapping) = self.strategy.mapping_for_method(controller.as_ref(), &method)? else {
                continue;
            };
            let method = match &type_cors {
                Some(outer) => {
                    let combined = match method.cross_origin() {
                        Some(inner) => outer.combine(inner),
                        None => outer.clone(),
                    };
                    method.with_cross_origin(combined)
                }
                None => method,
            };
            methods.push((mapping, method));
        }

        if log::log_enabled!(target: MAPPINGS_TARGET, log::Level::Trace) {
            let formatted: Vec<String> = methods
                .iter()
                .map(|(mapping, method)| format!("\t{}: {}", mapping, method.name()))
                .collect();
            log::trace!(
                target: MAPPINGS_TARGET,
                "\n\t{}:\n{}",
                controller.type_name(),
                formatted.join("\n")
            );
        }

        let count = methods.len();
        for (mapping, method) in methods {
            let handler_method = match &handler {
                HandlerRef::Instance(instance) => HandlerMethod::new(instance.clone(), method),
                HandlerRef::Named(name) => HandlerMethod::named(name, controller.type_name(), method),
            };
            self.register_mapping(mapping, handler_method)?;
        }
        Ok(count)
    }

    /// Finds the best-matching handler method for the request.
    ///
    /// # Behavior
    /// 1. Holds the registry's shared lock for the whole match-and-select step.
    /// 2. Tries keys registered under the exact lookup path first, then every key.
    /// 3. Sorts candidates with the strategy's comparator, best first.
    /// 4. If the two best tie, a CORS preflight where any tied candidate has CORS
    ///    configuration gets [`PREFLIGHT_AMBIGUOUS_MATCH`]; anything else is an error.
    /// 5. Records the winner in the exchange's attributes and lets the strategy
    ///    expose match details.
    ///
    /// # Returns
    /// `Ok(None)` on a routing miss the strategy does not turn into a handler or error.
    ///
    /// # Errors
    /// `AmbiguousHandler` naming the two tied handler methods, or whatever the
    /// strategy's `handle_no_match` reports.
    pub fn lookup_handler_method(
        &self,
        exchange: &mut Exchange,
    ) -> Result<Option<HandlerMethod>, MappingError> {
        let lookup_path = self.strategy.lookup_path(exchange);
        let (mapping, handler_method) = {
            let view = self.registry.read();
            let mut matches = Vec::new();
            self.add_matching_mappings(
                view.mappings_by_direct_path(&lookup_path).iter(),
                &view,
                exchange,
                &lookup_path,
                &mut matches,
            );
            if matches.is_empty() {
                log::trace!("No direct-path match for '{}', scanning all mappings", lookup_path);
                self.add_matching_mappings(view.mappings(), &view, exchange, &lookup_path, &mut matches);
            }
            if matches.is_empty() {
                let mappings: Vec<&T> = view.mappings().collect();
                return self
                    .strategy
                    .handle_no_match(&mappings, &lookup_path, exchange);
            }

            let compare = |a: &Match<'_, T>, b: &Match<'_, T>| {
                self.strategy
                    .compare(&a.mapping, &b.mapping, exchange, &lookup_path)
            };
            matches.sort_by(compare);
            if matches.len() > 1 {
                log::trace!(
                    "{} matching mappings: {:?}",
                    matches.len(),
                    matches.iter().map(|m| m.mapping.to_string()).collect::<Vec<_>>()
                );
                let best = &matches[0];
                let second = &matches[1];
                if compare(best, second) == Ordering::Equal {
                    if exchange.is_preflight()
                        && matches
                            .iter()
                            .any(|candidate| candidate.registration.has_cors_config())
                    {
                        return Ok(Some(PREFLIGHT_AMBIGUOUS_MATCH.clone()));
                    }
                    return Err(MappingError::ambiguous_handler(
                        lookup_path.as_str(),
                        best.registration.handler_method(),
                        second.registration.handler_method(),
                    ));
                }
            }
            let best = matches.swap_remove(0);
            (best.mapping, best.registration.handler_method().clone())
        };

        self.strategy.handle_match(&mapping, &lookup_path, exchange);
        let attributes = exchange.attributes_mut();
        attributes.insert::<HandlerMethod>(names::BEST_MATCHING_HANDLER, handler_method.clone());
        attributes.insert::<T>(names::BEST_MATCHING_MAPPING, mapping);
        attributes.insert::<String>(names::PATH_WITHIN_MAPPING, lookup_path);
        Ok(Some(handler_method))
    }

    fn add_matching_mappings<'v, 'k>(
        &self,
        mappings: impl Iterator<Item = &'k T>,
        view: &'v RegistryReadView<'_, T>,
        exchange: &Exchange,
        lookup_path: &str,
        matches: &mut Vec<Match<'v, T>>,
    ) where
        T: 'k,
    {
        for mapping in mappings {
            if let Some(narrowed) = self.strategy.matching_mapping(mapping, exchange, lookup_path) {
                if let Some(registration) = view.registration(mapping) {
                    matches.push(Match {
                        mapping: narrowed,
                        registration,
                    });
                }
            }
        }
    }

    /// CORS configuration for a handler method: the permissive configuration for
    /// [`PREFLIGHT_AMBIGUOUS_MATCH`], otherwise the global configuration combined
    /// with the handler's own.
    pub fn cors_configuration(&self, handler_method: &HandlerMethod) -> Option<CorsConfiguration> {
        if handler_method == &*PREFLIGHT_AMBIGUOUS_MATCH {
            return Some(ALLOW_CORS_CONFIG.clone());
        }
        let local = self.registry.cors_configuration(handler_method);
        match (&self.global_cors, local) {
            (Some(global), Some(local)) => Some(global.combine(&local)),
            (Some(global), None) => Some(global.clone()),
            (None, Some(local)) => Some(local.as_ref().clone()),
            (None, None) => None,
        }
    }

    fn has_cors_configuration_source(&self, handler_method: &HandlerMethod) -> bool {
        self.global_cors.is_some()
            || (handler_method != &*PREFLIGHT_AMBIGUOUS_MATCH
                && self.registry.cors_configuration(handler_method).is_some())
    }
}

impl<T, S> HandlerMapping for HandlerMethodMapping<T, S>
where
    T: MappingKey,
    S: MappingStrategy<T>,
{
    fn get_handler(&self, exchange: &mut Exchange) -> Result<Option<Handler>, MappingError> {
        let Some(handler_method) = self.lookup_handler_method(exchange)? else {
            return Ok(None);
        };
        let handler_method = match &self.bean_resolver {
            Some(resolver) => handler_method.create_with_resolved_bean(resolver.as_ref())?,
            None => handler_method,
        };
        log::debug!("Mapped to {}", handler_method);

        if exchange.is_preflight() || self.has_cors_configuration_source(&handler_method) {
            let config = self.cors_configuration(&handler_method);
            if let Some(config) = &config {
                config.validate_allow_credentials()?;
            }
            return Ok(Some(apply_cors(
                Handler::Method(handler_method),
                config,
                exchange,
            )));
        }
        Ok(Some(Handler::Method(handler_method)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
