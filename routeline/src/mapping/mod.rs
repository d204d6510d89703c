pub mod cors;
pub mod handler_mapping;
pub mod naming;
pub mod registry;

use crate::exchange::Exchange;
use crate::handler::registry::BeanRegistryError;
use crate::handler::{Controller, Handler, HandlerMethod, MethodRef};
use crate::mapping::cors::{CorsConfiguration, CorsError};
use http::Method;
use std::cmp::Ordering;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use thiserror::Error;

/// Errors raised while registering mappings or resolving a request to a handler.
#[derive(Error, Debug)]
pub enum MappingError {
    /// A mapping key is already bound to a different handler method.
    #[error(
        "Ambiguous mapping. Cannot map '{new_handler}' method {mapping}: there is already '{existing_handler}' mapped."
    )]
    AmbiguousMapping {
        mapping: String,
        existing_handler: String,
        new_handler: String,
    },

    /// Two candidates ranked equally best for one request.
    #[error("Ambiguous handler methods mapped for '{path}': {{{first}, {second}}}")]
    AmbiguousHandler {
        path: String,
        first: String,
        second: String,
    },

    #[error("Invalid mapping on handler '{handler}': {reason}")]
    InvalidMapping { handler: String, reason: String },

    #[error("Request method '{method}' is not supported.")]
    MethodNotAllowed { method: Method, allowed: Vec<Method> },

    #[error("Content type '{content_type}' is not supported.")]
    UnsupportedMediaType {
        content_type: String,
        supported: Vec<String>,
    },

    #[error("No acceptable representation.")]
    NotAcceptable { supported: Vec<String> },

    #[error("Parameter conditions {conditions:?} not met for actual request parameters.")]
    UnsatisfiedParams { conditions: Vec<String> },

    #[error("No handler found for {method} {path}.")]
    NoHandlerFound { method: Method, path: String },

    #[error(transparent)]
    BeanResolution(#[from] BeanRegistryError),

    #[error(transparent)]
    Cors(#[from] CorsError),
}

impl MappingError {
    #[inline]
    pub(crate) fn ambiguous_mapping(
        mapping: impl Display,
        existing_handler: impl Display,
        new_handler: impl Display,
    ) -> Self {
        Self::AmbiguousMapping {
            mapping: mapping.to_string(),
            existing_handler: existing_handler.to_string(),
            new_handler: new_handler.to_string(),
        }
    }

    #[inline]
    pub(crate) fn ambiguous_handler(
        path: impl Into<String>,
        first: impl Display,
        second: impl Display,
    ) -> Self {
        Self::AmbiguousHandler {
            path: path.into(),
            first: first.to_string(),
            second: second.to_string(),
        }
    }

    #[inline]
    pub(crate) fn invalid_mapping(handler: impl Display, reason: impl Display) -> Self {
        Self::InvalidMapping {
            handler: handler.to_string(),
            reason: reason.to_string(),
        }
    }

    #[inline]
    pub(crate) fn no_handler_found(method: Method, path: impl Into<String>) -> Self {
        Self::NoHandlerFound {
            method,
            path: path.into(),
        }
    }
}

/// Bounds every mapping key must satisfy.
pub trait MappingKey: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static {}

impl<T> MappingKey for T where T: Eq + Hash + Clone + Display + Debug + Send + Sync + 'static {}

/// The key-specific half of handler method mapping.
///
/// The registry and resolver are generic over the mapping key `T`; everything
/// that depends on what a key means (how it is derived from a controller
/// method, how it matches and ranks against a request) lives here.
pub trait MappingStrategy<T>: Send + Sync
where
    T: MappingKey,
{
    /// Whether the controller's methods should be scanned at all.
    fn is_handler(&self, controller: &dyn Controller) -> bool;

    /// The mapping key for a controller method, or `None` if it is not a handler method.
    ///
    /// # Errors
    /// Returns `InvalidMapping` if the declared route cannot be turned into a key.
    fn mapping_for_method(
        &self,
        controller: &dyn Controller,
        method: &MethodRef,
    ) -> Result<Option<T>, MappingError>;

    /// Paths the key matches literally, used for the exact-path index.
    fn direct_paths(&self, mapping: &T) -> Vec<String>;

    /// The path used for lookups, computed once per request.
    fn lookup_path(&self, exchange: &Exchange) -> String {
        exchange.lookup_path().into_owned()
    }

    /// Matches a key against the request and returns it narrowed to what matched.
    fn matching_mapping(&self, mapping: &T, exchange: &Exchange, lookup_path: &str) -> Option<T>;

    /// Ranks two keys narrowed for the same request. `Less` is the better match.
    fn compare(&self, a: &T, b: &T, exchange: &Exchange, lookup_path: &str) -> Ordering;

    /// Called with the winning key before the handler is returned.
    fn handle_match(&self, _mapping: &T, _lookup_path: &str, _exchange: &mut Exchange) {}

    /// Called when nothing matched, with every registered key.
    ///
    /// # Returns
    /// A handler to use anyway, `None` for a plain miss, or an error describing
    /// why a request that matched by path was rejected.
    fn handle_no_match(
        &self,
        _mappings: &[&T],
        _lookup_path: &str,
        _exchange: &Exchange,
    ) -> Result<Option<HandlerMethod>, MappingError> {
        Ok(None)
    }

    /// CORS policy computed once when a handler method is registered.
    fn init_cors_configuration(
        &self,
        _handler_method: &HandlerMethod,
        _mapping: &T,
    ) -> Result<Option<CorsConfiguration>, MappingError> {
        Ok(None)
    }
}

/// Resolves a request to a handler. The dispatcher asks each mapping in turn.
pub trait HandlerMapping: Send + Sync {
    /// # Returns
    /// `Ok(None)` if this mapping has no handler for the request.
    fn get_handler(&self, exchange: &mut Exchange) -> Result<Option<Handler>, MappingError>;

    fn name(&self) -> &str;
}
