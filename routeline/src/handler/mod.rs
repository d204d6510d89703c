pub mod registry;

use crate::exchange::{Exchange, Response};
use crate::handler::registry::BeanRegistryError;
use crate::mapping::cors::CorsConfiguration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

pub type SharedController = Arc<dyn Controller>;

/// Errors raised by handlers while serving a request.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{status}: {reason}")]
    Status { status: StatusCode, reason: String },

    #[error("Handler bean '{name}' has not been resolved to an instance.")]
    UnresolvedBean { name: String },

    #[error("Asynchronous processing timed out.")]
    AsyncTimeout,

    #[error("Asynchronous processing was cancelled.")]
    AsyncCancelled,
}

impl HandlerError {
    #[inline]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    #[inline]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    #[inline]
    pub fn status(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Status {
            status,
            reason: reason.into(),
        }
    }

    #[inline]
    pub(crate) fn unresolved_bean(name: impl Into<String>) -> Self {
        Self::UnresolvedBean { name: name.into() }
    }
}

/// What a handler produced. Written into the response during result processing.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// The handler wrote the response itself (or there is nothing to write).
    Empty,
    Text(String),
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        body: Vec<u8>,
    },
    Status(StatusCode),
}

impl HandlerOutput {
    pub fn write_to(self, response: &mut Response) {
        match self {
            HandlerOutput::Empty => {}
            HandlerOutput::Text(text) => {
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                response.set_body(text.into_bytes());
            }
            HandlerOutput::Json(value) => {
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response.set_body(value.to_string().into_bytes());
            }
            HandlerOutput::Bytes { content_type, body } => {
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response.set_body(body);
            }
            HandlerOutput::Status(status) => response.set_status(status),
        }
    }
}

/// Declared routing metadata for a controller type or one of its methods.
///
/// A `RouteSpec` is unparsed: patterns and conditions are plain strings until a
/// mapping strategy turns them into its own mapping key, at which point an
/// invalid declaration fails registration.
///
/// # Examples
/// ```
/// use routeline::handler::RouteSpec;
///
/// let spec = RouteSpec::path("/users/{id}").get().produces("application/json");
/// assert_eq!(spec.patterns(), &["/users/{id}".to_string()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    #[serde(default, rename = "paths")]
    pub(crate) patterns: Vec<String>,
    #[serde(default)]
    pub(crate) methods: Vec<String>,
    #[serde(default)]
    pub(crate) params: Vec<String>,
    #[serde(default)]
    pub(crate) headers: Vec<String>,
    #[serde(default)]
    pub(crate) consumes: Vec<String>,
    #[serde(default)]
    pub(crate) produces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
}

impl RouteSpec {
    pub fn new() -> Self {
        RouteSpec::default()
    }

    pub fn path(pattern: impl Into<String>) -> Self {
        RouteSpec::new().with_path(pattern)
    }

    pub fn with_path(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    pub fn get(self) -> Self {
        self.method("GET")
    }

    pub fn post(self) -> Self {
        self.method("POST")
    }

    pub fn put(self) -> Self {
        self.method("PUT")
    }

    pub fn delete(self) -> Self {
        self.method("DELETE")
    }

    pub fn patch(self) -> Self {
        self.method("PATCH")
    }

    pub fn param(mut self, expression: impl Into<String>) -> Self {
        self.params.push(expression.into());
        self
    }

    pub fn header(mut self, expression: impl Into<String>) -> Self {
        self.headers.push(expression.into());
        self
    }

    pub fn consumes(mut self, media_type: impl Into<String>) -> Self {
        self.consumes.push(media_type.into());
        self
    }

    pub fn produces(mut self, media_type: impl Into<String>) -> Self {
        self.produces.push(media_type.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn mapping_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// A method a controller exposes, with its optional route and CORS declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRef {
    name: String,
    route: Option<RouteSpec>,
    cross_origin: Option<CorsConfiguration>,
}

impl MethodRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            route: None,
            cross_origin: None,
        }
    }

    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_cross_origin(mut self, cors: CorsConfiguration) -> Self {
        self.cross_origin = Some(cors);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(&self) -> Option<&RouteSpec> {
        self.route.as_ref()
    }

    pub fn cross_origin(&self) -> Option<&CorsConfiguration> {
        self.cross_origin.as_ref()
    }
}

/// A type whose methods are exposed as request handlers.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Fully qualified or simple type name, used in diagnostics and default mapping names.
    fn type_name(&self) -> &str;

    /// Route declared on the type, combined with every method-level route.
    fn type_mapping(&self) -> Option<RouteSpec> {
        None
    }

    /// CORS declared on the type, combined with every method-level declaration.
    fn type_cross_origin(&self) -> Option<CorsConfiguration> {
        None
    }

    /// All methods of the type. Methods without a route are ignored by mapping.
    fn methods(&self) -> Vec<MethodRef>;

    async fn invoke(
        &self,
        method: &MethodRef,
        exchange: &mut Exchange,
    ) -> Result<HandlerOutput, HandlerError>;

    fn last_modified(&self, _method: &MethodRef, _exchange: &Exchange) -> Option<DateTime<Utc>> {
        None
    }
}

/// Turns bean names into controller instances.
pub trait BeanResolver: Send + Sync {
    fn resolve_bean(&self, name: &str) -> Result<SharedController, BeanRegistryError>;

    /// Names of all beans that may be scanned for handler methods.
    fn bean_names(&self) -> Vec<String>;
}

/// A handler bean, either a live instance or a name resolved on demand.
#[derive(Clone)]
pub enum HandlerRef {
    Instance(SharedController),
    Named(String),
}

impl HandlerRef {
    fn identity(&self) -> usize {
        match self {
            HandlerRef::Instance(controller) => Arc::as_ptr(controller) as *const () as usize,
            HandlerRef::Named(_) => 0,
        }
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HandlerRef::Instance(a), HandlerRef::Instance(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (HandlerRef::Named(a), HandlerRef::Named(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for HandlerRef {}

impl Hash for HandlerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            HandlerRef::Instance(_) => {
                0u8.hash(state);
                self.identity().hash(state);
            }
            HandlerRef::Named(name) => {
                1u8.hash(state);
                name.hash(state);
            }
        }
    }
}

impl Debug for HandlerRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerRef::Instance(controller) => {
                write!(f, "Instance({}@{:x})", controller.type_name(), self.identity())
            }
            HandlerRef::Named(name) => write!(f, "Named({})", name),
        }
    }
}

/// A controller bean paired with one of its methods.
///
/// Two handler methods are equal when they refer to the same bean (the same
/// instance, or the same bean name) and the same method name.
#[derive(Clone, Debug)]
pub struct HandlerMethod {
    bean: HandlerRef,
    bean_type: String,
    method: MethodRef,
    resolved_from: Option<Box<HandlerMethod>>,
}

impl HandlerMethod {
    pub fn new(controller: SharedController, method: MethodRef) -> Self {
        let bean_type = controller.type_name().to_string();
        Self {
            bean: HandlerRef::Instance(controller),
            bean_type,
            method,
            resolved_from: None,
        }
    }

    pub fn named(bean_name: impl Into<String>, bean_type: impl Into<String>, method: MethodRef) -> Self {
        Self {
            bean: HandlerRef::Named(bean_name.into()),
            bean_type: bean_type.into(),
            method,
            resolved_from: None,
        }
    }

    pub fn bean(&self) -> &HandlerRef {
        &self.bean
    }

    pub fn bean_type(&self) -> &str {
        &self.bean_type
    }

    /// The part of the type name after the last `::` or `.`.
    pub fn short_type_name(&self) -> &str {
        self.bean_type
            .rsplit(|c: char| c == ':' || c == '.')
            .next()
            .unwrap_or(&self.bean_type)
    }

    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    /// The handler method this one was resolved from, if it started out named.
    pub fn resolved_from(&self) -> Option<&HandlerMethod> {
        self.resolved_from.as_deref()
    }

    /// Resolves a named bean into an instance; instance handlers are returned as-is.
    pub fn create_with_resolved_bean(
        &self,
        resolver: &dyn BeanResolver,
    ) -> Result<HandlerMethod, BeanRegistryError> {
        match &self.bean {
            HandlerRef::Instance(_) => Ok(self.clone()),
            HandlerRef::Named(name) => {
                let controller = resolver.resolve_bean(name)?;
                Ok(HandlerMethod {
                    bean: HandlerRef::Instance(controller),
                    bean_type: self.bean_type.clone(),
                    method: self.method.clone(),
                    resolved_from: Some(Box::new(self.clone())),
                })
            }
        }
    }

    pub async fn invoke(&self, exchange: &mut Exchange) -> Result<HandlerOutput, HandlerError> {
        match &self.bean {
            HandlerRef::Instance(controller) => controller.invoke(&self.method, exchange).await,
            HandlerRef::Named(name) => Err(HandlerError::unresolved_bean(name)),
        }
    }

    pub fn last_modified(&self, exchange: &Exchange) -> Option<DateTime<Utc>> {
        match &self.bean {
            HandlerRef::Instance(controller) => controller.last_modified(&self.method, exchange),
            HandlerRef::Named(_) => None,
        }
    }
}

impl PartialEq for HandlerMethod {
    fn eq(&self, other: &Self) -> bool {
        self.bean == other.bean && self.method.name == other.method.name
    }
}

impl Eq for HandlerMethod {}

impl Hash for HandlerMethod {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bean.hash(state);
        self.method.name.hash(state);
    }
}

impl Display for HandlerMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.bean_type, self.method.name)
    }
}

/// A handler that serves the whole request itself, without a controller method.
#[async_trait]
pub trait HttpRequestHandler: Send + Sync {
    async fn handle_request(&self, exchange: &mut Exchange) -> Result<(), HandlerError>;

    fn last_modified(&self, _exchange: &Exchange) -> Option<DateTime<Utc>> {
        None
    }

    fn name(&self) -> &str;
}

/// An [`HttpRequestHandler`] backed by a closure returning a boxed future.
///
/// # Examples
/// ```
/// use routeline::exchange::Exchange;
/// use routeline::handler::{FnRequestHandler, HandlerError};
///
/// let handler = FnRequestHandler::new("health", |exchange: &mut Exchange| {
///     Box::pin(async move {
///         exchange.response_mut().set_body("ok");
///         Ok::<_, HandlerError>(())
///     })
/// });
/// ```
pub struct FnRequestHandler<F> {
    name: String,
    function: F,
}

impl<F> FnRequestHandler<F>
where
    F: for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, Result<(), HandlerError>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, function: F) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }
}

#[async_trait]
impl<F> HttpRequestHandler for FnRequestHandler<F>
where
    F: for<'a> Fn(&'a mut Exchange) -> BoxFuture<'a, Result<(), HandlerError>> + Send + Sync,
{
    async fn handle_request(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        (self.function)(exchange).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// What a handler mapping resolves a request to.
#[derive(Clone)]
pub enum Handler {
    Method(HandlerMethod),
    Request(Arc<dyn HttpRequestHandler>),
}

impl Handler {
    pub fn as_handler_method(&self) -> Option<&HandlerMethod> {
        match self {
            Handler::Method(handler_method) => Some(handler_method),
            Handler::Request(_) => None,
        }
    }
}

impl Display for Handler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Method(handler_method) => Display::fmt(handler_method, f),
            Handler::Request(handler) => write!(f, "{}", handler.name()),
        }
    }
}

impl Debug for Handler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Method(handler_method) => write!(f, "Method({})", handler_method),
            Handler::Request(handler) => write!(f, "Request({})", handler.name()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handler::registry::BeanRegistry;

    /// Controller used across the crate's tests. Every method echoes its name.
    pub(crate) struct EchoController {
        type_name: String,
        type_mapping: Option<RouteSpec>,
        methods: Vec<MethodRef>,
    }

    impl EchoController {
        pub(crate) fn new(type_name: &str, methods: Vec<MethodRef>) -> Self {
            Self {
                type_name: type_name.to_string(),
                type_mapping: None,
                methods,
            }
        }

        pub(crate) fn with_type_mapping(mut self, spec: RouteSpec) -> Self {
            self.type_mapping = Some(spec);
            self
        }
    }

    #[async_trait]
    impl Controller for EchoController {
        fn type_name(&self) -> &str {
            &self.type_name
        }

        fn type_mapping(&self) -> Option<RouteSpec> {
            self.type_mapping.clone()
        }

        fn methods(&self) -> Vec<MethodRef> {
            self.methods.clone()
        }

        async fn invoke(
            &self,
            method: &MethodRef,
            _exchange: &mut Exchange,
        ) -> Result<HandlerOutput, HandlerError> {
            if method.name() == "fail" {
                return Err(HandlerError::failed("boom"));
            }
            Ok(HandlerOutput::Text(method.name().to_string()))
        }
    }

    #[test]
    fn test_handler_method_equality() {
        let controller: SharedController =
            Arc::new(EchoController::new("UserController", vec![]));
        let other: SharedController = Arc::new(EchoController::new("UserController", vec![]));

        let list = HandlerMethod::new(controller.clone(), MethodRef::new("list"));
        let list_again = HandlerMethod::new(controller.clone(), MethodRef::new("list"));
        let create = HandlerMethod::new(controller, MethodRef::new("create"));
        let list_other_instance = HandlerMethod::new(other, MethodRef::new("list"));

        assert_eq!(list, list_again);
        assert_ne!(list, create);
        assert_ne!(list, list_other_instance);

        let named = HandlerMethod::named("userController", "UserController", MethodRef::new("list"));
        let named_again =
            HandlerMethod::named("userController", "UserController", MethodRef::new("list"));
        assert_eq!(named, named_again);
        assert_ne!(named, list);
    }

    #[test]
    fn test_create_with_resolved_bean() {
        let registry = BeanRegistry::new();
        registry
            .register_bean("userController", EchoController::new("app::UserController", vec![]))
            .unwrap();

        let named =
            HandlerMethod::named("userController", "app::UserController", MethodRef::new("list"));
        let resolved = named.create_with_resolved_bean(&registry).unwrap();

        assert!(matches!(resolved.bean(), HandlerRef::Instance(_)));
        assert_eq!(resolved.resolved_from(), Some(&named));
        assert_eq!(resolved.short_type_name(), "UserController");

        let missing = HandlerMethod::named("nope", "Nope", MethodRef::new("list"));
        assert!(missing.create_with_resolved_bean(&registry).is_err());
    }

    #[tokio::test]
    async fn test_invoke_named_bean_fails() {
        let named = HandlerMethod::named("userController", "UserController", MethodRef::new("list"));
        let mut exchange = Exchange::builder().build().unwrap();
        let result = named.invoke(&mut exchange).await;
        assert!(matches!(result, Err(HandlerError::UnresolvedBean { .. })));
    }

    #[test]
    fn test_output_write_to() {
        let mut response = Response::default();
        HandlerOutput::Json(serde_json::json!({"id": 1})).write_to(&mut response);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.body(), Some(br#"{"id":1}"#.as_slice()));

        HandlerOutput::Status(StatusCode::CREATED).write_to(&mut response);
        assert_eq!(response.status(), StatusCode::CREATED);
    }
}
