pub mod adapter;
pub mod deferred;
pub mod exception;
pub mod interceptor;
pub mod multipart;

use crate::config::DispatcherConfig;
use crate::dispatch::adapter::{HandlerAdapter, HandlerMethodAdapter, RequestHandlerAdapter};
use crate::dispatch::deferred::{DeferredOutcome, SuspendedDispatch};
use crate::dispatch::exception::{ExceptionResolver, StatusExceptionResolver};
use crate::dispatch::interceptor::{HandlerInterceptor, InterceptorChain};
use crate::dispatch::multipart::MultipartResolver;
use crate::exchange::Exchange;
use crate::exchange::attributes::names;
use crate::handler::{Handler, HandlerError, HandlerOutput};
use crate::logger::{Component, LogEntry, PAGE_NOT_FOUND_TARGET};
use crate::mapping::{HandlerMapping, MappingError};
use crate::status::DispatchPhase;
use http::{Method, StatusCode};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Faults raised while dispatching an exchange.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("No adapter for handler '{handler}'. Register an adapter that supports it.")]
    NoAdapter { handler: String },

    #[error("Dispatch was cancelled before it completed.")]
    Cancelled,
}

impl DispatchError {
    #[inline]
    pub(crate) fn no_adapter(handler: &Handler) -> Self {
        Self::NoAdapter {
            handler: handler.to_string(),
        }
    }
}

/// A fault no exception resolver handled, with the exchange it happened on.
///
/// Completion hooks have already run by the time a failure is returned.
pub struct DispatchFailure {
    error: DispatchError,
    exchange: Exchange,
}

impl DispatchFailure {
    pub fn error(&self) -> &DispatchError {
        &self.error
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn into_parts(self) -> (DispatchError, Exchange) {
        (self.error, self.exchange)
    }
}

impl Debug for DispatchFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchFailure")
            .field("error", &self.error)
            .field("exchange", self.exchange.uuid())
            .finish()
    }
}

impl Display for DispatchFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatch of exchange {} failed: {}", self.exchange.uuid(), self.error)
    }
}

impl std::error::Error for DispatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// How a dispatch ended.
pub enum Dispatched {
    /// The pipeline ran to completion; the response is ready.
    Completed(Exchange),
    /// The handler started asynchronous processing. Resume or cancel the
    /// suspended dispatch to finish the pipeline.
    Suspended(SuspendedDispatch),
}

impl Dispatched {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Dispatched::Suspended(_))
    }

    pub fn exchange(&self) -> &Exchange {
        match self {
            Dispatched::Completed(exchange) => exchange,
            Dispatched::Suspended(suspended) => suspended.exchange(),
        }
    }
}

struct DispatcherInner {
    handler_mappings: Vec<Arc<dyn HandlerMapping>>,
    adapters: Vec<Arc<dyn HandlerAdapter>>,
    interceptors: InterceptorChain,
    exception_resolvers: Vec<Arc<dyn ExceptionResolver>>,
    multipart_resolver: Option<Arc<dyn MultipartResolver>>,
    config: DispatcherConfig,
}

impl DispatcherInner {
    /// Asks each handler mapping in order; the first one with a handler wins.
    fn handler_for(&self, exchange: &mut Exchange) -> Result<Option<Handler>, MappingError> {
        for mapping in &self.handler_mappings {
            if let Some(handler) = mapping.get_handler(exchange)? {
                log::trace!(
                    "Exchange {} mapped to {} by {}",
                    exchange.uuid(),
                    handler,
                    mapping.name()
                );
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    fn adapter_for(&self, handler: &Handler) -> Result<Arc<dyn HandlerAdapter>, DispatchError> {
        self.adapters
            .iter()
            .find(|adapter| adapter.supports(handler))
            .cloned()
            .ok_or_else(|| DispatchError::no_adapter(handler))
    }
}

/// Routes exchanges to handlers and drives them through the interceptor,
/// adapter and exception-resolution pipeline.
///
/// # Behavior
/// The pipeline records every [`DispatchPhase`] it enters on the exchange:
///
/// 1. `START`, then `MULTIPART_CHECK` if a multipart resolver is set.
/// 2. `ROUTE_LOOKUP` asks each handler mapping in registration order. A miss
///    enters `NO_HANDLER` and writes a 404, or raises `NoHandlerFound` when
///    configured to.
/// 3. `ADAPTER_LOOKUP` picks the first adapter supporting the handler.
/// 4. `CACHE_CHECK` for `GET`/`HEAD` may end the dispatch with `NOT_MODIFIED`.
/// 5. `PRE_HANDLE`, `INVOKE`, `POST_HANDLE`, `RESULT_PROCESSING`.
/// 6. Any fault enters `EXCEPTION_HANDLING` and is offered to the exception
///    resolvers.
/// 7. `COMPLETION` runs every interceptor's completion hook in reverse order,
///    exactly once, including when the dispatch future is dropped.
///
/// If the handler calls [`Exchange::start_async`] the dispatch enters
/// `ASYNC_STARTED` and is returned suspended instead.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// # Errors
    /// A [`DispatchFailure`] when a fault was not handled by any exception
    /// resolver. Completion hooks have run in either case.
    pub async fn dispatch(&self, exchange: Exchange) -> Result<Dispatched, DispatchFailure> {
        let mut guard = DispatchGuard::new(Arc::clone(&self.inner), exchange);
        let step = guard.run().await;
        match step {
            Ok(Step::Suspended(receiver)) => {
                Ok(Dispatched::Suspended(SuspendedDispatch::new(guard, receiver)))
            }
            Ok(Step::Done) => guard.conclude(Ok(())).map(Dispatched::Completed),
            Err(error) => guard.conclude(Err(error)).map(Dispatched::Completed),
        }
    }
}

pub struct DispatcherBuilder {
    handler_mappings: Vec<Arc<dyn HandlerMapping>>,
    adapters: Vec<Arc<dyn HandlerAdapter>>,
    interceptors: Vec<Arc<dyn HandlerInterceptor>>,
    exception_resolvers: Vec<Arc<dyn ExceptionResolver>>,
    multipart_resolver: Option<Arc<dyn MultipartResolver>>,
    config: DispatcherConfig,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        DispatcherBuilder::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            handler_mappings: Vec::new(),
            adapters: Vec::new(),
            interceptors: Vec::new(),
            exception_resolvers: Vec::new(),
            multipart_resolver: None,
            config: DispatcherConfig::default(),
        }
    }

    pub fn handler_mapping(self, mapping: impl HandlerMapping + 'static) -> Self {
        self.handler_mapping_shared(Arc::new(mapping))
    }

    /// Adds a mapping that stays reachable elsewhere, e.g. for registering
    /// handler methods at runtime.
    pub fn handler_mapping_shared(mut self, mapping: Arc<dyn HandlerMapping>) -> Self {
        self.handler_mappings.push(mapping);
        self
    }

    pub fn adapter(mut self, adapter: impl HandlerAdapter + 'static) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    pub fn interceptor(mut self, interceptor: impl HandlerInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn exception_resolver(mut self, resolver: impl ExceptionResolver + 'static) -> Self {
        self.exception_resolvers.push(Arc::new(resolver));
        self
    }

    pub fn multipart_resolver(mut self, resolver: impl MultipartResolver + 'static) -> Self {
        self.multipart_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Without explicit adapters the dispatcher uses [`HandlerMethodAdapter`]
    /// and [`RequestHandlerAdapter`]; without explicit exception resolvers it
    /// uses [`StatusExceptionResolver`].
    pub fn build(mut self) -> Dispatcher {
        if self.adapters.is_empty() {
            self.adapters.push(Arc::new(HandlerMethodAdapter));
            self.adapters.push(Arc::new(RequestHandlerAdapter));
        }
        if self.exception_resolvers.is_empty() {
            self.exception_resolvers.push(Arc::new(StatusExceptionResolver));
        }
        log::debug!(
            "Dispatcher built with {} handler mappings, {} adapters, {} interceptors",
            self.handler_mappings.len(),
            self.adapters.len(),
            self.interceptors.len()
        );
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                handler_mappings: self.handler_mappings,
                adapters: self.adapters,
                interceptors: InterceptorChain::new(self.interceptors),
                exception_resolvers: self.exception_resolvers,
                multipart_resolver: self.multipart_resolver,
                config: self.config,
            }),
        }
    }
}

enum Step {
    Done,
    Suspended(oneshot::Receiver<DeferredOutcome>),
}

/// Owns the exchange for the lifetime of one dispatch.
///
/// Completion runs at most once. If the guard is dropped before completion
/// ran (the dispatch future or a suspended dispatch was dropped) the exchange
/// enters `CANCELLED` and completion runs with `DispatchError::Cancelled`.
pub(crate) struct DispatchGuard {
    inner: Arc<DispatcherInner>,
    exchange: Exchange,
    handler: Option<Handler>,
    multipart_resolved: bool,
    completed: bool,
}

impl DispatchGuard {
    fn new(inner: Arc<DispatcherInner>, exchange: Exchange) -> Self {
        Self {
            inner,
            exchange,
            handler: None,
            multipart_resolved: false,
            completed: false,
        }
    }

    pub(crate) fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub(crate) fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    async fn run(&mut self) -> Result<Step, DispatchError> {
        let inner = Arc::clone(&self.inner);
        self.exchange.enter(DispatchPhase::START);
        log::trace!(
            "Dispatching {} {} as exchange {}",
            self.exchange.method(),
            self.exchange.path(),
            self.exchange.uuid()
        );

        if let Some(resolver) = &inner.multipart_resolver {
            self.exchange.enter(DispatchPhase::MULTIPART_CHECK);
            if resolver.is_multipart(&self.exchange) {
                resolver.resolve_multipart(&mut self.exchange)?;
                self.multipart_resolved = true;
            }
        }

        self.exchange.enter(DispatchPhase::ROUTE_LOOKUP);
        let Some(handler) = inner.handler_for(&mut self.exchange)? else {
            self.no_handler_found()?;
            return Ok(Step::Done);
        };
        self.handler = Some(handler.clone());

        self.exchange.enter(DispatchPhase::ADAPTER_LOOKUP);
        let adapter = inner.adapter_for(&handler)?;

        if [Method::GET, Method::HEAD].contains(self.exchange.method()) {
            self.exchange.enter(DispatchPhase::CACHE_CHECK);
            let last_modified = adapter.last_modified(&self.exchange, &handler);
            if self.exchange.check_not_modified(last_modified) {
                self.exchange.enter(DispatchPhase::NOT_MODIFIED);
                log::debug!("Exchange {} not modified", self.exchange.uuid());
                return Ok(Step::Done);
            }
        }

        self.exchange.enter(DispatchPhase::PRE_HANDLE);
        if !inner.interceptors.apply_pre_handle(&mut self.exchange, &handler)? {
            return Ok(Step::Done);
        }

        self.exchange.enter(DispatchPhase::INVOKE);
        let output = adapter.handle(&mut self.exchange, &handler).await?;

        if let Some(receiver) = self.exchange.take_deferred() {
            self.exchange.enter(DispatchPhase::ASYNC_STARTED);
            inner
                .interceptors
                .apply_after_concurrent_handling_started(&mut self.exchange, &handler);
            log::debug!("Exchange {} suspended for async processing", self.exchange.uuid());
            return Ok(Step::Suspended(receiver));
        }

        self.apply_output(output)?;
        Ok(Step::Done)
    }

    fn no_handler_found(&mut self) -> Result<(), DispatchError> {
        self.exchange.enter(DispatchPhase::NO_HANDLER);
        let method = self.exchange.method().clone();
        let path = self.exchange.path().to_string();
        log::warn!(
            target: PAGE_NOT_FOUND_TARGET,
            "{}",
            LogEntry::new(Component::Dispatcher, format!("No mapping for {} {}", method, path))
                .with_level(log::Level::Warn)
                .with_exchange(self.exchange.uuid())
                .to_json()
        );
        if self.inner.config.throw_exception_if_no_handler_found {
            return Err(MappingError::no_handler_found(method, path).into());
        }
        self.exchange
            .response_mut()
            .send_error(StatusCode::NOT_FOUND, "Not Found");
        Ok(())
    }

    /// Post-handle in reverse order, then writes the handler's output.
    pub(crate) fn apply_output(&mut self, output: HandlerOutput) -> Result<(), DispatchError> {
        if let Some(handler) = &self.handler {
            self.exchange.enter(DispatchPhase::POST_HANDLE);
            self.inner
                .interceptors
                .apply_post_handle(&mut self.exchange, handler)?;
        }
        self.exchange.enter(DispatchPhase::RESULT_PROCESSING);
        output.write_to(self.exchange.response_mut());
        Ok(())
    }

    /// Offers the fault to each exception resolver in turn.
    ///
    /// # Returns
    /// `Ok(())` if one of them wrote a response, otherwise the fault itself.
    fn process_error(&mut self, error: DispatchError) -> Result<(), DispatchError> {
        self.exchange.enter(DispatchPhase::EXCEPTION_HANDLING);
        self.exchange.response_mut().take_body();

        let handler = self.handler.as_ref();
        let exchange = &mut self.exchange;
        let resolved = self
            .inner
            .exception_resolvers
            .iter()
            .find(|resolver| resolver.resolve(exchange, handler, &error));
        match resolved {
            Some(resolver) => {
                log::debug!(
                    "Exchange {} fault resolved by {}: {}",
                    self.exchange.uuid(),
                    resolver.name(),
                    error
                );
                self.exchange.enter(DispatchPhase::RESULT_PROCESSING);
                self.exchange
                    .attributes_mut()
                    .insert::<String>(names::EXCEPTION, error.to_string());
                Ok(())
            }
            None => Err(error),
        }
    }

    /// Resolves a pending fault, runs completion and hands the exchange back.
    pub(crate) fn conclude(mut self, result: Result<(), DispatchError>) -> Result<Exchange, DispatchFailure> {
        match result.or_else(|error| self.process_error(error)) {
            Ok(()) => {
                self.complete(None);
                Ok(self.finish())
            }
            Err(error) => {
                log::error!(
                    "{}",
                    LogEntry::new(Component::Dispatcher, format!("Unresolved dispatch fault: {}", error))
                        .with_level(log::Level::Error)
                        .with_exchange(self.exchange.uuid())
                        .to_json()
                );
                self.complete(Some(&error));
                let exchange = self.finish();
                Err(DispatchFailure { error, exchange })
            }
        }
    }

    fn complete(&mut self, error: Option<&DispatchError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.exchange.enter(DispatchPhase::COMPLETION);
        self.inner
            .interceptors
            .trigger_after_completion(&mut self.exchange, self.handler.as_ref(), error);
        if self.multipart_resolved {
            if let Some(resolver) = &self.inner.multipart_resolver {
                resolver.cleanup_multipart(&mut self.exchange);
            }
        }
    }

    pub(crate) fn cancel(&mut self) {
        if self.completed {
            return;
        }
        self.exchange.enter(DispatchPhase::CANCELLED);
        log::warn!("Dispatch of exchange {} cancelled", self.exchange.uuid());
        self.complete(Some(&DispatchError::Cancelled));
    }

    /// Takes the exchange out. Completion must have run.
    pub(crate) fn finish(mut self) -> Exchange {
        debug_assert!(self.completed);
        std::mem::take(&mut self.exchange)
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MappingConfig;
    use crate::dispatch::deferred::DeferredResult;
    use crate::dispatch::interceptor::tests::RecordingInterceptor;
    use crate::dispatch::multipart::{MULTIPART_BOUNDARY, StandardMultipartResolver};
    use crate::handler::tests::EchoController;
    use crate::handler::{
        FnRequestHandler, HandlerMethod, HandlerRef, HttpRequestHandler, MethodRef, RouteSpec,
    };
    use crate::router::simple::SimpleUrlHandlerMapping;
    use crate::router::strategy::RequestMappingStrategy;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn request(method: Method, uri: &str) -> Exchange {
        Exchange::builder().method(method).uri(uri).build().unwrap()
    }

    fn order_mapping() -> impl HandlerMapping {
        let controller = EchoController::new(
            "app::OrderController",
            vec![
                MethodRef::new("list").with_route(RouteSpec::new().get()),
                MethodRef::new("fail").with_route(RouteSpec::path("/fail").get()),
                MethodRef::new("byId").with_route(RouteSpec::path("/{id}").get()),
                MethodRef::new("byName").with_route(RouteSpec::path("/{name}").get()),
            ],
        )
        .with_type_mapping(RouteSpec::path("/orders"));
        let mapping = RequestMappingStrategy::handler_mapping(MappingConfig::default());
        mapping
            .detect_handler_methods(HandlerRef::Instance(Arc::new(controller)))
            .unwrap();
        mapping
    }

    fn dispatcher(journal: &Journal) -> Dispatcher {
        Dispatcher::builder()
            .handler_mapping(order_mapping())
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .interceptor(RecordingInterceptor::new("b", journal.clone()))
            .build()
    }

    fn completed(dispatched: Dispatched) -> Exchange {
        match dispatched {
            Dispatched::Completed(exchange) => exchange,
            Dispatched::Suspended(_) => panic!("dispatch was suspended"),
        }
    }

    fn failed<T>(result: Result<T, DispatchFailure>) -> DispatchFailure {
        match result {
            Err(failure) => failure,
            Ok(_) => panic!("dispatch should fail"),
        }
    }

    fn simple_dispatcher(path: &str, handler: Arc<dyn HttpRequestHandler>, journal: &Journal) -> Dispatcher {
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        mapping.register_handler(path, handler).unwrap();
        Dispatcher::builder()
            .handler_mapping(mapping)
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .build()
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let journal = journal();
        let dispatcher = dispatcher(&journal);

        let exchange = completed(dispatcher.dispatch(request(Method::GET, "/orders")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::OK);
        assert_eq!(exchange.response().body(), Some(b"list".as_slice()));
        assert_eq!(
            *journal.lock(),
            vec!["a.pre", "b.pre", "b.post", "a.post", "b.completion", "a.completion"]
        );
        assert!(exchange.phases().all_flags(
            DispatchPhase::START
                | DispatchPhase::ROUTE_LOOKUP
                | DispatchPhase::ADAPTER_LOOKUP
                | DispatchPhase::CACHE_CHECK
                | DispatchPhase::PRE_HANDLE
                | DispatchPhase::INVOKE
                | DispatchPhase::POST_HANDLE
                | DispatchPhase::RESULT_PROCESSING
                | DispatchPhase::COMPLETION
        ));
        assert!(!exchange.phases().is_error());
        let best = exchange
            .attributes()
            .get::<HandlerMethod>(names::BEST_MATCHING_HANDLER)
            .unwrap();
        assert_eq!(best.to_string(), "app::OrderController#list");
    }

    #[tokio::test]
    async fn test_no_handler_writes_not_found() {
        let journal = journal();
        let dispatcher = dispatcher(&journal);

        let exchange = completed(dispatcher.dispatch(request(Method::GET, "/missing")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::NOT_FOUND);
        assert!(exchange.phases().all_flags(DispatchPhase::NO_HANDLER | DispatchPhase::COMPLETION));
        assert!(!exchange.phases().was_invoked());
        assert_eq!(*journal.lock(), vec!["b.completion", "a.completion"]);
    }

    #[tokio::test]
    async fn test_no_handler_raised_when_configured() {
        let journal = journal();
        let dispatcher = Dispatcher::builder()
            .handler_mapping(order_mapping())
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .config(DispatcherConfig {
                throw_exception_if_no_handler_found: true,
                ..DispatcherConfig::default()
            })
            .build();

        let exchange = completed(dispatcher.dispatch(request(Method::GET, "/missing")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::NOT_FOUND);
        assert!(exchange.phases().all_flags(
            DispatchPhase::NO_HANDLER | DispatchPhase::EXCEPTION_HANDLING | DispatchPhase::COMPLETION
        ));
        let exception = exchange.attributes().get::<String>(names::EXCEPTION).unwrap();
        assert!(exception.starts_with("No handler found for GET /missing"));
        assert_eq!(*journal.lock(), vec!["a.completion"]);
    }

    #[tokio::test]
    async fn test_pre_handle_stop_skips_invocation() {
        let journal = journal();
        let dispatcher = Dispatcher::builder()
            .handler_mapping(order_mapping())
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .interceptor(RecordingInterceptor::new("b", journal.clone()).stopping())
            .interceptor(RecordingInterceptor::new("c", journal.clone()))
            .build();

        let exchange = completed(dispatcher.dispatch(request(Method::GET, "/orders")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::UNAUTHORIZED);
        assert!(!exchange.phases().was_invoked());
        assert_eq!(
            *journal.lock(),
            vec!["a.pre", "b.pre", "c.completion", "b.completion", "a.completion"]
        );
    }

    #[tokio::test]
    async fn test_unresolved_handler_failure() {
        let journal = journal();
        let dispatcher = dispatcher(&journal);

        let failure = failed(dispatcher.dispatch(request(Method::GET, "/orders/fail")).await);
        assert!(matches!(failure.error(), DispatchError::Handler(HandlerError::Failed(_))));
        let (_, exchange) = failure.into_parts();
        assert!(exchange.phases().all_flags(
            DispatchPhase::INVOKE | DispatchPhase::EXCEPTION_HANDLING | DispatchPhase::COMPLETION
        ));
        assert!(exchange.phases().all_flags_clear(DispatchPhase::POST_HANDLE));
        assert_eq!(
            *journal.lock(),
            vec!["a.pre", "b.pre", "b.completion!", "a.completion!"]
        );
    }

    #[tokio::test]
    async fn test_status_error_is_resolved() {
        let journal = journal();
        let handler = Arc::new(FnRequestHandler::new("conflict", |_: &mut Exchange| {
            Box::pin(async { Err::<(), _>(HandlerError::status(StatusCode::CONFLICT, "already exists")) })
        }));
        let dispatcher = simple_dispatcher("/things", handler, &journal);

        let exchange = completed(dispatcher.dispatch(request(Method::POST, "/things")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::CONFLICT);
        assert_eq!(exchange.response().body(), Some(b"already exists".as_slice()));
        assert_eq!(*journal.lock(), vec!["a.pre", "a.completion"]);
    }

    #[tokio::test]
    async fn test_routing_faults_resolved_to_status() {
        let journal = journal();
        let dispatcher = dispatcher(&journal);

        let exchange = completed(dispatcher.dispatch(request(Method::DELETE, "/orders")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(exchange.response().header("allow").is_some_and(|allow| allow.contains("GET")));

        let exchange = completed(dispatcher.dispatch(request(Method::GET, "/orders/42")).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        let exception = exchange.attributes().get::<String>(names::EXCEPTION).unwrap();
        assert!(exception.starts_with("Ambiguous handler methods mapped for '/orders/42'"));
    }

    #[tokio::test]
    async fn test_missing_adapter_is_fatal() {
        let journal = journal();
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        mapping
            .register_handler(
                "/health",
                Arc::new(FnRequestHandler::new("health", |_: &mut Exchange| {
                    Box::pin(async { Ok::<_, HandlerError>(()) })
                })),
            )
            .unwrap();
        let dispatcher = Dispatcher::builder()
            .handler_mapping(mapping)
            .adapter(HandlerMethodAdapter)
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .build();

        let failure = failed(dispatcher.dispatch(request(Method::GET, "/health")).await);
        assert!(matches!(failure.error(), DispatchError::NoAdapter { handler } if handler == "health"));
        assert_eq!(*journal.lock(), vec!["a.completion!"]);
    }

    struct StampedHandler {
        invocations: AtomicUsize,
        last_modified: DateTime<Utc>,
    }

    #[async_trait]
    impl HttpRequestHandler for StampedHandler {
        async fn handle_request(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            exchange.response_mut().set_body("fresh");
            Ok(())
        }

        fn last_modified(&self, _exchange: &Exchange) -> Option<DateTime<Utc>> {
            Some(self.last_modified)
        }

        fn name(&self) -> &str {
            "stamped"
        }
    }

    #[tokio::test]
    async fn test_not_modified_short_circuits() {
        let journal = journal();
        let handler = Arc::new(StampedHandler {
            invocations: AtomicUsize::new(0),
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        });
        let dispatcher = simple_dispatcher("/report", handler.clone(), &journal);

        let cached = Exchange::builder()
            .method(Method::HEAD)
            .uri("/report")
            .header("If-Modified-Since", "Wed, 01 May 2024 12:00:00 GMT")
            .build()
            .unwrap();
        let exchange = completed(dispatcher.dispatch(cached).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::NOT_MODIFIED);
        assert!(exchange.phases().all_flags(DispatchPhase::NOT_MODIFIED | DispatchPhase::COMPLETION));
        assert!(exchange.phases().all_flags_clear(DispatchPhase::PRE_HANDLE | DispatchPhase::INVOKE));
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(*journal.lock(), vec!["a.completion"]);

        let exchange = completed(dispatcher.dispatch(request(Method::GET, "/report")).await.unwrap());
        assert_eq!(exchange.response().body(), Some(b"fresh".as_slice()));
        assert_eq!(
            exchange.response().header("last-modified"),
            Some("Wed, 01 May 2024 12:00:00 GMT")
        );
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 1);
    }

    type Slot = Arc<Mutex<Option<DeferredResult>>>;

    fn async_dispatcher(journal: &Journal, config: DispatcherConfig) -> (Dispatcher, Slot) {
        let slot: Slot = Arc::new(Mutex::new(None));
        let handler_slot = slot.clone();
        let handler = Arc::new(FnRequestHandler::new("deferred", move |exchange: &mut Exchange| {
            let slot = handler_slot.clone();
            Box::pin(async move {
                *slot.lock() = Some(exchange.start_async());
                Ok::<_, HandlerError>(())
            })
        }));
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        mapping.register_handler("/deferred", handler).unwrap();
        let dispatcher = Dispatcher::builder()
            .handler_mapping(mapping)
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .config(config)
            .build();
        (dispatcher, slot)
    }

    fn suspended(dispatched: Dispatched) -> SuspendedDispatch {
        match dispatched {
            Dispatched::Suspended(suspended) => suspended,
            Dispatched::Completed(_) => panic!("dispatch was not suspended"),
        }
    }

    #[tokio::test]
    async fn test_async_dispatch_resumes() {
        let journal = journal();
        let (dispatcher, slot) = async_dispatcher(&journal, DispatcherConfig::default());

        let pending = suspended(dispatcher.dispatch(request(Method::GET, "/deferred")).await.unwrap());
        assert!(pending.exchange().phases().all_flags(DispatchPhase::ASYNC_STARTED));
        assert!(!pending.exchange().phases().is_complete());
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async"]);

        let deferred = slot.lock().take().unwrap();
        tokio::spawn(async move {
            deferred.set_result(HandlerOutput::Text("later".to_string()));
        });

        let exchange = pending.resume().await.unwrap();
        assert_eq!(exchange.response().body(), Some(b"later".as_slice()));
        assert!(exchange.phases().all_flags(DispatchPhase::RESULT_PROCESSING | DispatchPhase::COMPLETION));
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async", "a.post", "a.completion"]);
    }

    #[tokio::test]
    async fn test_async_timeout_resolved_to_unavailable() {
        let journal = journal();
        let (dispatcher, slot) = async_dispatcher(
            &journal,
            DispatcherConfig {
                async_timeout_ms: Some(20),
                ..DispatcherConfig::default()
            },
        );

        let pending = suspended(dispatcher.dispatch(request(Method::GET, "/deferred")).await.unwrap());
        let exchange = pending.resume().await.unwrap();
        assert_eq!(exchange.response().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async", "a.completion"]);

        let deferred = slot.lock().take().unwrap();
        assert!(deferred.is_cancelled());
        assert!(!deferred.set_result(HandlerOutput::Empty));
    }

    #[tokio::test]
    async fn test_async_error_and_explicit_timeout() {
        let journal = journal();
        let (dispatcher, slot) = async_dispatcher(&journal, DispatcherConfig::default());

        let pending = suspended(dispatcher.dispatch(request(Method::GET, "/deferred")).await.unwrap());
        let deferred = slot.lock().take().unwrap();
        assert!(deferred.set_error(HandlerError::bad_request("bad input")));
        let exchange = pending.resume_with_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exchange.response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async", "a.completion"]);
    }

    #[tokio::test]
    async fn test_cancel_and_drop_run_completion_once() {
        let journal = journal();
        let (dispatcher, slot) = async_dispatcher(&journal, DispatcherConfig::default());

        let pending = suspended(dispatcher.dispatch(request(Method::GET, "/deferred")).await.unwrap());
        let exchange = pending.cancel();
        assert!(exchange.phases().all_flags(DispatchPhase::CANCELLED | DispatchPhase::COMPLETION));
        assert!(slot.lock().take().unwrap().is_cancelled());
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async", "a.completion!"]);

        journal.lock().clear();
        let pending = suspended(dispatcher.dispatch(request(Method::GET, "/deferred")).await.unwrap());
        drop(pending);
        assert!(slot.lock().take().unwrap().is_cancelled());
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async", "a.completion!"]);
    }

    #[tokio::test]
    async fn test_dropped_sender_cancels_async_processing() {
        let journal = journal();
        let (dispatcher, slot) = async_dispatcher(&journal, DispatcherConfig::default());

        let pending = suspended(dispatcher.dispatch(request(Method::GET, "/deferred")).await.unwrap());
        drop(slot.lock().take());
        let failure = failed(pending.resume().await);
        assert!(matches!(
            failure.error(),
            DispatchError::Handler(HandlerError::AsyncCancelled)
        ));
        assert_eq!(*journal.lock(), vec!["a.pre", "a.async", "a.completion!"]);
    }

    #[tokio::test]
    async fn test_dropped_dispatch_future_runs_completion() {
        let journal = journal();
        let handler = Arc::new(FnRequestHandler::new("stuck", |_: &mut Exchange| {
            Box::pin(async {
                std::future::pending::<()>().await;
                Ok::<_, HandlerError>(())
            })
        }));
        let dispatcher = simple_dispatcher("/stuck", handler, &journal);

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            dispatcher.dispatch(request(Method::GET, "/stuck")),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(*journal.lock(), vec!["a.pre", "a.completion!"]);
    }

    #[tokio::test]
    async fn test_multipart_resolved_and_cleaned_up() {
        let journal = journal();
        let handler = Arc::new(FnRequestHandler::new("upload", |exchange: &mut Exchange| {
            Box::pin(async move {
                let boundary = exchange
                    .attributes()
                    .get::<String>(MULTIPART_BOUNDARY)
                    .cloned()
                    .unwrap_or_default();
                exchange.response_mut().set_body(boundary);
                Ok::<_, HandlerError>(())
            })
        }));
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        mapping.register_handler("/upload", handler).unwrap();
        let dispatcher = Dispatcher::builder()
            .handler_mapping(mapping)
            .interceptor(RecordingInterceptor::new("a", journal.clone()))
            .multipart_resolver(StandardMultipartResolver)
            .build();

        let upload = Exchange::builder()
            .method(Method::POST)
            .uri("/upload")
            .header("Content-Type", "multipart/form-data; boundary=xyz")
            .build()
            .unwrap();
        let exchange = completed(dispatcher.dispatch(upload).await.unwrap());
        assert_eq!(exchange.response().body(), Some(b"xyz".as_slice()));
        assert!(exchange.phases().all_flags(DispatchPhase::MULTIPART_CHECK));
        assert!(!exchange.attributes().contains::<String>(MULTIPART_BOUNDARY));

        let broken = Exchange::builder()
            .method(Method::POST)
            .uri("/upload")
            .header("Content-Type", "multipart/form-data")
            .build()
            .unwrap();
        let exchange = completed(dispatcher.dispatch(broken).await.unwrap());
        assert_eq!(exchange.response().status(), StatusCode::BAD_REQUEST);
        assert!(!exchange.phases().any_flags(DispatchPhase::ROUTE_LOOKUP));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_dispatch() {
        let journal = journal();
        let dispatcher = dispatcher(&journal);
        let tasks = (0..16)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let exchange = completed(dispatcher.dispatch(request(Method::GET, "/orders")).await.unwrap());
                    exchange.response().status()
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert_eq!(task.await.unwrap(), StatusCode::OK);
        }
        let completions = journal
            .lock()
            .iter()
            .filter(|entry| entry.ends_with(".completion"))
            .count();
        assert_eq!(completions, 32);
    }
}
