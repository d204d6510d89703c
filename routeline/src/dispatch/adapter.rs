use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError, HandlerOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Invokes one kind of [`Handler`] on behalf of the dispatcher.
///
/// The dispatcher uses the first registered adapter whose `supports` returns
/// true. A handler no adapter supports is a configuration error.
#[async_trait]
pub trait HandlerAdapter: Send + Sync {
    fn supports(&self, handler: &Handler) -> bool;

    async fn handle(&self, exchange: &mut Exchange, handler: &Handler) -> Result<HandlerOutput, HandlerError>;

    /// Used for the conditional `GET`/`HEAD` check before invocation.
    fn last_modified(&self, _exchange: &Exchange, _handler: &Handler) -> Option<DateTime<Utc>> {
        None
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter for controller methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandlerMethodAdapter;

#[async_trait]
impl HandlerAdapter for HandlerMethodAdapter {
    fn supports(&self, handler: &Handler) -> bool {
        matches!(handler, Handler::Method(_))
    }

    async fn handle(&self, exchange: &mut Exchange, handler: &Handler) -> Result<HandlerOutput, HandlerError> {
        match handler {
            Handler::Method(handler_method) => handler_method.invoke(exchange).await,
            Handler::Request(_) => Err(HandlerError::failed(format!(
                "{} cannot invoke {}",
                self.name(),
                handler
            ))),
        }
    }

    fn last_modified(&self, exchange: &Exchange, handler: &Handler) -> Option<DateTime<Utc>> {
        handler
            .as_handler_method()
            .and_then(|handler_method| handler_method.last_modified(exchange))
    }

    fn name(&self) -> &str {
        "HandlerMethodAdapter"
    }
}

/// Adapter for [`HttpRequestHandler`](crate::handler::HttpRequestHandler)s,
/// which write the response themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestHandlerAdapter;

#[async_trait]
impl HandlerAdapter for RequestHandlerAdapter {
    fn supports(&self, handler: &Handler) -> bool {
        matches!(handler, Handler::Request(_))
    }

    async fn handle(&self, exchange: &mut Exchange, handler: &Handler) -> Result<HandlerOutput, HandlerError> {
        match handler {
            Handler::Request(request_handler) => {
                request_handler.handle_request(exchange).await?;
                Ok(HandlerOutput::Empty)
            }
            Handler::Method(_) => Err(HandlerError::failed(format!(
                "{} cannot invoke {}",
                self.name(),
                handler
            ))),
        }
    }

    fn last_modified(&self, exchange: &Exchange, handler: &Handler) -> Option<DateTime<Utc>> {
        match handler {
            Handler::Request(request_handler) => request_handler.last_modified(exchange),
            Handler::Method(_) => None,
        }
    }

    fn name(&self) -> &str {
        "RequestHandlerAdapter"
    }
}
