//! Concurrent handler-mapping registry with best-match request resolution,
//! and a dispatch pipeline that drives the resolved handler through
//! interceptors, adapters and exception resolvers.

pub mod config;
pub mod dispatch;
pub mod exchange;
pub mod handler;
pub mod logger;
pub mod mapping;
pub mod router;
pub mod status;

pub use dispatch::{DispatchError, DispatchFailure, Dispatched, Dispatcher};
pub use exchange::Exchange;
pub use handler::{Controller, Handler, HandlerError, HandlerMethod, HandlerOutput};
pub use mapping::{HandlerMapping, MappingError};
pub use router::strategy::RequestMappingHandlerMapping;
