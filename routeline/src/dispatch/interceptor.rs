use crate::dispatch::DispatchError;
use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Hooks around handler invocation.
///
/// # Behavior
/// `pre_handle` runs in registration order and may stop the dispatch by
/// returning `Ok(false)`, in which case the interceptor is expected to have
/// written the response. `post_handle` and `after_completion` run in reverse
/// order. `after_completion` runs exactly once per dispatch, whatever the
/// outcome, and its failures are logged rather than returned.
pub trait HandlerInterceptor: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn pre_handle(&self, _exchange: &mut Exchange, _handler: &Handler) -> Result<bool, HandlerError> {
        Ok(true)
    }

    fn post_handle(&self, _exchange: &mut Exchange, _handler: &Handler) -> Result<(), HandlerError> {
        Ok(())
    }

    /// `handler` is `None` when routing found nothing. `error` is the fault
    /// left over after exception resolution, if any.
    fn after_completion(
        &self,
        _exchange: &mut Exchange,
        _handler: Option<&Handler>,
        _error: Option<&DispatchError>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called instead of `post_handle` when the handler started asynchronous processing.
    fn after_concurrent_handling_started(&self, _exchange: &mut Exchange, _handler: &Handler) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The dispatcher's interceptors, in registration order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn HandlerInterceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn HandlerInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Visits every interceptor in `direction` until the visitor breaks.
    ///
    /// The visitor receives the interceptor's registration index.
    pub fn traverse<B>(
        &self,
        direction: Direction,
        mut visit: impl FnMut(usize, &dyn HandlerInterceptor) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let mut indexed = self.interceptors.iter().enumerate();
        match direction {
            Direction::Forward => {
                indexed.try_for_each(|(index, interceptor)| visit(index, interceptor.as_ref()))
            }
            Direction::Reverse => indexed
                .rev()
                .try_for_each(|(index, interceptor)| visit(index, interceptor.as_ref())),
        }
    }

    /// # Returns
    /// `Ok(false)` as soon as one interceptor stops the dispatch; the rest are skipped.
    pub fn apply_pre_handle(&self, exchange: &mut Exchange, handler: &Handler) -> Result<bool, HandlerError> {
        let flow = self.traverse(Direction::Forward, |_, interceptor| {
            match interceptor.pre_handle(exchange, handler) {
                Ok(true) => ControlFlow::Continue(()),
                Ok(false) => {
                    log::debug!("Dispatch of {} stopped by {}", handler, interceptor.name());
                    ControlFlow::Break(Ok(false))
                }
                Err(error) => ControlFlow::Break(Err(error)),
            }
        });
        match flow {
            ControlFlow::Continue(()) => Ok(true),
            ControlFlow::Break(result) => result,
        }
    }

    pub fn apply_post_handle(&self, exchange: &mut Exchange, handler: &Handler) -> Result<(), HandlerError> {
        let flow = self.traverse(Direction::Reverse, |_, interceptor| {
            match interceptor.post_handle(exchange, handler) {
                Ok(()) => ControlFlow::Continue(()),
                Err(error) => ControlFlow::Break(error),
            }
        });
        match flow {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(error) => Err(error),
        }
    }

    pub fn trigger_after_completion(
        &self,
        exchange: &mut Exchange,
        handler: Option<&Handler>,
        error: Option<&DispatchError>,
    ) {
        let _ = self.traverse::<()>(Direction::Reverse, |_, interceptor| {
            if let Err(failure) = interceptor.after_completion(exchange, handler, error) {
                log::warn!(
                    "Completion hook of {} failed for exchange {}: {}",
                    interceptor.name(),
                    exchange.uuid(),
                    failure
                );
            }
            ControlFlow::Continue(())
        });
    }

    pub fn apply_after_concurrent_handling_started(&self, exchange: &mut Exchange, handler: &Handler) {
        let _ = self.traverse::<()>(Direction::Reverse, |_, interceptor| {
            interceptor.after_concurrent_handling_started(exchange, handler);
            ControlFlow::Continue(())
        });
    }
}
