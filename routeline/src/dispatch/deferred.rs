use crate::dispatch::{DispatchFailure, DispatchGuard};
use crate::exchange::Exchange;
use crate::handler::{HandlerError, HandlerOutput};
use std::time::Duration;
use tokio::sync::oneshot;

/// What a deferred handler eventually produces.
pub type DeferredOutcome = Result<HandlerOutput, HandlerError>;

/// The sending half of an asynchronously completed request.
///
/// Obtained from [`Exchange::start_async`]. Completing it wakes the matching
/// [`SuspendedDispatch`]. If the suspended dispatch was already cancelled or
/// timed out, setting a result has no effect and `false` is returned.
#[derive(Debug)]
pub struct DeferredResult {
    sender: oneshot::Sender<DeferredOutcome>,
}

impl DeferredResult {
    pub(crate) fn new(sender: oneshot::Sender<DeferredOutcome>) -> Self {
        Self { sender }
    }

    pub fn set_result(self, output: HandlerOutput) -> bool {
        self.sender.send(Ok(output)).is_ok()
    }

    pub fn set_error(self, error: HandlerError) -> bool {
        self.sender.send(Err(error)).is_ok()
    }

    /// True once nobody is waiting for the result anymore.
    pub fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A dispatch paused after its handler started asynchronous processing.
///
/// # Behavior
/// Pre-handle and invocation have already run. Post-handle, result
/// processing, completion hooks and multipart cleanup are deferred until the
/// dispatch is resumed or cancelled. Dropping a suspended dispatch cancels it,
/// so completion hooks run exactly once on every path.
pub struct SuspendedDispatch {
    guard: DispatchGuard,
    receiver: oneshot::Receiver<DeferredOutcome>,
}

impl SuspendedDispatch {
    pub(crate) fn new(guard: DispatchGuard, receiver: oneshot::Receiver<DeferredOutcome>) -> Self {
        Self { guard, receiver }
    }

    pub fn exchange(&self) -> &Exchange {
        self.guard.exchange()
    }

    /// Waits for the deferred result, bounded by the dispatcher's configured
    /// async timeout if there is one, and finishes the pipeline.
    ///
    /// # Errors
    /// A `DispatchFailure` if the outcome was an error no exception resolver
    /// handled. A timeout raises `HandlerError::AsyncTimeout` and a dropped
    /// `DeferredResult` raises `HandlerError::AsyncCancelled`, both of which go
    /// through the exception resolvers like any other handler error.
    pub async fn resume(self) -> Result<Exchange, DispatchFailure> {
        let timeout = self.guard.config().async_timeout();
        self.resume_within(timeout).await
    }

    /// Like [`resume`](Self::resume) with an explicit timeout.
    pub async fn resume_with_timeout(self, timeout: Duration) -> Result<Exchange, DispatchFailure> {
        self.resume_within(Some(timeout)).await
    }

    async fn resume_within(self, timeout: Option<Duration>) -> Result<Exchange, DispatchFailure> {
        let SuspendedDispatch { mut guard, receiver } = self;
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    log::warn!(
                        "Async result for exchange {} not set within {:?}",
                        guard.exchange().uuid(),
                        timeout
                    );
                    Ok(Err(HandlerError::AsyncTimeout))
                }
            },
            None => receiver.await,
        };
        let outcome = received.unwrap_or(Err(HandlerError::AsyncCancelled));
        log::trace!("Resuming exchange {}", guard.exchange().uuid());

        let result = match outcome {
            Ok(output) => guard.apply_output(output),
            Err(error) => Err(error.into()),
        };
        guard.conclude(result)
    }

    /// Abandons the deferred result. Completion hooks see `DispatchError::Cancelled`.
    pub fn cancel(self) -> Exchange {
        let SuspendedDispatch { mut guard, receiver } = self;
        drop(receiver);
        guard.cancel();
        guard.finish()
    }
}
