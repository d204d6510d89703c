use crate::dispatch::DispatchError;
use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError};
use crate::mapping::MappingError;
use http::header::{ACCEPT, ALLOW};
use http::{HeaderValue, StatusCode};

/// Turns a dispatch fault into a response.
///
/// Resolvers are tried in registration order. The first one returning `true`
/// has written the response and the fault counts as handled.
pub trait ExceptionResolver: Send + Sync {
    fn resolve(&self, exchange: &mut Exchange, handler: Option<&Handler>, error: &DispatchError) -> bool;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Maps routing faults and status-carrying handler errors to error responses.
///
/// # Behavior
/// | fault | status |
/// |---|---|
/// | no handler found | 404 |
/// | method not allowed | 405, with `Allow` |
/// | not acceptable | 406 |
/// | unsupported media type | 415, with `Accept` |
/// | unsatisfied params, bad request | 400 |
/// | `HandlerError::Status` | its own status |
/// | async timeout | 503 |
/// | ambiguous handler, other mapping faults | 500 |
///
/// Server faults other than `HandlerError::Status` get only the status reason
/// phrase as body. Plain handler failures, cancellation and missing adapters
/// are left unresolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusExceptionResolver;

impl StatusExceptionResolver {
    fn status_for(error: &DispatchError) -> Option<StatusCode> {
        let status = match error {
            DispatchError::Mapping(mapping) => match mapping {
                MappingError::NoHandlerFound { .. } => StatusCode::NOT_FOUND,
                MappingError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
                MappingError::NotAcceptable { .. } => StatusCode::NOT_ACCEPTABLE,
                MappingError::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                MappingError::UnsatisfiedParams { .. } => StatusCode::BAD_REQUEST,
                MappingError::AmbiguousHandler { .. }
                | MappingError::AmbiguousMapping { .. }
                | MappingError::InvalidMapping { .. }
                | MappingError::BeanResolution(_)
                | MappingError::Cors(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            DispatchError::Handler(handler) => match handler {
                HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
                HandlerError::Status { status, .. } => *status,
                HandlerError::AsyncTimeout => StatusCode::SERVICE_UNAVAILABLE,
                HandlerError::UnresolvedBean { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                HandlerError::Failed(_) | HandlerError::AsyncCancelled => return None,
            },
            DispatchError::NoAdapter { .. } | DispatchError::Cancelled => return None,
        };
        Some(status)
    }
}

impl ExceptionResolver for StatusExceptionResolver {
    fn resolve(&self, exchange: &mut Exchange, _handler: Option<&Handler>, error: &DispatchError) -> bool {
        let Some(status) = Self::status_for(error) else {
            return false;
        };
        let reason = match error {
            DispatchError::Handler(HandlerError::Status { reason, .. }) => reason.clone(),
            // Server faults name internal handler methods; those stay in the exception attribute.
            _ if status.is_server_error() => status.canonical_reason().unwrap_or_default().to_string(),
            other => other.to_string(),
        };
        let response = exchange.response_mut();
        response.send_error(status, reason);

        if let DispatchError::Mapping(mapping) = error {
            match mapping {
                MappingError::MethodNotAllowed { allowed, .. } if !allowed.is_empty() => {
                    let allow = allowed.iter().map(|method| method.as_str()).collect::<Vec<_>>().join(", ");
                    if let Ok(value) = HeaderValue::from_str(&allow) {
                        response.headers_mut().insert(ALLOW, value);
                    }
                }
                MappingError::UnsupportedMediaType { supported, .. } if !supported.is_empty() => {
                    if let Ok(value) = HeaderValue::from_str(&supported.join(", ")) {
                        response.headers_mut().insert(ACCEPT, value);
                    }
                }
                _ => {}
            }
        }
        if status.is_server_error() {
            log::error!("Resolved [{}] to {}", error, status);
        } else {
            log::debug!("Resolved [{}] to {}", error, status);
        }
        true
    }

    fn name(&self) -> &str {
        "StatusExceptionResolver"
    }
}
