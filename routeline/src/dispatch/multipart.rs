use crate::exchange::Exchange;
use crate::handler::HandlerError;

/// Attribute holding the boundary of a resolved multipart request.
pub const MULTIPART_BOUNDARY: &str = "routeline.multipartBoundary";

/// Prepares multipart requests before routing and cleans up after completion.
///
/// Cleanup runs with the completion hooks, so a suspended dispatch keeps its
/// multipart state until it is resumed or cancelled.
pub trait MultipartResolver: Send + Sync {
    fn is_multipart(&self, exchange: &Exchange) -> bool;

    /// # Errors
    /// A `HandlerError` if the request claims to be multipart but cannot be
    /// treated as such.
    fn resolve_multipart(&self, exchange: &mut Exchange) -> Result<(), HandlerError>;

    fn cleanup_multipart(&self, exchange: &mut Exchange);
}

/// Detects `multipart/*` requests and records their boundary. Parts are not parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardMultipartResolver;

impl MultipartResolver for StandardMultipartResolver {
    fn is_multipart(&self, exchange: &Exchange) -> bool {
        exchange
            .content_type()
            .is_some_and(|content_type| content_type.trim_start().to_ascii_lowercase().starts_with("multipart/"))
    }

    fn resolve_multipart(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        let boundary = exchange
            .content_type()
            .into_iter()
            .flat_map(|content_type| content_type.split(';').skip(1))
            .filter_map(|parameter| parameter.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
            .filter(|boundary| !boundary.is_empty())
            .ok_or_else(|| HandlerError::bad_request("Multipart request has no boundary"))?;
        log::trace!("Resolved multipart request with boundary '{}'", boundary);
        exchange.attributes_mut().insert::<String>(MULTIPART_BOUNDARY, boundary);
        Ok(())
    }

    fn cleanup_multipart(&self, exchange: &mut Exchange) {
        exchange.attributes_mut().remove::<String>(MULTIPART_BOUNDARY);
    }
}
