use crate::exchange::Exchange;
use crate::handler::{Handler, HandlerError, HttpRequestHandler};
use async_trait::async_trait;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use http::{HeaderValue, Method, StatusCode};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const ALL: &str = "*";
const DEFAULT_MAX_AGE: u64 = 1800;

/// A permissive configuration used when a preflight request cannot be
/// attributed to a single handler.
pub static ALLOW_CORS_CONFIG: Lazy<CorsConfiguration> = Lazy::new(|| {
    CorsConfiguration::new()
        .allowed_origin_pattern(ALL)
        .allowed_method(ALL)
        .allowed_header(ALL)
        .allow_credentials(true)
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorsError {
    #[error(
        "When allowCredentials is true, allowedOrigins cannot contain \"*\"; list origins explicitly or use allowedOriginPatterns."
    )]
    CredentialsWithWildcardOrigin,
}

/// Cross-origin policy for a handler, declared per type or per method, or globally.
///
/// Unset fields mean "not configured"; an empty list means "nothing allowed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_origins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_origin_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allowed_headers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exposed_headers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_credentials: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_age: Option<u64>,
}

fn push(list: &mut Option<Vec<String>>, value: impl Into<String>) {
    let value = value.into();
    let values = list.get_or_insert_with(Vec::new);
    if !values.contains(&value) {
        values.push(value);
    }
}

fn combine_lists(source: &Option<Vec<String>>, other: &Option<Vec<String>>) -> Option<Vec<String>> {
    match (source, other) {
        (None, other) => other.clone(),
        (source, None) => source.clone(),
        (Some(source), Some(other)) => {
            if source.iter().any(|value| value == ALL) || other.iter().any(|value| value == ALL) {
                return Some(vec![ALL.to_string()]);
            }
            let mut combined = source.clone();
            for value in other {
                if !combined.contains(value) {
                    combined.push(value.clone());
                }
            }
            Some(combined)
        }
    }
}

/// Matches an origin against a pattern where `*` stands for any run of characters.
fn origin_matches_pattern(pattern: &str, origin: &str) -> bool {
    if pattern == ALL {
        return true;
    }
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return false;
    };
    let Some(mut remaining) = origin.strip_prefix(first) else {
        return false;
    };
    let rest: Vec<&str> = parts.collect();
    for (index, part) in rest.iter().enumerate() {
        if index + 1 == rest.len() {
            return remaining.ends_with(part);
        }
        match remaining.find(part) {
            Some(position) => remaining = &remaining[position + part.len()..],
            None => return false,
        }
    }
    remaining.is_empty()
}

impl CorsConfiguration {
    pub fn new() -> Self {
        CorsConfiguration::default()
    }

    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        push(&mut self.allowed_origins, origin);
        self
    }

    pub fn allowed_origin_pattern(mut self, pattern: impl Into<String>) -> Self {
        push(&mut self.allowed_origin_patterns, pattern);
        self
    }

    pub fn allowed_method(mut self, method: impl Into<String>) -> Self {
        push(&mut self.allowed_methods, method.into().to_ascii_uppercase());
        self
    }

    pub fn allowed_header(mut self, header: impl Into<String>) -> Self {
        push(&mut self.allowed_headers, header);
        self
    }

    pub fn exposed_header(mut self, header: impl Into<String>) -> Self {
        push(&mut self.exposed_headers, header);
        self
    }

    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = Some(allow);
        self
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn allowed_methods(&self) -> Option<&[String]> {
        self.allowed_methods.as_deref()
    }

    pub fn allowed_origins(&self) -> Option<&[String]> {
        self.allowed_origins.as_deref()
    }

    pub fn is_allow_credentials(&self) -> bool {
        self.allow_credentials.unwrap_or(false)
    }

    /// Fills unset fields with the defaults: any origin, `GET`/`HEAD`/`POST`,
    /// any header, and a max age of 30 minutes.
    pub fn apply_permit_default_values(mut self) -> Self {
        if self.allowed_origins.is_none() && self.allowed_origin_patterns.is_none() {
            self.allowed_origins = Some(vec![ALL.to_string()]);
        }
        if self.allowed_methods.is_none() {
            self.allowed_methods = Some(vec!["GET".into(), "HEAD".into(), "POST".into()]);
        }
        if self.allowed_headers.is_none() {
            self.allowed_headers = Some(vec![ALL.to_string()]);
        }
        if self.max_age.is_none() {
            self.max_age = Some(DEFAULT_MAX_AGE);
        }
        self
    }

    /// Adds `other`'s values to this configuration. A `*` on either side wins;
    /// scalar settings from `other` take precedence when set.
    pub fn combine(&self, other: &CorsConfiguration) -> CorsConfiguration {
        CorsConfiguration {
            allowed_origins: combine_lists(&self.allowed_origins, &other.allowed_origins),
            allowed_origin_patterns: combine_lists(
                &self.allowed_origin_patterns,
                &other.allowed_origin_patterns,
            ),
            allowed_methods: combine_lists(&self.allowed_methods, &other.allowed_methods),
            allowed_headers: combine_lists(&self.allowed_headers, &other.allowed_headers),
            exposed_headers: combine_lists(&self.exposed_headers, &other.exposed_headers),
            allow_credentials: other.allow_credentials.or(self.allow_credentials),
            max_age: other.max_age.or(self.max_age),
        }
    }

    /// Credentials cannot be combined with the `*` origin.
    pub fn validate_allow_credentials(&self) -> Result<(), CorsError> {
        let wildcard_origin = self
            .allowed_origins
            .as_ref()
            .is_some_and(|origins| origins.iter().any(|origin| origin == ALL));
        if self.is_allow_credentials() && wildcard_origin {
            return Err(CorsError::CredentialsWithWildcardOrigin);
        }
        Ok(())
    }

    /// The value for `Access-Control-Allow-Origin`, or `None` if the origin is rejected.
    pub fn check_origin(&self, origin: &str) -> Option<String> {
        let origin = origin.trim_end_matches('/');
        if let Some(origins) = &self.allowed_origins {
            if origins.iter().any(|allowed| allowed == ALL) && !self.is_allow_credentials() {
                return Some(ALL.to_string());
            }
            if origins
                .iter()
                .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
            {
                return Some(origin.to_string());
            }
        }
        if let Some(patterns) = &self.allowed_origin_patterns {
            if patterns
                .iter()
                .any(|pattern| origin_matches_pattern(pattern, origin))
            {
                return Some(origin.to_string());
            }
        }
        None
    }

    /// The methods to list in `Access-Control-Allow-Methods`, or `None` if `method` is not allowed.
    pub fn check_http_method(&self, method: &Method) -> Option<Vec<String>> {
        let allowed = self.allowed_methods.as_ref()?;
        if allowed.iter().any(|allowed| allowed == ALL) {
            return Some(vec![method.as_str().to_string()]);
        }
        allowed
            .iter()
            .any(|allowed| allowed == method.as_str())
            .then(|| allowed.clone())
    }

    /// The headers to list in `Access-Control-Allow-Headers`, or `None` if any is not allowed.
    pub fn check_headers(&self, requested: &[String]) -> Option<Vec<String>> {
        if requested.is_empty() {
            return Some(vec![]);
        }
        let allowed = self.allowed_headers.as_ref()?;
        let allow_any = allowed.iter().any(|allowed| allowed == ALL);
        let mut result = Vec::with_capacity(requested.len());
        for header in requested {
            if allow_any || allowed.iter().any(|allowed| allowed.eq_ignore_ascii_case(header)) {
                result.push(header.clone());
            }
        }
        (!result.is_empty()).then_some(result)
    }
}

fn insert_header(exchange: &mut Exchange, name: http::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        exchange.response_mut().headers_mut().insert(name, value);
    }
}

/// Writes CORS response headers for the request.
///
/// # Returns
/// `false` if the request was rejected, in which case the response is set to
/// `403 Forbidden` and the handler must not run.
pub fn process_request(config: Option<&CorsConfiguration>, exchange: &mut Exchange) -> bool {
    for vary in ["Origin", "Access-Control-Request-Method", "Access-Control-Request-Headers"] {
        exchange
            .response_mut()
            .headers_mut()
            .append(VARY, HeaderValue::from_static(vary));
    }
    let Some(config) = config else {
        return true;
    };
    if !exchange.is_cors_request()
        || exchange
            .response()
            .headers()
            .contains_key(ACCESS_CONTROL_ALLOW_ORIGIN)
    {
        return true;
    }

    let preflight = exchange.is_preflight();
    let origin = exchange.header(ORIGIN.as_str()).unwrap_or_default().to_string();
    let Some(allow_origin) = config.check_origin(&origin) else {
        return reject(exchange, &format!("origin '{}' not allowed", origin));
    };

    let requested_method = if preflight {
        exchange
            .header(ACCESS_CONTROL_REQUEST_METHOD.as_str())
            .and_then(|method| Method::from_bytes(method.trim().as_bytes()).ok())
    } else {
        Some(exchange.method().clone())
    };
    let Some(allow_methods) = requested_method
        .as_ref()
        .and_then(|method| config.check_http_method(method))
    else {
        return reject(exchange, "method not allowed");
    };

    let requested_headers: Vec<String> = if preflight {
        exchange
            .header(ACCESS_CONTROL_REQUEST_HEADERS.as_str())
            .map(|headers| {
                headers
                    .split(',')
                    .map(str::trim)
                    .filter(|header| !header.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    } else {
        vec![]
    };
    let Some(allow_headers) = config.check_headers(&requested_headers) else {
        return reject(exchange, "headers not allowed");
    };

    insert_header(exchange, ACCESS_CONTROL_ALLOW_ORIGIN, &allow_origin);
    if preflight {
        insert_header(exchange, ACCESS_CONTROL_ALLOW_METHODS, &allow_methods.join(","));
        if !allow_headers.is_empty() {
            insert_header(exchange, ACCESS_CONTROL_ALLOW_HEADERS, &allow_headers.join(", "));
        }
        if let Some(max_age) = config.max_age {
            insert_header(exchange, ACCESS_CONTROL_MAX_AGE, &max_age.to_string());
        }
    } else if let Some(exposed) = config.exposed_headers.as_ref().filter(|e| !e.is_empty()) {
        insert_header(exchange, ACCESS_CONTROL_EXPOSE_HEADERS, &exposed.join(", "));
    }
    if config.is_allow_credentials() {
        insert_header(exchange, ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    }
    true
}

fn reject(exchange: &mut Exchange, reason: &str) -> bool {
    log::debug!("Rejecting CORS request: {}", reason);
    exchange
        .response_mut()
        .send_error(StatusCode::FORBIDDEN, "Invalid CORS request");
    false
}

/// Answers CORS preflight requests in place of the mapped handler.
pub struct PreflightHandler {
    config: Option<CorsConfiguration>,
}

impl PreflightHandler {
    pub fn new(config: Option<CorsConfiguration>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HttpRequestHandler for PreflightHandler {
    async fn handle_request(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
        process_request(self.config.as_ref(), exchange);
        Ok(())
    }

    fn name(&self) -> &str {
        "PreflightHandler"
    }
}

/// Stands in for a handler whose actual CORS request was rejected; the response is already written.
struct RejectedCorsHandler;

#[async_trait]
impl HttpRequestHandler for RejectedCorsHandler {
    async fn handle_request(&self, _exchange: &mut Exchange) -> Result<(), HandlerError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "RejectedCorsHandler"
    }
}

/// Applies CORS to a resolved handler.
///
/// Preflight requests are answered by a [`PreflightHandler`]. Actual CORS
/// requests get their response headers now, or the handler is replaced when
/// the request is rejected.
pub(crate) fn apply_cors(
    handler: Handler,
    config: Option<CorsConfiguration>,
    exchange: &mut Exchange,
) -> Handler {
    if exchange.is_preflight() {
        return Handler::Request(Arc::new(PreflightHandler::new(config)));
    }
    if process_request(config.as_ref(), exchange) {
        handler
    } else {
        Handler::Request(Arc::new(RejectedCorsHandler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cors_exchange(method: Method, headers: &[(&str, &str)]) -> Exchange {
        let mut builder = Exchange::builder().method(method).uri("/users");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_combine() {
        let global = CorsConfiguration::new()
            .allowed_origin("https://a.example")
            .allowed_method("GET")
            .max_age(60);
        let local = CorsConfiguration::new()
            .allowed_origin("https://b.example")
            .allowed_method("*")
            .allow_credentials(true);
        let combined = global.combine(&local);

        assert_eq!(
            combined.allowed_origins(),
            Some(&["https://a.example".to_string(), "https://b.example".to_string()][..])
        );
        assert_eq!(combined.allowed_methods(), Some(&["*".to_string()][..]));
        assert!(combined.is_allow_credentials());
        assert_eq!(combined.max_age, Some(60));
    }

    #[test]
    fn test_validate_allow_credentials() {
        let invalid = CorsConfiguration::new().allowed_origin("*").allow_credentials(true);
        assert_eq!(
            invalid.validate_allow_credentials(),
            Err(CorsError::CredentialsWithWildcardOrigin)
        );
        assert!(ALLOW_CORS_CONFIG.validate_allow_credentials().is_ok());
    }

    #[test]
    fn test_check_origin() {
        let config = CorsConfiguration::new()
            .allowed_origin("https://a.example")
            .allowed_origin_pattern("https://*.b.example");
        assert_eq!(
            config.check_origin("https://a.example"),
            Some("https://a.example".to_string())
        );
        assert_eq!(
            config.check_origin("https://api.b.example"),
            Some("https://api.b.example".to_string())
        );
        assert_eq!(config.check_origin("https://evil.example"), None);

        let any = CorsConfiguration::new().apply_permit_default_values();
        assert_eq!(any.check_origin("https://x.example"), Some("*".to_string()));
    }

    #[test]
    fn test_preflight_processing() {
        let config = CorsConfiguration::new()
            .allowed_origin("https://a.example")
            .allowed_method("PUT")
            .allowed_header("X-Token")
            .max_age(100);
        let mut exchange = cors_exchange(
            Method::OPTIONS,
            &[
                ("Origin", "https://a.example"),
                ("Access-Control-Request-Method", "PUT"),
                ("Access-Control-Request-Headers", "x-token"),
            ],
        );
        assert!(process_request(Some(&config), &mut exchange));
        let response = exchange.response();
        assert_eq!(
            response.header("access-control-allow-origin"),
            Some("https://a.example")
        );
        assert_eq!(response.header("access-control-allow-methods"), Some("PUT"));
        assert_eq!(response.header("access-control-allow-headers"), Some("x-token"));
        assert_eq!(response.header("access-control-max-age"), Some("100"));
    }

    #[test]
    fn test_rejected_origin() {
        let config = CorsConfiguration::new().allowed_origin("https://a.example");
        let mut exchange = cors_exchange(Method::GET, &[("Origin", "https://evil.example")]);
        assert!(!process_request(Some(&config.apply_permit_default_values()), &mut exchange));
        assert_eq!(exchange.response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_same_origin_is_untouched() {
        let config = CorsConfiguration::new().allowed_origin("https://a.example");
        let mut exchange = cors_exchange(
            Method::GET,
            &[("Origin", "http://localhost"), ("Host", "localhost")],
        );
        assert!(process_request(Some(&config), &mut exchange));
        assert!(exchange.response().header("access-control-allow-origin").is_none());
    }
}
