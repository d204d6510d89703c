pub mod attributes;
#[cfg(feature = "hyper")]
pub mod hyper;

use crate::dispatch::deferred::{DeferredOutcome, DeferredResult};
use crate::status::DispatchPhase;
use attributes::Attributes;
use chrono::{DateTime, Utc};
use fnv::FnvBuildHasher;
use http::header::{
    ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, HOST, IF_MODIFIED_SINCE, LAST_MODIFIED, ORIGIN,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// The response half of an exchange.
///
/// Handlers, adapters, interceptors and exception resolvers all write into the
/// same response; nothing is sent anywhere by this crate.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = Some(body.into());
    }

    pub fn take_body(&mut self) -> Option<Vec<u8>> {
        self.body.take()
    }

    /// Sets the status and a plain-text reason body, replacing anything written so far.
    pub fn send_error(&mut self, status: StatusCode, message: impl Into<String>) {
        self.status = status;
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = Some(message.into().into_bytes());
    }

    /// Clears status, headers and body.
    pub fn reset(&mut self) {
        *self = Response::default();
    }
}

/// Percent-decodes one path segment. An encoded `/` stays encoded so the
/// segment does not split; undecodable input is kept as is.
fn decode_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains('%') {
        return Cow::Borrowed(segment);
    }
    let mut decoded = String::with_capacity(segment.len());
    let mut rest = segment;
    loop {
        let (head, tail) = match [rest.find("%2F"), rest.find("%2f")].into_iter().flatten().min() {
            Some(index) => (&rest[..index], Some(&rest[index + 3..])),
            None => (rest, None),
        };
        match urlencoding::decode(head) {
            Ok(part) => decoded.push_str(&part),
            Err(_) => return Cow::Borrowed(segment),
        }
        match tail {
            Some(tail) => {
                decoded.push_str("%2F");
                rest = tail;
            }
            None => return Cow::Owned(decoded),
        }
    }
}

/// Decodes a query string name or value; `+` stands for a space.
fn decode_query_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    let decoded = urlencoding::decode(&spaced).map(Cow::into_owned).ok();
    decoded.unwrap_or(spaced)
}

/// A single request/response cycle moving through the dispatcher.
///
/// # Behavior
/// The exchange owns the already-parsed request head and body, the response
/// being built, a bag of request-scoped [`Attributes`], and the set of
/// [`DispatchPhase`]s the dispatcher has entered for it. Each exchange gets a
/// random `Uuid` used to correlate log entries.
pub struct Exchange {
    uuid: Uuid,
    method: Method,
    path: String,
    query: HashMap<String, Vec<String>, FnvBuildHasher>,
    headers: HeaderMap,
    body: Vec<u8>,
    response: Response,
    attributes: Attributes,
    phases: DispatchPhase,
    deferred: Option<oneshot::Receiver<DeferredOutcome>>,
}

impl Exchange {
    /// Starts building an exchange. Defaults to `GET /`.
    pub fn builder() -> ExchangeBuilder {
        ExchangeBuilder::new()
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request path, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path used for route lookup: the raw path with `;` matrix content
    /// removed from every segment, then percent-decoded segment by segment.
    pub fn lookup_path(&self) -> Cow<'_, str> {
        if !self.path.contains(['%', ';']) {
            return Cow::Borrowed(&self.path);
        }
        let decoded = self
            .path
            .split('/')
            .map(|segment| decode_segment(segment.split_once(';').map_or(segment, |(head, _)| head)))
            .collect::<Vec<_>>()
            .join("/");
        Cow::Owned(decoded)
    }

    /// The percent-decoded path, matrix content kept.
    pub fn decoded_path(&self) -> Cow<'_, str> {
        if !self.path.contains('%') {
            return Cow::Borrowed(&self.path);
        }
        Cow::Owned(self.path.split('/').map(decode_segment).collect::<Vec<_>>().join("/"))
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a request header, if present and valid UTF-8.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|value| value.to_str().ok())
    }

    /// First value of a query parameter.
    pub fn param(&self, name: impl AsRef<str>) -> Option<&str> {
        self.query
            .get(name.as_ref())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn param_values(&self, name: impl AsRef<str>) -> &[String] {
        self.query
            .get(name.as_ref())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_param(&self, name: impl AsRef<str>) -> bool {
        self.query.contains_key(name.as_ref())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn phases(&self) -> DispatchPhase {
        self.phases
    }

    pub(crate) fn enter(&mut self, phase: DispatchPhase) {
        self.phases |= phase;
    }

    /// A CORS request carries an `Origin` that differs from the request's own host.
    pub fn is_cors_request(&self) -> bool {
        let Some(origin) = self.header(ORIGIN.as_str()) else {
            return false;
        };
        match self.header(HOST.as_str()) {
            Some(host) => !origin
                .split_once("://")
                .is_some_and(|(_, authority)| authority.eq_ignore_ascii_case(host)),
            None => true,
        }
    }

    /// A CORS preflight is an `OPTIONS` request with both `Origin` and
    /// `Access-Control-Request-Method` headers.
    pub fn is_preflight(&self) -> bool {
        self.method == Method::OPTIONS
            && self.headers.contains_key(ORIGIN)
            && self.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// Compares `If-Modified-Since` against the handler's last-modified time.
    ///
    /// # Returns
    /// `true` if the client's copy is current, in which case the response status
    /// is set to `304 Not Modified`. Otherwise the `Last-Modified` header is set
    /// (when known) and `false` is returned.
    ///
    /// # Behavior
    /// HTTP dates carry second precision, so sub-second parts of
    /// `last_modified` are ignored. An unparsable `If-Modified-Since` header is
    /// treated as absent.
    pub fn check_not_modified(&mut self, last_modified: Option<DateTime<Utc>>) -> bool {
        let Some(last_modified) = last_modified else {
            return false;
        };
        let if_modified_since = self
            .header(IF_MODIFIED_SINCE.as_str())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok());
        if let Some(since) = if_modified_since {
            if last_modified.timestamp() <= since.timestamp() {
                self.response.set_status(StatusCode::NOT_MODIFIED);
                return true;
            }
        }
        let formatted = last_modified.format(HTTP_DATE_FORMAT).to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            self.response.headers_mut().insert(LAST_MODIFIED, value);
        }
        false
    }

    /// Switches the exchange into asynchronous mode.
    ///
    /// The returned [`DeferredResult`] completes the request later, from any
    /// task. The dispatcher notices the switch after the handler returns and
    /// suspends the pipeline instead of finishing it.
    pub fn start_async(&mut self) -> DeferredResult {
        let (sender, receiver) = oneshot::channel();
        self.deferred = Some(receiver);
        DeferredResult::new(sender)
    }

    pub fn is_async_started(&self) -> bool {
        self.deferred.is_some()
    }

    pub(crate) fn take_deferred(&mut self) -> Option<oneshot::Receiver<DeferredOutcome>> {
        self.deferred.take()
    }
}

/// An empty `GET /` exchange.
impl Default for Exchange {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            method: Method::GET,
            path: "/".to_string(),
            query: HashMap::with_hasher(FnvBuildHasher::default()),
            headers: HeaderMap::new(),
            body: Vec::new(),
            response: Response::default(),
            attributes: Attributes::new(),
            phases: DispatchPhase::NONE,
            deferred: None,
        }
    }
}

/// Errors produced while assembling an [`Exchange`].
#[derive(Error, Debug)]
pub enum ExchangeBuilderError {
    #[error("Invalid header name '{name}'.")]
    InvalidHeaderName { name: String },

    #[error("Invalid value for header '{name}'.")]
    InvalidHeaderValue { name: String },

    #[error("Invalid method '{method}'.")]
    InvalidMethod { method: String },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),
}

impl ExchangeBuilderError {
    #[inline]
    pub(crate) fn invalid_header_name(name: impl Into<String>) -> Self {
        Self::InvalidHeaderName { name: name.into() }
    }

    #[inline]
    pub(crate) fn invalid_header_value(name: impl Into<String>) -> Self {
        Self::InvalidHeaderValue { name: name.into() }
    }

    #[inline]
    pub(crate) fn invalid_method(method: impl Into<String>) -> Self {
        Self::InvalidMethod {
            method: method.into(),
        }
    }
}

pub struct ExchangeBuilder {
    uuid: Option<Uuid>,
    method: Result<Method, ExchangeBuilderError>,
    path: String,
    query: HashMap<String, Vec<String>, FnvBuildHasher>,
    header_map: HeaderMap,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for ExchangeBuilder {
    fn default() -> Self {
        ExchangeBuilder::new()
    }
}

impl ExchangeBuilder {
    pub fn new() -> Self {
        Self {
            uuid: None,
            method: Ok(Method::GET),
            path: "/".to_string(),
            query: HashMap::with_hasher(FnvBuildHasher::default()),
            header_map: HeaderMap::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Ok(method);
        self
    }

    /// Parses a method name such as `"PATCH"`.
    pub fn method_str(mut self, method: impl AsRef<str>) -> Self {
        let method = method.as_ref();
        self.method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ExchangeBuilderError::invalid_method(method));
        self
    }

    /// Sets the path and, if present, the query string (`/a/b?x=1&y`).
    /// The path is kept raw; query names and values are decoded here.
    pub fn uri(mut self, uri: impl AsRef<str>) -> Self {
        let uri = uri.as_ref();
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (uri, None),
        };
        self.path = if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };
        if let Some(query) = query {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                self.query
                    .entry(decode_query_component(name))
                    .or_default()
                    .push(decode_query_component(value));
            }
        }
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends already-parsed headers.
    pub fn header_map(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.header_map.append(name.clone(), value.clone());
        }
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Exchange, ExchangeBuilderError> {
        let method = self.method?;
        let mut headers = self.header_map;
        for (name, value) in self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ExchangeBuilderError::invalid_header_name(&name))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|_| ExchangeBuilderError::invalid_header_value(&name))?;
            headers.append(header_name, header_value);
        }
        Ok(Exchange {
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            method,
            path: self.path,
            query: self.query,
            headers,
            body: self.body,
            response: Response::default(),
            attributes: Attributes::new(),
            phases: DispatchPhase::NONE,
            deferred: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_builder_parses_query() {
        let exchange = Exchange::builder()
            .method(Method::POST)
            .uri("/users?id=42&tag=a&tag=b&flag")
            .header("Content-Type", "application/json")
            .build()
            .unwrap();
        assert_eq!(exchange.method(), Method::POST);
        assert_eq!(exchange.path(), "/users");
        assert_eq!(exchange.param("id"), Some("42"));
        assert_eq!(exchange.param_values("tag"), &["a".to_string(), "b".to_string()]);
        assert!(exchange.has_param("flag"));
        assert_eq!(exchange.content_type(), Some("application/json"));
    }

    #[test]
    fn test_lookup_path_strips_matrix_content() {
        let exchange = Exchange::builder()
            .uri("/cars;color=red/owners;year=2020/list")
            .build()
            .unwrap();
        assert_eq!(exchange.lookup_path(), "/cars/owners/list");

        let plain = Exchange::builder().uri("/cars").build().unwrap();
        assert!(matches!(plain.lookup_path(), Cow::Borrowed("/cars")));
    }

    #[test]
    fn test_percent_decoding() {
        let exchange = Exchange::builder()
            .uri("/users/John%20Doe;v=1/caf%C3%A9/a%2Fb?q=a%20b&name=x+y&%C3%A9=1")
            .build()
            .unwrap();
        assert_eq!(exchange.path(), "/users/John%20Doe;v=1/caf%C3%A9/a%2Fb");
        assert_eq!(exchange.lookup_path(), "/users/John Doe/café/a%2Fb");
        assert_eq!(exchange.decoded_path(), "/users/John Doe;v=1/café/a%2Fb");
        assert_eq!(exchange.param("q"), Some("a b"));
        assert_eq!(exchange.param("name"), Some("x y"));
        assert_eq!(exchange.param("é"), Some("1"));

        let broken = Exchange::builder().uri("/bad%FF").build().unwrap();
        assert_eq!(broken.lookup_path(), "/bad%FF");
    }

    #[test]
    fn test_builder_rejects_bad_header() {
        let result = Exchange::builder().header("bad header", "x").build();
        assert!(matches!(
            result,
            Err(ExchangeBuilderError::InvalidHeaderName { .. })
        ));
    }

    #[test]
    fn test_preflight_detection() {
        let preflight = Exchange::builder()
            .method(Method::OPTIONS)
            .uri("/users")
            .header("Origin", "https://example.com")
            .header("Access-Control-Request-Method", "POST")
            .build()
            .unwrap();
        assert!(preflight.is_preflight());
        assert!(preflight.is_cors_request());

        let plain_options = Exchange::builder()
            .method(Method::OPTIONS)
            .uri("/users")
            .build()
            .unwrap();
        assert!(!plain_options.is_preflight());
    }

    #[test]
    fn test_same_origin_is_not_cors() {
        let exchange = Exchange::builder()
            .header("Origin", "http://localhost:8080")
            .header("Host", "localhost:8080")
            .build()
            .unwrap();
        assert!(!exchange.is_cors_request());
    }

    #[test]
    fn test_check_not_modified() {
        let last_modified = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut current = Exchange::builder()
            .header("If-Modified-Since", "Wed, 01 May 2024 12:00:00 GMT")
            .build()
            .unwrap();
        assert!(current.check_not_modified(Some(last_modified)));
        assert_eq!(current.response().status(), StatusCode::NOT_MODIFIED);

        let mut stale = Exchange::builder()
            .header("If-Modified-Since", "Tue, 30 Apr 2024 12:00:00 GMT")
            .build()
            .unwrap();
        assert!(!stale.check_not_modified(Some(last_modified)));
        assert_eq!(
            stale.response().header("last-modified"),
            Some("Wed, 01 May 2024 12:00:00 GMT")
        );

        let mut unknown = Exchange::builder().build().unwrap();
        assert!(!unknown.check_not_modified(None));
    }
}
