use crate::exchange::Exchange;
use crate::exchange::attributes::names;
use crate::handler::{Handler, HttpRequestHandler};
use crate::mapping::cors::{CorsConfiguration, apply_cors};
use crate::mapping::{HandlerMapping, MappingError};
use crate::router::path::{PathPattern, UriVariables, split_path};
use fnv::FnvBuildHasher;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps URL patterns straight to [`HttpRequestHandler`]s.
///
/// # Behavior
/// An exact path registration wins outright. Otherwise the most specific
/// matching pattern is used, and failing that the default handler if one is
/// set. Registration happens while building, before the mapping is shared.
pub struct SimpleUrlHandlerMapping {
    name: String,
    exact: HashMap<String, Arc<dyn HttpRequestHandler>, FnvBuildHasher>,
    patterns: Vec<(PathPattern, Arc<dyn HttpRequestHandler>)>,
    default_handler: Option<Arc<dyn HttpRequestHandler>>,
    trailing_slash_match: bool,
    cors: Option<CorsConfiguration>,
}

impl SimpleUrlHandlerMapping {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exact: HashMap::with_hasher(FnvBuildHasher::default()),
            patterns: Vec::new(),
            default_handler: None,
            trailing_slash_match: false,
            cors: None,
        }
    }

    pub fn with_trailing_slash_match(mut self, trailing_slash_match: bool) -> Self {
        self.trailing_slash_match = trailing_slash_match;
        self
    }

    pub fn with_cors(mut self, cors: CorsConfiguration) -> Self {
        self.cors = Some(cors);
        self
    }

    pub fn with_default_handler(mut self, handler: Arc<dyn HttpRequestHandler>) -> Self {
        self.default_handler = Some(handler);
        self
    }

    /// # Errors
    /// `InvalidMapping` for a malformed pattern, `AmbiguousMapping` if the
    /// pattern is already mapped to a different handler.
    pub fn register_handler(
        &mut self,
        pattern: &str,
        handler: Arc<dyn HttpRequestHandler>,
    ) -> Result<(), MappingError> {
        let parsed =
            PathPattern::parse(pattern).map_err(|error| MappingError::invalid_mapping(handler.name(), error))?;
        if parsed.is_pattern() {
            if let Some((_, existing)) = self.patterns.iter().find(|(existing, _)| existing == &parsed) {
                return Self::check_conflict(&parsed, existing, &handler);
            }
            self.patterns.push((parsed, handler));
        } else {
            let path = parsed.as_str().to_string();
            if let Some(existing) = self.exact.get(&path) {
                return Self::check_conflict(&parsed, existing, &handler);
            }
            self.exact.insert(path, handler);
        }
        log::debug!(target: crate::logger::MAPPINGS_TARGET, "Mapped [{}] onto {}", pattern, self.name);
        Ok(())
    }

    fn check_conflict(
        pattern: &PathPattern,
        existing: &Arc<dyn HttpRequestHandler>,
        handler: &Arc<dyn HttpRequestHandler>,
    ) -> Result<(), MappingError> {
        if Arc::ptr_eq(existing, handler) {
            return Ok(());
        }
        Err(MappingError::ambiguous_mapping(pattern, existing.name(), handler.name()))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, lookup_path: &str) -> Option<(String, UriVariables, Arc<dyn HttpRequestHandler>)> {
        if let Some(handler) = self.exact.get(lookup_path) {
            return Some((lookup_path.to_string(), UriVariables::new(), handler.clone()));
        }
        self.patterns
            .iter()
            .filter_map(|(pattern, handler)| {
                pattern
                    .matches_with_trailing_slash(lookup_path, self.trailing_slash_match)
                    .map(|variables| (pattern, variables, handler))
            })
            .min_by(|(a, _, _), (b, _, _)| a.compare_specificity(b, lookup_path))
            .map(|(pattern, variables, handler)| {
                (pattern.as_str().to_string(), variables, handler.clone())
            })
    }
}

/// The part of `path` below the literal prefix of `pattern`: `/static/**`
/// and `/static/css/a.css` give `css/a.css`.
fn path_within_pattern(pattern: &str, path: &str) -> String {
    let prefix = split_path(pattern)
        .take_while(|segment| !segment.contains(['*', '?', '{']))
        .count();
    split_path(path).skip(prefix).collect::<Vec<_>>().join("/")
}

impl HandlerMapping for SimpleUrlHandlerMapping {
    fn get_handler(&self, exchange: &mut Exchange) -> Result<Option<Handler>, MappingError> {
        let lookup_path = exchange.lookup_path().into_owned();
        let handler = match self.lookup(&lookup_path) {
            Some((pattern, variables, handler)) => {
                let within = if pattern == lookup_path {
                    lookup_path.clone()
                } else {
                    path_within_pattern(&pattern, &lookup_path)
                };
                let attributes = exchange.attributes_mut();
                attributes.insert::<String>(names::BEST_MATCHING_PATTERN, pattern);
                attributes.insert::<String>(names::PATH_WITHIN_MAPPING, within);
                attributes.insert::<UriVariables>(names::URI_TEMPLATE_VARIABLES, variables);
                handler
            }
            None => match &self.default_handler {
                Some(handler) => {
                    exchange
                        .attributes_mut()
                        .insert::<String>(names::PATH_WITHIN_MAPPING, lookup_path);
                    handler.clone()
                }
                None => return Ok(None),
            },
        };
        log::debug!("Mapped to {}", handler.name());

        let handler = Handler::Request(handler);
        if self.cors.is_some() || exchange.is_preflight() {
            if let Some(cors) = &self.cors {
                cors.validate_allow_credentials()?;
            }
            return Ok(Some(apply_cors(handler, self.cors.clone(), exchange)));
        }
        Ok(Some(handler))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FnRequestHandler, HandlerError};
    use http::Method;

    fn named(name: &'static str) -> Arc<dyn HttpRequestHandler> {
        Arc::new(FnRequestHandler::new(name, |exchange: &mut Exchange| {
            Box::pin(async move {
                exchange.response_mut().set_body("ok");
                Ok::<_, HandlerError>(())
            })
        }))
    }

    fn resolve(mapping: &SimpleUrlHandlerMapping, uri: &str) -> (Option<String>, Exchange) {
        let mut exchange = Exchange::builder().uri(uri).build().unwrap();
        let handler = mapping
            .get_handler(&mut exchange)
            .unwrap()
            .map(|handler| handler.to_string());
        (handler, exchange)
    }

    #[test]
    fn test_exact_beats_pattern() {
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        mapping.register_handler("/static/**", named("resources")).unwrap();
        mapping.register_handler("/static/favicon.ico", named("favicon")).unwrap();
        mapping.register_handler("/static/{file}", named("file")).unwrap();

        let (handler, _) = resolve(&mapping, "/static/favicon.ico");
        assert_eq!(handler.as_deref(), Some("favicon"));

        let (handler, exchange) = resolve(&mapping, "/static/app.js");
        assert_eq!(handler.as_deref(), Some("file"));
        assert_eq!(
            exchange
                .attributes()
                .get::<UriVariables>(names::URI_TEMPLATE_VARIABLES)
                .and_then(|vars| vars.get("file"))
                .map(String::as_str),
            Some("app.js")
        );

        let (handler, exchange) = resolve(&mapping, "/static/css/site.css");
        assert_eq!(handler.as_deref(), Some("resources"));
        assert_eq!(
            exchange
                .attributes()
                .get::<String>(names::PATH_WITHIN_MAPPING)
                .map(String::as_str),
            Some("css/site.css")
        );
    }

    #[test]
    fn test_default_handler_and_miss() {
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        mapping.register_handler("/health", named("health")).unwrap();
        let (handler, _) = resolve(&mapping, "/missing");
        assert_eq!(handler, None);

        let mapping = mapping.with_default_handler(named("fallback"));
        let (handler, _) = resolve(&mapping, "/missing");
        assert_eq!(handler.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_register_conflict() {
        let mut mapping = SimpleUrlHandlerMapping::new("simple");
        let health = named("health");
        mapping.register_handler("/health", health.clone()).unwrap();
        mapping.register_handler("/health", health).unwrap();
        assert_eq!(mapping.len(), 1);

        assert!(matches!(
            mapping.register_handler("/health", named("other")),
            Err(MappingError::AmbiguousMapping { .. })
        ));
        assert!(matches!(
            mapping.register_handler("/bad/{open", named("bad")),
            Err(MappingError::InvalidMapping { .. })
        ));
    }

    #[test]
    fn test_preflight_answered_with_cors() {
        let mut mapping = SimpleUrlHandlerMapping::new("simple")
            .with_cors(CorsConfiguration::new().allowed_origin("https://a.example").apply_permit_default_values());
        mapping.register_handler("/health", named("health")).unwrap();

        let mut exchange = Exchange::builder()
            .method(Method::OPTIONS)
            .uri("/health")
            .header("Origin", "https://a.example")
            .header("Access-Control-Request-Method", "GET")
            .build()
            .unwrap();
        let handler = mapping.get_handler(&mut exchange).unwrap().unwrap();
        assert_eq!(handler.to_string(), "PreflightHandler");
    }
}
