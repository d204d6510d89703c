use crate::config::MappingConfig;
use crate::exchange::Exchange;
use crate::exchange::attributes::names;
use crate::handler::{Controller, HandlerError, HandlerMethod, HandlerOutput, MethodRef};
use crate::mapping::cors::CorsConfiguration;
use crate::mapping::handler_mapping::HandlerMethodMapping;
use crate::mapping::naming::DefaultNamingStrategy;
use crate::mapping::{MappingError, MappingStrategy};
use crate::router::condition::{ConditionError, RequestContext};
use crate::router::info::RequestMappingInfo;
use crate::router::path::UriVariables;
use async_trait::async_trait;
use http::header::ALLOW;
use http::{HeaderValue, Method};
use std::cmp::Ordering;
use std::sync::Arc;

pub type RequestMappingHandlerMapping = HandlerMethodMapping<RequestMappingInfo, RequestMappingStrategy>;

/// Maps controller methods declared with a [`RouteSpec`](crate::handler::RouteSpec)
/// to [`RequestMappingInfo`] keys.
pub struct RequestMappingStrategy {
    config: MappingConfig,
}

impl RequestMappingStrategy {
    pub fn new(config: MappingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    /// A handler mapping configured from `config`: default naming when enabled
    /// and the global CORS configuration when present.
    pub fn handler_mapping(config: MappingConfig) -> RequestMappingHandlerMapping {
        let naming = config.naming_strategy;
        let global_cors = config.global_cors.clone();
        let mut mapping = HandlerMethodMapping::new("requestMappingHandlerMapping", Self::new(config));
        if naming {
            mapping = mapping.with_naming_strategy(Arc::new(DefaultNamingStrategy));
        }
        if let Some(global_cors) = global_cors {
            mapping = mapping.with_global_cors(global_cors);
        }
        mapping
    }

    fn context<'a>(&self, exchange: &'a Exchange, lookup_path: &'a str) -> RequestContext<'a> {
        RequestContext::new(exchange, lookup_path)
            .with_trailing_slash_match(self.config.use_trailing_slash_match)
    }
}

impl Default for RequestMappingStrategy {
    fn default() -> Self {
        Self::new(MappingConfig::default())
    }
}

impl MappingStrategy<RequestMappingInfo> for RequestMappingStrategy {
    fn is_handler(&self, controller: &dyn Controller) -> bool {
        controller.type_mapping().is_some()
            || controller
                .methods()
                .iter()
                .any(|method| method.route().is_some())
    }

    /// Parses the method's route and combines it with the type-level route.
    fn mapping_for_method(
        &self,
        controller: &dyn Controller,
        method: &MethodRef,
    ) -> Result<Option<RequestMappingInfo>, MappingError> {
        let Some(route) = method.route() else {
            return Ok(None);
        };
        let invalid = |error: ConditionError| {
            MappingError::invalid_mapping(format!("{}#{}", controller.type_name(), method.name()), error)
        };
        let info = RequestMappingInfo::from_spec(route).map_err(invalid)?;
        match controller.type_mapping() {
            Some(type_route) => {
                let type_info = RequestMappingInfo::from_spec(&type_route).map_err(invalid)?;
                type_info.combine(&info).map(Some).map_err(invalid)
            }
            None => Ok(Some(info)),
        }
    }

    fn direct_paths(&self, mapping: &RequestMappingInfo) -> Vec<String> {
        mapping.direct_paths()
    }

    fn lookup_path(&self, exchange: &Exchange) -> String {
        if self.config.remove_semicolon_content {
            exchange.lookup_path().into_owned()
        } else {
            exchange.decoded_path().into_owned()
        }
    }

    fn matching_mapping(
        &self,
        mapping: &RequestMappingInfo,
        exchange: &Exchange,
        lookup_path: &str,
    ) -> Option<RequestMappingInfo> {
        mapping.matching(&self.context(exchange, lookup_path))
    }

    fn compare(
        &self,
        a: &RequestMappingInfo,
        b: &RequestMappingInfo,
        exchange: &Exchange,
        lookup_path: &str,
    ) -> Ordering {
        a.compare_to(b, &self.context(exchange, lookup_path))
    }

    /// Exposes the best pattern and the variables it captured.
    fn handle_match(&self, mapping: &RequestMappingInfo, lookup_path: &str, exchange: &mut Exchange) {
        let Some(pattern) = mapping.patterns().patterns().first() else {
            return;
        };
        let variables = pattern
            .matches_with_trailing_slash(lookup_path, self.config.use_trailing_slash_match)
            .unwrap_or_default();
        let attributes = exchange.attributes_mut();
        attributes.insert::<String>(names::BEST_MATCHING_PATTERN, pattern.as_str().to_string());
        attributes.insert::<UriVariables>(names::URI_TEMPLATE_VARIABLES, variables);
    }

    /// Explains why a request whose path matched was still not routed.
    ///
    /// # Behavior
    /// Only mappings whose patterns match the path are considered. Their other
    /// conditions are checked in order (method, consumes, produces, params) and
    /// the first condition no mapping satisfies is reported. An `OPTIONS`
    /// request that fails on method gets a handler answering with `Allow`.
    fn handle_no_match(
        &self,
        mappings: &[&RequestMappingInfo],
        lookup_path: &str,
        exchange: &Exchange,
    ) -> Result<Option<HandlerMethod>, MappingError> {
        let context = self.context(exchange, lookup_path);
        let partial: Vec<&RequestMappingInfo> = mappings
            .iter()
            .copied()
            .filter(|mapping| mapping.patterns().matching(&context).is_some())
            .collect();
        if partial.is_empty() {
            return Ok(None);
        }

        let methods_match: Vec<&RequestMappingInfo> = partial
            .iter()
            .copied()
            .filter(|mapping| mapping.methods().matching(&context).is_some())
            .collect();
        if methods_match.is_empty() {
            let mut allowed: Vec<Method> = Vec::new();
            for mapping in &partial {
                for method in mapping.methods().methods() {
                    if !allowed.contains(method) {
                        allowed.push(method.clone());
                    }
                }
            }
            if exchange.method() == Method::OPTIONS {
                return Ok(Some(HttpOptionsHandler::handler_method(allowed)));
            }
            return Err(MappingError::MethodNotAllowed {
                method: exchange.method().clone(),
                allowed,
            });
        }

        let consumes_match: Vec<&RequestMappingInfo> = methods_match
            .iter()
            .copied()
            .filter(|mapping| mapping.consumes().matching(&context).is_some())
            .collect();
        if consumes_match.is_empty() {
            let supported = collect_strings(methods_match.iter().flat_map(|mapping| {
                mapping.consumes().media_types().into_iter().map(ToString::to_string)
            }));
            return Err(MappingError::UnsupportedMediaType {
                content_type: exchange
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                supported,
            });
        }

        let produces_match: Vec<&RequestMappingInfo> = consumes_match
            .iter()
            .copied()
            .filter(|mapping| mapping.produces().matching(&context).is_some())
            .collect();
        if produces_match.is_empty() {
            let supported = collect_strings(consumes_match.iter().flat_map(|mapping| {
                mapping.produces().media_types().into_iter().map(ToString::to_string)
            }));
            return Err(MappingError::NotAcceptable { supported });
        }

        if !produces_match
            .iter()
            .any(|mapping| mapping.params().matching(&context).is_some())
        {
            let conditions = collect_strings(produces_match.iter().map(|mapping| mapping.params().to_string()));
            return Err(MappingError::UnsatisfiedParams { conditions });
        }
        Ok(None)
    }

    /// Method-level CORS declarations, with unset fields defaulted. Allowed
    /// methods default to the mapping's methods, or `GET`/`HEAD`/`POST`.
    fn init_cors_configuration(
        &self,
        handler_method: &HandlerMethod,
        mapping: &RequestMappingInfo,
    ) -> Result<Option<CorsConfiguration>, MappingError> {
        let Some(declared) = handler_method.method().cross_origin() else {
            return Ok(None);
        };
        let mut config = declared.clone();
        if config.allowed_methods().is_none() {
            for method in mapping.methods().methods() {
                config = config.allowed_method(method.as_str());
            }
        }
        let config = config.apply_permit_default_values();
        config.validate_allow_credentials()?;
        Ok(Some(config))
    }
}

fn collect_strings(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut collected: Vec<String> = Vec::new();
    for value in values {
        if !collected.contains(&value) {
            collected.push(value);
        }
    }
    collected
}

/// Answers an `OPTIONS` request that no mapping declares by listing the
/// methods the path supports.
struct HttpOptionsHandler {
    allow: String,
}

impl HttpOptionsHandler {
    fn handler_method(declared: Vec<Method>) -> HandlerMethod {
        let handler = Self {
            allow: Self::allowed_methods(declared),
        };
        HandlerMethod::new(Arc::new(handler), MethodRef::new("handle"))
    }

    fn allowed_methods(mut declared: Vec<Method>) -> String {
        if declared.is_empty() {
            declared = vec![
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ];
        } else {
            if declared.contains(&Method::GET) && !declared.contains(&Method::HEAD) {
                declared.push(Method::HEAD);
            }
            if !declared.contains(&Method::OPTIONS) {
                declared.push(Method::OPTIONS);
            }
        }
        declared
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl Controller for HttpOptionsHandler {
    fn type_name(&self) -> &str {
        "HttpOptionsHandler"
    }

    fn methods(&self) -> Vec<MethodRef> {
        vec![MethodRef::new("handle")]
    }

    async fn invoke(
        &self,
        _method: &MethodRef,
        exchange: &mut Exchange,
    ) -> Result<HandlerOutput, HandlerError> {
        let allow = HeaderValue::from_str(&self.allow)
            .map_err(|_| HandlerError::failed(format!("invalid Allow header: {}", self.allow)))?;
        exchange.response_mut().headers_mut().insert(ALLOW, allow);
        Ok(HandlerOutput::Empty)
    }
}
