use crate::handler::RouteSpec;
use crate::router::condition::{
    ConditionError, ConsumesCondition, HeadersCondition, MethodsCondition, ParamsCondition,
    PatternsCondition, ProducesCondition, RequestContext,
};
use http::Method;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

/// The mapping key for request-mapped handler methods.
///
/// Combines a patterns condition with method, params, headers, consumes and
/// produces conditions. Two infos are equal when all conditions are equal; the
/// mapping name is not part of equality.
///
/// # Examples
/// ```
/// use routeline::router::info::RequestMappingInfo;
///
/// let info = RequestMappingInfo::paths(&["/users/{id}"])
///     .get()
///     .produces(&["application/json"])
///     .build()
///     .unwrap();
/// assert_eq!(info.to_string(), "{GET /users/{id}, produces [application/json]}");
/// ```
#[derive(Debug, Clone)]
pub struct RequestMappingInfo {
    name: Option<String>,
    patterns: PatternsCondition,
    methods: MethodsCondition,
    params: ParamsCondition,
    headers: HeadersCondition,
    consumes: ConsumesCondition,
    produces: ProducesCondition,
}

impl RequestMappingInfo {
    pub fn paths(patterns: &[impl AsRef<str>]) -> RequestMappingInfoBuilder {
        RequestMappingInfoBuilder::new(patterns)
    }

    /// Parses a declared route into a mapping key.
    pub fn from_spec(spec: &RouteSpec) -> Result<Self, ConditionError> {
        Ok(Self {
            name: spec.name.clone(),
            patterns: PatternsCondition::parse(&spec.patterns)?,
            methods: MethodsCondition::parse(&spec.methods)?,
            params: ParamsCondition::parse(&spec.params)?,
            headers: HeadersCondition::parse(&spec.headers)?,
            consumes: ConsumesCondition::parse(&spec.consumes)?,
            produces: ProducesCondition::parse(&spec.produces)?,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn patterns(&self) -> &PatternsCondition {
        &self.patterns
    }

    pub fn methods(&self) -> &MethodsCondition {
        &self.methods
    }

    pub fn params(&self) -> &ParamsCondition {
        &self.params
    }

    pub fn headers(&self) -> &HeadersCondition {
        &self.headers
    }

    pub fn consumes(&self) -> &ConsumesCondition {
        &self.consumes
    }

    pub fn produces(&self) -> &ProducesCondition {
        &self.produces
    }

    pub fn direct_paths(&self) -> Vec<String> {
        self.patterns.direct_paths()
    }

    /// Combines a type-level info (`self`) with a method-level one.
    ///
    /// # Behavior
    /// Patterns are joined pairwise; methods, params and headers are unioned;
    /// method-level consumes and produces replace type-level ones when present.
    /// Names are joined with `#`.
    pub fn combine(&self, other: &RequestMappingInfo) -> Result<RequestMappingInfo, ConditionError> {
        let name = match (&self.name, &other.name) {
            (Some(outer), Some(inner)) => Some(format!("{}#{}", outer, inner)),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        };
        Ok(Self {
            name,
            patterns: self.patterns.combine(&other.patterns)?,
            methods: self.methods.combine(&other.methods),
            params: self.params.combine(&other.params),
            headers: self.headers.combine(&other.headers),
            consumes: self.consumes.combine(&other.consumes),
            produces: self.produces.combine(&other.produces),
        })
    }

    /// Checks every condition against the request, cheapest first, and returns
    /// an info narrowed to what matched.
    pub fn matching(&self, context: &RequestContext<'_>) -> Option<RequestMappingInfo> {
        let methods = self.methods.matching(context)?;
        let params = self.params.matching(context)?;
        let headers = self.headers.matching(context)?;
        let consumes = self.consumes.matching(context)?;
        let produces = self.produces.matching(context)?;
        let patterns = self.patterns.matching(context)?;
        Some(Self {
            name: self.name.clone(),
            patterns,
            methods,
            params,
            headers,
            consumes,
            produces,
        })
    }

    /// Compares two infos already narrowed for the same request. `Less` is the better match.
    ///
    /// # Behavior
    /// Conditions are compared in order: patterns, params, headers, consumes,
    /// produces, methods. For `HEAD` requests methods are compared first so an
    /// explicit `HEAD` mapping beats an implicit one through `GET`.
    pub fn compare_to(&self, other: &RequestMappingInfo, context: &RequestContext<'_>) -> Ordering {
        if context.exchange.method() == Method::HEAD {
            let result = self.methods.compare_to(&other.methods, context);
            if result != Ordering::Equal {
                return result;
            }
        }
        self.patterns
            .compare_to(&other.patterns, context)
            .then_with(|| self.params.compare_to(&other.params, context))
            .then_with(|| self.headers.compare_to(&other.headers, context))
            .then_with(|| self.consumes.compare_to(&other.consumes, context))
            .then_with(|| self.produces.compare_to(&other.produces, context))
            .then_with(|| self.methods.compare_to(&other.methods, context))
    }
}

impl PartialEq for RequestMappingInfo {
    fn eq(&self, other: &Self) -> bool {
        self.patterns == other.patterns
            && self.methods == other.methods
            && self.params == other.params
            && self.headers == other.headers
            && self.consumes == other.consumes
            && self.produces == other.produces
    }
}

impl Eq for RequestMappingInfo {}

impl Hash for RequestMappingInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.patterns.hash(state);
        self.methods.hash(state);
        self.params.hash(state);
        self.headers.hash(state);
        self.consumes.hash(state);
        self.produces.hash(state);
    }
}

impl Display for RequestMappingInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        if !self.methods.is_empty() {
            write!(f, "{} ", self.methods)?;
        }
        write!(f, "{}", self.patterns)?;
        if !self.params.expressions().is_empty() {
            write!(f, ", params [{}]", self.params)?;
        }
        let headers = self.headers.to_string();
        if !headers.is_empty() {
            write!(f, ", headers [{}]", headers)?;
        }
        if !self.consumes.is_empty() {
            write!(f, ", consumes [{}]", self.consumes)?;
        }
        if !self.produces.is_empty() {
            write!(f, ", produces [{}]", self.produces)?;
        }
        write!(f, "}}")
    }
}

/// Builds a [`RequestMappingInfo`] from string declarations.
pub struct RequestMappingInfoBuilder {
    spec: RouteSpec,
}

impl RequestMappingInfoBuilder {
    fn new(patterns: &[impl AsRef<str>]) -> Self {
        let mut spec = RouteSpec::new();
        for pattern in patterns {
            spec = spec.with_path(pattern.as_ref());
        }
        Self { spec }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.spec = self.spec.method(method.as_str());
        self
    }

    pub fn get(self) -> Self {
        self.method(Method::GET)
    }

    pub fn post(self) -> Self {
        self.method(Method::POST)
    }

    pub fn put(self) -> Self {
        self.method(Method::PUT)
    }

    pub fn delete(self) -> Self {
        self.method(Method::DELETE)
    }

    pub fn params(mut self, expressions: &[impl AsRef<str>]) -> Self {
        for expression in expressions {
            self.spec = self.spec.param(expression.as_ref());
        }
        self
    }

    pub fn headers(mut self, expressions: &[impl AsRef<str>]) -> Self {
        for expression in expressions {
            self.spec = self.spec.header(expression.as_ref());
        }
        self
    }

    pub fn consumes(mut self, media_types: &[impl AsRef<str>]) -> Self {
        for media_type in media_types {
            self.spec = self.spec.consumes(media_type.as_ref());
        }
        self
    }

    pub fn produces(mut self, media_types: &[impl AsRef<str>]) -> Self {
        for media_type in media_types {
            self.spec = self.spec.produces(media_type.as_ref());
        }
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec = self.spec.name(name);
        self
    }

    pub fn build(self) -> Result<RequestMappingInfo, ConditionError> {
        RequestMappingInfo::from_spec(&self.spec)
    }
}
