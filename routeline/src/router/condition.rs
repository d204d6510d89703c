use crate::exchange::Exchange;
use crate::router::media::{MediaType, MediaTypeError};
use crate::router::path::{PathPattern, PatternError};
use http::Method;
use http::header::{ACCEPT, ACCESS_CONTROL_REQUEST_METHOD};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    MediaType(#[from] MediaTypeError),

    #[error("Invalid request method '{method}'.")]
    InvalidMethod { method: String },

    #[error("Invalid expression '{expression}'.")]
    InvalidExpression { expression: String },
}

impl ConditionError {
    #[inline]
    pub(crate) fn invalid_method(method: impl Into<String>) -> Self {
        Self::InvalidMethod {
            method: method.into(),
        }
    }

    #[inline]
    pub(crate) fn invalid_expression(expression: impl Into<String>) -> Self {
        Self::InvalidExpression {
            expression: expression.into(),
        }
    }
}

/// Per-request inputs shared by every condition while matching one exchange.
pub struct RequestContext<'a> {
    pub exchange: &'a Exchange,
    pub lookup_path: &'a str,
    pub trailing_slash_match: bool,
}

impl<'a> RequestContext<'a> {
    pub fn new(exchange: &'a Exchange, lookup_path: &'a str) -> Self {
        Self {
            exchange,
            lookup_path,
            trailing_slash_match: false,
        }
    }

    pub fn with_trailing_slash_match(mut self, trailing_slash_match: bool) -> Self {
        self.trailing_slash_match = trailing_slash_match;
        self
    }

    fn accepted_media_types(&self) -> Vec<MediaType> {
        let mut accepted = self
            .exchange
            .header(ACCEPT.as_str())
            .map(MediaType::parse_list)
            .unwrap_or_default();
        if accepted.is_empty() {
            accepted.push(MediaType::all());
        }
        MediaType::sort_by_quality_and_specificity(&mut accepted);
        accepted
    }
}

fn join<T: Display>(items: &[T], separator: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

/// URL patterns. Matching narrows to the patterns that match, most specific first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PatternsCondition {
    patterns: Vec<PathPattern>,
}

impl PatternsCondition {
    pub fn parse(patterns: &[impl AsRef<str>]) -> Result<Self, ConditionError> {
        let mut parsed = patterns
            .iter()
            .map(|pattern| PathPattern::parse(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if parsed.is_empty() {
            parsed.push(PathPattern::parse("")?);
        }
        Ok(Self::from_patterns(parsed))
    }

    fn from_patterns(mut patterns: Vec<PathPattern>) -> Self {
        patterns.sort();
        patterns.dedup();
        Self { patterns }
    }

    pub fn patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    /// Patterns with no wildcards or captures.
    pub fn direct_paths(&self) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|pattern| !pattern.is_pattern())
            .map(|pattern| pattern.as_str().to_string())
            .collect()
    }

    /// Every type-level pattern joined with every method-level pattern.
    pub fn combine(&self, other: &PatternsCondition) -> Result<Self, ConditionError> {
        let mut combined = Vec::with_capacity(self.patterns.len() * other.patterns.len());
        for outer in &self.patterns {
            for inner in &other.patterns {
                combined.push(outer.combine(inner)?);
            }
        }
        Ok(Self::from_patterns(combined))
    }

    pub fn matching(&self, context: &RequestContext<'_>) -> Option<Self> {
        let mut matches: Vec<PathPattern> = self
            .patterns
            .iter()
            .filter(|pattern| {
                pattern
                    .matches_with_trailing_slash(context.lookup_path, context.trailing_slash_match)
                    .is_some()
            })
            .cloned()
            .collect();
        if matches.is_empty() {
            return None;
        }
        matches.sort_by(|a, b| a.compare_specificity(b, context.lookup_path));
        Some(Self { patterns: matches })
    }

    pub fn compare_to(&self, other: &Self, context: &RequestContext<'_>) -> Ordering {
        let mut left = self.patterns.iter();
        let mut right = other.patterns.iter();
        loop {
            match (left.next(), right.next()) {
                (Some(a), Some(b)) => {
                    let result = a.compare_specificity(b, context.lookup_path);
                    if result != Ordering::Equal {
                        return result;
                    }
                }
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => return Ordering::Equal,
            }
        }
    }
}

impl Display for PatternsCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.patterns.len() == 1 {
            write!(f, "{}", self.patterns[0])
        } else {
            write!(f, "[{}]", join(&self.patterns, ", "))
        }
    }
}

/// HTTP request methods. An empty condition matches every method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MethodsCondition {
    methods: Vec<Method>,
}

impl MethodsCondition {
    pub fn parse(methods: &[impl AsRef<str>]) -> Result<Self, ConditionError> {
        let methods = methods
            .iter()
            .map(|method| {
                let method = method.as_ref().trim().to_ascii_uppercase();
                Method::from_bytes(method.as_bytes())
                    .map_err(|_| ConditionError::invalid_method(&method))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_methods(methods))
    }

    pub fn from_methods(mut methods: Vec<Method>) -> Self {
        methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        methods.dedup();
        Self { methods }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn combine(&self, other: &Self) -> Self {
        let mut methods = self.methods.clone();
        methods.extend(other.methods.iter().cloned());
        Self::from_methods(methods)
    }

    /// Narrows to the one method that matched.
    ///
    /// # Behavior
    /// A CORS preflight is matched on `Access-Control-Request-Method` rather than
    /// `OPTIONS`. `HEAD` falls back to a declared `GET`.
    pub fn matching(&self, context: &RequestContext<'_>) -> Option<Self> {
        let exchange = context.exchange;
        if exchange.is_preflight() {
            if self.methods.is_empty() {
                return Some(self.clone());
            }
            let requested = exchange
                .header(ACCESS_CONTROL_REQUEST_METHOD.as_str())
                .and_then(|method| Method::from_bytes(method.trim().as_bytes()).ok())?;
            return self.match_method(&requested);
        }
        if self.methods.is_empty() {
            return Some(self.clone());
        }
        self.match_method(exchange.method())
    }

    fn match_method(&self, method: &Method) -> Option<Self> {
        if self.methods.contains(method) {
            return Some(Self::from_methods(vec![method.clone()]));
        }
        if method == Method::HEAD && self.methods.contains(&Method::GET) {
            return Some(Self::from_methods(vec![Method::GET]));
        }
        None
    }

    pub fn compare_to(&self, other: &Self, context: &RequestContext<'_>) -> Ordering {
        if other.methods.len() != self.methods.len() {
            return other.methods.len().cmp(&self.methods.len());
        }
        if self.methods.len() == 1 && context.exchange.method() == Method::HEAD {
            let self_head = self.methods.contains(&Method::HEAD);
            let other_head = other.methods.contains(&Method::HEAD);
            return other_head.cmp(&self_head);
        }
        Ordering::Equal
    }
}

impl Display for MethodsCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.methods.len() == 1 {
            write!(f, "{}", self.methods[0])
        } else {
            write!(f, "[{}]", join(&self.methods, ", "))
        }
    }
}

/// `name`, `!name`, `name=value` or `name!=value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameValueExpression {
    name: String,
    value: Option<String>,
    negated: bool,
}

impl NameValueExpression {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let trimmed = expression.trim();
        let (name, value, negated) = if let Some((name, value)) = trimmed.split_once("!=") {
            (name, Some(value), true)
        } else if let Some((name, value)) = trimmed.split_once('=') {
            (name, Some(value), false)
        } else if let Some(name) = trimmed.strip_prefix('!') {
            (name, None, true)
        } else {
            (trimmed, None, false)
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(ConditionError::invalid_expression(expression));
        }
        Ok(Self {
            name: name.to_string(),
            value: value.map(|value| value.trim().to_string()),
            negated,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_satisfied_by(&self, actual: Option<&str>) -> bool {
        let matched = match (&self.value, actual) {
            (None, actual) => actual.is_some(),
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
        };
        matched != self.negated
    }

    fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

impl Display for NameValueExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.value, self.negated) {
            (Some(value), true) => write!(f, "{}!={}", self.name, value),
            (Some(value), false) => write!(f, "{}={}", self.name, value),
            (None, true) => write!(f, "!{}", self.name),
            (None, false) => write!(f, "{}", self.name),
        }
    }
}

fn compare_expressions(a: &[NameValueExpression], b: &[NameValueExpression]) -> Ordering {
    b.len().cmp(&a.len()).then_with(|| {
        let a_values = a.iter().filter(|e| e.has_value()).count();
        let b_values = b.iter().filter(|e| e.has_value()).count();
        b_values.cmp(&a_values)
    })
}

/// Query parameter expressions. All must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ParamsCondition {
    expressions: Vec<NameValueExpression>,
}

impl ParamsCondition {
    pub fn parse(expressions: &[impl AsRef<str>]) -> Result<Self, ConditionError> {
        let mut expressions = expressions
            .iter()
            .map(|expression| NameValueExpression::parse(expression.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        expressions.sort();
        expressions.dedup();
        Ok(Self { expressions })
    }

    pub fn expressions(&self) -> &[NameValueExpression] {
        &self.expressions
    }

    pub fn combine(&self, other: &Self) -> Self {
        let mut expressions = self.expressions.clone();
        expressions.extend(other.expressions.iter().cloned());
        expressions.sort();
        expressions.dedup();
        Self { expressions }
    }

    pub fn matching(&self, context: &RequestContext<'_>) -> Option<Self> {
        self.expressions
            .iter()
            .all(|expression| expression.is_satisfied_by(context.exchange.param(&expression.name)))
            .then(|| self.clone())
    }

    pub fn compare_to(&self, other: &Self, _context: &RequestContext<'_>) -> Ordering {
        compare_expressions(&self.expressions, &other.expressions)
    }
}

/// Request header expressions. Names are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeadersCondition {
    expressions: Vec<NameValueExpression>,
}

impl HeadersCondition {
    pub fn parse(expressions: &[impl AsRef<str>]) -> Result<Self, ConditionError> {
        let mut expressions = expressions
            .iter()
            .map(|expression| {
                NameValueExpression::parse(expression.as_ref()).map(|mut parsed| {
                    parsed.name = parsed.name.to_ascii_lowercase();
                    parsed
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        expressions.sort();
        expressions.dedup();
        Ok(Self { expressions })
    }

    pub fn combine(&self, other: &Self) -> Self {
        let mut expressions = self.expressions.clone();
        expressions.extend(other.expressions.iter().cloned());
        expressions.sort();
        expressions.dedup();
        Self { expressions }
    }

    pub fn matching(&self, context: &RequestContext<'_>) -> Option<Self> {
        if context.exchange.is_preflight() {
            return Some(Self::default());
        }
        self.expressions
            .iter()
            .all(|expression| expression.is_satisfied_by(context.exchange.header(&expression.name)))
            .then(|| self.clone())
    }

    pub fn compare_to(&self, other: &Self, _context: &RequestContext<'_>) -> Ordering {
        compare_expressions(&self.expressions, &other.expressions)
    }
}

/// A media type, optionally negated with a leading `!`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTypeExpression {
    media_type: MediaType,
    negated: bool,
}

impl MediaTypeExpression {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let trimmed = expression.trim();
        let (negated, value) = match trimmed.strip_prefix('!') {
            Some(value) => (true, value),
            None => (false, trimmed),
        };
        Ok(Self {
            media_type: value.parse()?,
            negated,
        })
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    fn sort_key(&self) -> String {
        format!("{}{}", if self.negated { "!" } else { "" }, self.media_type)
    }
}

impl Display for MediaTypeExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sort_key())
    }
}

fn parse_media_expressions(
    expressions: &[impl AsRef<str>],
) -> Result<Vec<MediaTypeExpression>, ConditionError> {
    let mut parsed = expressions
        .iter()
        .map(|expression| MediaTypeExpression::parse(expression.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    parsed.sort_by_key(MediaTypeExpression::sort_key);
    parsed.dedup();
    Ok(parsed)
}

/// Media types the handler can consume, checked against `Content-Type`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConsumesCondition {
    expressions: Vec<MediaTypeExpression>,
}

impl ConsumesCondition {
    pub fn parse(expressions: &[impl AsRef<str>]) -> Result<Self, ConditionError> {
        Ok(Self {
            expressions: parse_media_expressions(expressions)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn media_types(&self) -> Vec<&MediaType> {
        self.expressions
            .iter()
            .filter(|expression| !expression.negated)
            .map(|expression| &expression.media_type)
            .collect()
    }

    /// Method-level declarations replace type-level ones.
    pub fn combine(&self, other: &Self) -> Self {
        if other.expressions.is_empty() {
            self.clone()
        } else {
            other.clone()
        }
    }

    /// # Behavior
    /// A request without `Content-Type` is treated as `application/octet-stream`.
    pub fn matching(&self, context: &RequestContext<'_>) -> Option<Self> {
        if context.exchange.is_preflight() || self.expressions.is_empty() {
            return Some(Self::default());
        }
        let content_type: MediaType = context
            .exchange
            .content_type()
            .unwrap_or("application/octet-stream")
            .parse()
            .ok()?;
        let matching: Vec<MediaTypeExpression> = self
            .expressions
            .iter()
            .filter(|expression| expression.media_type.includes(&content_type) != expression.negated)
            .cloned()
            .collect();
        (!matching.is_empty()).then_some(Self {
            expressions: matching,
        })
    }

    pub fn compare_to(&self, other: &Self, _context: &RequestContext<'_>) -> Ordering {
        match (self.expressions.first(), other.expressions.first()) {
            (Some(a), Some(b)) => a.media_type.compare_specificity(&b.media_type),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// Media types the handler can produce, checked against `Accept`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProducesCondition {
    expressions: Vec<MediaTypeExpression>,
}

impl ProducesCondition {
    pub fn parse(expressions: &[impl AsRef<str>]) -> Result<Self, ConditionError> {
        Ok(Self {
            expressions: parse_media_expressions(expressions)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn media_types(&self) -> Vec<&MediaType> {
        self.expressions
            .iter()
            .filter(|expression| !expression.negated)
            .map(|expression| &expression.media_type)
            .collect()
    }

    /// Method-level declarations replace type-level ones.
    pub fn combine(&self, other: &Self) -> Self {
        if other.expressions.is_empty() {
            self.clone()
        } else {
            other.clone()
        }
    }

    pub fn matching(&self, context: &RequestContext<'_>) -> Option<Self> {
        if context.exchange.is_preflight() || self.expressions.is_empty() {
            return Some(Self::default());
        }
        let accepted = context.accepted_media_types();
        let matching: Vec<MediaTypeExpression> = self
            .expressions
            .iter()
            .filter(|expression| {
                accepted
                    .iter()
                    .any(|accept| accept.is_compatible_with(&expression.media_type))
                    != expression.negated
            })
            .cloned()
            .collect();
        (!matching.is_empty()).then_some(Self {
            expressions: matching,
        })
    }

    /// Position of the first accepted media type this condition can satisfy, and
    /// the expression that satisfies it.
    fn best_match(&self, accepted: &[MediaType]) -> (usize, MediaType) {
        let all = MediaType::all();
        for (index, accept) in accepted.iter().enumerate() {
            if self.expressions.is_empty() {
                if accept.is_compatible_with(&all) {
                    return (index, all);
                }
                continue;
            }
            if let Some(expression) = self
                .expressions
                .iter()
                .filter(|expression| !expression.negated)
                .find(|expression| accept.is_compatible_with(&expression.media_type))
            {
                return (index, expression.media_type.clone());
            }
        }
        (usize::MAX, all)
    }

    pub fn compare_to(&self, other: &Self, context: &RequestContext<'_>) -> Ordering {
        let accepted = context.accepted_media_types();
        let (self_index, self_type) = self.best_match(&accepted);
        let (other_index, other_type) = other.best_match(&accepted);
        self_index
            .cmp(&other_index)
            .then_with(|| self_type.compare_specificity(&other_type))
    }
}

impl Display for ConsumesCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", join(&self.expressions, " || "))
    }
}

impl Display for ProducesCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", join(&self.expressions, " || "))
    }
}

impl Display for ParamsCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", join(&self.expressions, " && "))
    }
}

impl Display for HeadersCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", join(&self.expressions, " && "))
    }
}
