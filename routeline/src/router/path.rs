use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::iter::Filter;
use std::str::{FromStr, Split};
use thiserror::Error;

/// Variables captured by `{name}` segments.
pub type UriVariables = HashMap<String, String>;

/// Splits a path string into individual segments, filtering out empty segments.
///
/// # Parameters
/// - `path`: Path string to split (e.g., "/api/v1/users", "/health")
///
/// # Returns
/// An iterator over non-empty path segments. Leading and trailing slashes are ignored,
/// and consecutive slashes are treated as a single separator.
pub(crate) fn split_path(path: &str) -> Filter<Split<'_, char>, fn(&&str) -> bool> {
    path.split('/').filter(|s| !s.is_empty())
}

fn has_trailing_slash(path: &str) -> bool {
    path.len() > 1 && path.ends_with('/')
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Unclosed '{{' in pattern '{pattern}'.")]
    UnclosedCapture { pattern: String },

    #[error("Empty capture name in pattern '{pattern}'.")]
    EmptyCaptureName { pattern: String },

    #[error("Capture '{name}' appears more than once in pattern '{pattern}'.")]
    DuplicateCapture { pattern: String, name: String },

    #[error("Catch-all must be the last segment in pattern '{pattern}'.")]
    CatchAllNotLast { pattern: String },
}

impl PatternError {
    #[inline]
    pub(crate) fn unclosed_capture(pattern: impl Into<String>) -> Self {
        Self::UnclosedCapture {
            pattern: pattern.into(),
        }
    }

    #[inline]
    pub(crate) fn empty_capture_name(pattern: impl Into<String>) -> Self {
        Self::EmptyCaptureName {
            pattern: pattern.into(),
        }
    }

    #[inline]
    pub(crate) fn duplicate_capture(pattern: impl Into<String>, name: impl Into<String>) -> Self {
        Self::DuplicateCapture {
            pattern: pattern.into(),
            name: name.into(),
        }
    }

    #[inline]
    pub(crate) fn catch_all_not_last(pattern: impl Into<String>) -> Self {
        Self::CatchAllNotLast {
            pattern: pattern.into(),
        }
    }
}

/// Part of a segment that mixes literals with wildcards or captures (`file-?.txt`, `{name}.json`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SegmentPart {
    Literal(String),
    AnyChar,
    AnyRun,
    Capture(String),
}

/// A single `/`-delimited element of a [`PathPattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PatternSegment {
    /// Must match exactly.
    Literal(String),
    /// `*`: any one segment.
    Wildcard,
    /// `{name}`: any one segment, captured.
    Capture(String),
    /// A segment with embedded `?`, `*` or `{name}`.
    Compound(Vec<SegmentPart>),
    /// `**` or `{*name}`: the rest of the path. Only valid last.
    CatchAll(Option<String>),
}

impl PatternSegment {
    fn parse(segment: &str, pattern: &str) -> Result<Self, PatternError> {
        match segment {
            "*" => return Ok(PatternSegment::Wildcard),
            "**" => return Ok(PatternSegment::CatchAll(None)),
            _ => {}
        }
        if let Some(inner) = segment
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .filter(|inner| !inner.contains(['{', '}']))
        {
            if let Some(name) = inner.strip_prefix('*') {
                if name.is_empty() {
                    return Err(PatternError::empty_capture_name(pattern));
                }
                return Ok(PatternSegment::CatchAll(Some(name.to_string())));
            }
            if inner.is_empty() {
                return Err(PatternError::empty_capture_name(pattern));
            }
            return Ok(PatternSegment::Capture(inner.to_string()));
        }
        if !segment.contains(['*', '?', '{']) {
            return Ok(PatternSegment::Literal(segment.to_string()));
        }

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = segment.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' | '?' | '{' => {
                    if !literal.is_empty() {
                        parts.push(SegmentPart::Literal(std::mem::take(&mut literal)));
                    }
                    match c {
                        '*' => parts.push(SegmentPart::AnyRun),
                        '?' => parts.push(SegmentPart::AnyChar),
                        _ => {
                            let mut name = String::new();
                            let mut closed = false;
                            for c in chars.by_ref() {
                                if c == '}' {
                                    closed = true;
                                    break;
                                }
                                name.push(c);
                            }
                            if !closed {
                                return Err(PatternError::unclosed_capture(pattern));
                            }
                            if name.is_empty() {
                                return Err(PatternError::empty_capture_name(pattern));
                            }
                            parts.push(SegmentPart::Capture(name));
                        }
                    }
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(SegmentPart::Literal(literal));
        }
        Ok(PatternSegment::Compound(parts))
    }

    fn matches(&self, segment: &str, variables: &mut UriVariables) -> bool {
        match self {
            PatternSegment::Literal(literal) => literal == segment,
            PatternSegment::Wildcard => true,
            PatternSegment::Capture(name) => {
                variables.insert(name.clone(), segment.to_string());
                true
            }
            PatternSegment::Compound(parts) => match_parts(parts, segment, variables),
            PatternSegment::CatchAll(_) => true,
        }
    }
}

/// Backtracking match of compound segment parts against a single path segment.
///
/// Captures are bound only once the whole segment has matched.
fn match_parts(parts: &[SegmentPart], input: &str, variables: &mut UriVariables) -> bool {
    let mut captures = Vec::new();
    let mut failed = HashSet::new();
    if !match_parts_from(parts, input, 0, 0, &mut captures, &mut failed) {
        return false;
    }
    for (name, start, end) in captures {
        variables.insert(name.clone(), input[start..end].to_string());
    }
    true
}

/// Whether `parts[index..]` matches `input[offset..]`. A failed `(index, offset)`
/// fails again from any path that reaches it, so it is recorded in `failed`.
fn match_parts_from<'p>(
    parts: &'p [SegmentPart],
    input: &str,
    index: usize,
    offset: usize,
    captures: &mut Vec<(&'p String, usize, usize)>,
    failed: &mut HashSet<(usize, usize)>,
) -> bool {
    let Some(part) = parts.get(index) else {
        return offset == input.len();
    };
    if failed.contains(&(index, offset)) {
        return false;
    }
    let remaining = &input[offset..];
    let matched = match part {
        SegmentPart::Literal(literal) => {
            remaining.starts_with(literal.as_str())
                && match_parts_from(parts, input, index + 1, offset + literal.len(), captures, failed)
        }
        SegmentPart::AnyChar => remaining.chars().next().is_some_and(|c| {
            match_parts_from(parts, input, index + 1, offset + c.len_utf8(), captures, failed)
        }),
        SegmentPart::AnyRun | SegmentPart::Capture(_) => {
            let ends = remaining
                .char_indices()
                .map(|(i, _)| offset + i)
                .chain(std::iter::once(input.len()));
            let mut found = false;
            for end in ends {
                if match_parts_from(parts, input, index + 1, end, captures, failed) {
                    if let SegmentPart::Capture(name) = part {
                        captures.push((name, offset, end));
                    }
                    found = true;
                    break;
                }
            }
            found
        }
    };
    if !matched {
        failed.insert((index, offset));
    }
    matched
}

/// A parsed URL path pattern.
///
/// # Syntax
/// - `/users/list` literal segments
/// - `/users/*` any single segment
/// - `/users/{id}` any single segment, captured as `id`
/// - `/files/report-?.{ext}` `?` (one char), `*` and captures inside a segment
/// - `/static/**` or `/static/{*rest}` the rest of the path; only valid as the last segment
///
/// Patterns are compared by their source text, so `PathPattern` can be part of a
/// mapping key.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    segments: Vec<PatternSegment>,
    trailing_slash: bool,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let source = if pattern.is_empty() {
            "/".to_string()
        } else if pattern.starts_with('/') {
            pattern.to_string()
        } else {
            format!("/{}", pattern)
        };

        let raw_segments: Vec<&str> = split_path(&source).collect();
        let mut segments = Vec::with_capacity(raw_segments.len());
        for (index, raw) in raw_segments.iter().enumerate() {
            let segment = PatternSegment::parse(raw, &source)?;
            if matches!(segment, PatternSegment::CatchAll(_)) && index + 1 != raw_segments.len() {
                return Err(PatternError::catch_all_not_last(&source));
            }
            segments.push(segment);
        }

        let mut seen: Vec<&String> = Vec::new();
        for segment in &segments {
            for name in Self::segment_capture_names(segment) {
                if seen.contains(&name) {
                    return Err(PatternError::duplicate_capture(&source, name.as_str()));
                }
                seen.push(name);
            }
        }

        let trailing_slash = has_trailing_slash(&source);
        Ok(Self {
            source,
            segments,
            trailing_slash,
        })
    }

    fn segment_capture_names(segment: &PatternSegment) -> Vec<&String> {
        match segment {
            PatternSegment::Capture(name) | PatternSegment::CatchAll(Some(name)) => vec![name],
            PatternSegment::Compound(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    SegmentPart::Capture(name) => Some(name),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if the pattern contains anything other than literal segments.
    pub fn is_pattern(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| !matches!(segment, PatternSegment::Literal(_)))
    }

    fn has_catch_all(&self) -> bool {
        matches!(self.segments.last(), Some(PatternSegment::CatchAll(_)))
    }

    /// Matches a lookup path exactly (no trailing-slash leniency).
    pub fn matches(&self, path: &str) -> Option<UriVariables> {
        self.matches_with_trailing_slash(path, false)
    }

    /// Matches a lookup path.
    ///
    /// # Behavior
    /// With `trailing_slash_match`, a request path ending in `/` also matches a
    /// pattern that does not, so `/users/` matches `/users`. The reverse never
    /// matches. A catch-all swallows the remainder of the path, including
    /// nothing at all, and binds it (with a leading `/`) when it is named.
    pub fn matches_with_trailing_slash(
        &self,
        path: &str,
        trailing_slash_match: bool,
    ) -> Option<UriVariables> {
        let mut variables = UriVariables::new();
        let mut path_segments = split_path(path);
        for (index, pattern_segment) in self.segments.iter().enumerate() {
            if let PatternSegment::CatchAll(name) = pattern_segment {
                if let Some(name) = name {
                    let remainder: Vec<&str> = path_segments.by_ref().collect();
                    let mut captured = format!("/{}", remainder.join("/"));
                    if !remainder.is_empty() && has_trailing_slash(path) {
                        captured.push('/');
                    }
                    variables.insert(name.clone(), captured);
                }
                debug_assert_eq!(index + 1, self.segments.len());
                return Some(variables);
            }
            let segment = path_segments.next()?;
            if !pattern_segment.matches(segment, &mut variables) {
                return None;
            }
        }
        if path_segments.next().is_some() {
            return None;
        }
        let path_trailing = has_trailing_slash(path);
        if path_trailing == self.trailing_slash
            || (trailing_slash_match && path_trailing && !self.trailing_slash)
        {
            Some(variables)
        } else {
            None
        }
    }

    fn capture_count(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| Self::segment_capture_names(segment).len())
            .sum()
    }

    fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| match segment {
                PatternSegment::Wildcard | PatternSegment::CatchAll(None) => 1,
                PatternSegment::Compound(parts) => parts
                    .iter()
                    .filter(|part| matches!(part, SegmentPart::AnyRun))
                    .count(),
                _ => 0,
            })
            .sum()
    }

    /// Number of characters that constrain a match: literals and `?`, plus separators.
    fn literal_length(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| {
                1 + match segment {
                    PatternSegment::Literal(literal) => literal.chars().count(),
                    PatternSegment::Compound(parts) => parts
                        .iter()
                        .map(|part| match part {
                            SegmentPart::Literal(literal) => literal.chars().count(),
                            SegmentPart::AnyChar => 1,
                            _ => 0,
                        })
                        .sum(),
                    _ => 0,
                }
            })
            .sum()
    }

    fn score(&self) -> usize {
        self.capture_count() + 100 * self.wildcard_count()
    }

    /// Orders patterns from most to least specific. `Less` means `self` is more specific.
    ///
    /// # Behavior
    /// 1. A pattern identical to the lookup path wins.
    /// 2. Patterns ending in a catch-all sort after those that do not.
    /// 3. Lower `captures + 100 * wildcards` score wins.
    /// 4. Longer literal length wins.
    pub fn compare_specificity(&self, other: &PathPattern, lookup_path: &str) -> Ordering {
        let self_exact = self.source == lookup_path;
        let other_exact = other.source == lookup_path;
        match (self_exact, other_exact) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        self.has_catch_all()
            .cmp(&other.has_catch_all())
            .then_with(|| self.score().cmp(&other.score()))
            .then_with(|| other.literal_length().cmp(&self.literal_length()))
    }

    /// Joins a type-level pattern with a method-level pattern.
    ///
    /// # Behavior
    /// A trailing `/*` or `/**` on `self` is replaced by `other`; otherwise the two
    /// are joined with exactly one `/` between them.
    pub fn combine(&self, other: &PathPattern) -> Result<PathPattern, PatternError> {
        let base = self.source.as_str();
        let base = base
            .strip_suffix("/**")
            .or_else(|| base.strip_suffix("/*"))
            .unwrap_or(base);
        let base = base.trim_end_matches('/');
        let tail = other.source.trim_start_matches('/');
        if tail.is_empty() {
            return PathPattern::parse(if base.is_empty() { "/" } else { base });
        }
        PathPattern::parse(&format!("{}/{}", base, tail))
    }
}

impl FromStr for PathPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathPattern::parse(s)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl Hash for PathPattern {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl PartialOrd for PathPattern {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathPattern {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source.cmp(&other.source)
    }
}

impl Display for PathPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}
