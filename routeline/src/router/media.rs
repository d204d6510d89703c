use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaTypeError {
    #[error("Invalid media type '{value}'.")]
    Invalid { value: String },
}

impl MediaTypeError {
    #[inline]
    pub(crate) fn invalid(value: impl Into<String>) -> Self {
        Self::Invalid {
            value: value.into(),
        }
    }
}

/// A `type/subtype` media type. Parameters other than `q` are dropped.
#[derive(Debug, Clone)]
pub struct MediaType {
    main_type: String,
    subtype: String,
    quality: f32,
}

impl MediaType {
    pub fn all() -> Self {
        Self {
            main_type: "*".to_string(),
            subtype: "*".to_string(),
            quality: 1.0,
        }
    }

    pub fn main_type(&self) -> &str {
        &self.main_type
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    pub fn is_wildcard_type(&self) -> bool {
        self.main_type == "*"
    }

    pub fn is_wildcard_subtype(&self) -> bool {
        self.subtype == "*" || self.subtype.starts_with("*+")
    }

    fn suffix(&self) -> Option<&str> {
        self.subtype.rsplit_once('+').map(|(_, suffix)| suffix)
    }

    /// True if `other` falls within this media type (`text/*` includes `text/plain`).
    pub fn includes(&self, other: &MediaType) -> bool {
        if self.is_wildcard_type() {
            return true;
        }
        if self.main_type != other.main_type {
            return false;
        }
        if self.subtype == other.subtype || self.subtype == "*" {
            return true;
        }
        // application/*+json includes application/vnd.api+json
        if let Some(suffix) = self.subtype.strip_prefix("*+") {
            return other.suffix() == Some(suffix);
        }
        false
    }

    /// True if either media type includes the other.
    pub fn is_compatible_with(&self, other: &MediaType) -> bool {
        self.includes(other) || other.includes(self)
    }

    /// Orders concrete types before subtype wildcards before `*/*`. `Less` is more specific.
    pub fn compare_specificity(&self, other: &MediaType) -> Ordering {
        let rank = |media_type: &MediaType| {
            if media_type.is_wildcard_type() {
                2
            } else if media_type.is_wildcard_subtype() {
                1
            } else {
                0
            }
        };
        rank(self).cmp(&rank(other))
    }

    /// Parses a comma-separated header value, ignoring invalid entries.
    pub fn parse_list(value: &str) -> Vec<MediaType> {
        value
            .split(',')
            .filter_map(|entry| entry.trim().parse().ok())
            .collect()
    }

    /// Sorts by quality (highest first), then by specificity.
    pub fn sort_by_quality_and_specificity(media_types: &mut [MediaType]) {
        media_types.sort_by(|a, b| {
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.compare_specificity(b))
        });
    }
}

impl FromStr for MediaType {
    type Err = MediaTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parameters = s.split(';');
        let essence = parameters.next().unwrap_or_default().trim();
        let essence = if essence == "*" { "*/*" } else { essence };
        let Some((main_type, subtype)) = essence.split_once('/') else {
            return Err(MediaTypeError::invalid(s));
        };
        if main_type.is_empty() || subtype.is_empty() || subtype.contains('/') {
            return Err(MediaTypeError::invalid(s));
        }
        if main_type == "*" && subtype != "*" {
            return Err(MediaTypeError::invalid(s));
        }
        let mut quality = 1.0;
        for parameter in parameters {
            if let Some((name, value)) = parameter.split_once('=') {
                if name.trim().eq_ignore_ascii_case("q") {
                    quality = value
                        .trim()
                        .parse::<f32>()
                        .map_err(|_| MediaTypeError::invalid(s))?;
                }
            }
        }
        Ok(Self {
            main_type: main_type.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            quality,
        })
    }
}

impl PartialEq for MediaType {
    fn eq(&self, other: &Self) -> bool {
        self.main_type == other.main_type && self.subtype == other.subtype
    }
}

impl Eq for MediaType {}

impl std::hash::Hash for MediaType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.main_type.hash(state);
        self.subtype.hash(state);
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.main_type, self.subtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(value: &str) -> MediaType {
        value.parse().unwrap()
    }

    #[test]
    fn test_parse() {
        let json = media("Application/JSON; charset=utf-8");
        assert_eq!(json.to_string(), "application/json");
        assert_eq!(media("text/html;q=0.5").quality(), 0.5);
        assert_eq!(media("*").to_string(), "*/*");
        assert!("json".parse::<MediaType>().is_err());
        assert!("*/json".parse::<MediaType>().is_err());
    }

    #[test]
    fn test_includes() {
        assert!(media("*/*").includes(&media("text/plain")));
        assert!(media("text/*").includes(&media("text/plain")));
        assert!(!media("text/plain").includes(&media("text/*")));
        assert!(media("text/plain").is_compatible_with(&media("text/*")));
        assert!(media("application/*+json").includes(&media("application/vnd.api+json")));
        assert!(!media("application/*+json").includes(&media("application/xml")));
    }

    #[test]
    fn test_sort_by_quality() {
        let mut accepted = MediaType::parse_list("text/*;q=0.8, */*;q=0.1, text/html, application/json");
        MediaType::sort_by_quality_and_specificity(&mut accepted);
        let order: Vec<String> = accepted.iter().map(ToString::to_string).collect();
        assert_eq!(order, vec!["text/html", "application/json", "text/*", "*/*"]);
    }
}
