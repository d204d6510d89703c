use fnv::FnvHasher;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Request-scoped attribute names written by the mapping and dispatch layers.
pub mod names {
    /// The handler the resolver selected for this request.
    pub const BEST_MATCHING_HANDLER: &str = "routeline.bestMatchingHandler";
    /// The mapping key that won resolution, narrowed to what matched.
    pub const BEST_MATCHING_MAPPING: &str = "routeline.bestMatchingMapping";
    /// The path pattern of the winning mapping.
    pub const BEST_MATCHING_PATTERN: &str = "routeline.bestMatchingPattern";
    /// The lookup path the mapping matched against.
    pub const PATH_WITHIN_MAPPING: &str = "routeline.pathWithinHandlerMapping";
    /// Variables captured by `{name}` segments of the winning pattern.
    pub const URI_TEMPLATE_VARIABLES: &str = "routeline.uriTemplateVariables";
    /// The error that an exception resolver turned into a response.
    pub const EXCEPTION: &str = "routeline.exception";
}

/// Named, typed values attached to an exchange for the lifetime of a request.
///
/// Values are keyed by both the name and the stored type, so the same name can
/// hold values of different types without clobbering one another.
#[derive(Default)]
pub struct Attributes {
    attributes: HashMap<AttributeKey, Box<dyn Any + Send + Sync>, fnv::FnvBuildHasher>,
}

impl Attributes {
    pub fn new() -> Self {
        Self {
            attributes: HashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    pub fn insert<K>(&mut self, key: impl AsRef<str>, value: K)
    where
        K: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<K>();
        self.attributes
            .insert(AttributeKey::new(key, type_id), Box::new(value));
    }

    pub fn get<K>(&self, key: impl AsRef<str>) -> Option<&K>
    where
        K: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<K>();
        self.attributes
            .get(&AttributeKey::new(key, type_id))
            .and_then(|value| value.downcast_ref::<K>())
    }

    pub fn get_mut<K>(&mut self, key: impl AsRef<str>) -> Option<&mut K>
    where
        K: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<K>();
        self.attributes
            .get_mut(&AttributeKey::new(key, type_id))
            .and_then(|value| value.downcast_mut::<K>())
    }

    pub fn remove<K>(&mut self, key: impl AsRef<str>) -> Option<K>
    where
        K: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<K>();
        let boxed = self.attributes.remove(&AttributeKey::new(key, type_id))?;
        boxed.downcast::<K>().ok().map(|value| *value)
    }

    pub fn contains<K>(&self, key: impl AsRef<str>) -> bool
    where
        K: Send + Sync + 'static,
    {
        self.get::<K>(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[derive(PartialOrd, PartialEq, Hash, Eq)]
struct AttributeKey {
    key_hash: u64,
    type_hash: u64,
}

impl AttributeKey {
    fn new(key: impl AsRef<str>, type_id: TypeId) -> Self {
        let mut key_hasher = FnvHasher::default();
        key.as_ref().hash(&mut key_hasher);
        let key_hash = key_hasher.finish();

        let mut type_hasher = FnvHasher::default();
        type_id.hash(&mut type_hasher);
        let type_hash = type_hasher.finish();

        Self {
            key_hash,
            type_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    #[test]
    fn test_attributes() {
        let mut attributes = Attributes::new();
        attributes.insert::<u64>("count", 1);
        attributes.insert::<String>("name", String::from("test"));
        attributes.insert::<bool>("flag", true);
        attributes.insert::<Marker>("marker", Marker);

        assert_eq!(attributes.get::<u64>("count"), Some(&1));
        assert_eq!(attributes.get::<String>("name").map(String::as_str), Some("test"));
        assert!(attributes.contains::<bool>("flag"));
        assert!(attributes.get::<Marker>("marker").is_some());
        assert_eq!(attributes.len(), 4);
    }

    #[test]
    fn test_same_name_different_types() {
        let mut attributes = Attributes::new();
        attributes.insert::<u32>("value", 7);
        attributes.insert::<String>("value", "seven".to_string());
        assert_eq!(attributes.get::<u32>("value"), Some(&7));
        assert_eq!(attributes.get::<String>("value").map(String::as_str), Some("seven"));

        *attributes.get_mut::<u32>("value").unwrap() += 1;
        assert_eq!(attributes.remove::<u32>("value"), Some(8));
        assert!(attributes.get::<u32>("value").is_none());
        assert!(attributes.get::<String>("value").is_some());
    }
}
