use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::CacheError;

/// A canonical key built from the ordered arguments of a cached call.
///
/// The arguments are serialized as a JSON array, so the same arguments in the same order always
/// produce the same key, and `("a", "bc")` never collides with `("ab", "c")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key from a tuple, slice or any other value serializing to a JSON array.
    pub fn from_args<A: Serialize + ?Sized>(args: &A) -> Result<Self, CacheError> {
        let key = serde_json::to_string(args)?;
        Ok(Self(key.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_order_sensitive() {
        let ab = CacheKey::from_args(&("a", "b")).unwrap();
        let ba = CacheKey::from_args(&("b", "a")).unwrap();
        assert_ne!(ab, ba);
        assert_eq!(ab, CacheKey::from_args(&["a", "b"]).unwrap());
        assert_eq!(ab.as_str(), r#"["a","b"]"#);
    }

    #[test]
    fn test_key_separates_arguments() {
        let left = CacheKey::from_args(&("a", "bc")).unwrap();
        let right = CacheKey::from_args(&("ab", "c")).unwrap();
        assert_ne!(left, right);
    }
}
