//! Node keys - Global, stable identity for every node
//!
//! Format: `<type>/<id>`
//!
//! Examples:
//! - `user/42`
//! - `post/0192f3a4-7b1c-7d2e-9f00-1a2b3c4d5e6f`

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// Identity of one node: its type name plus an opaque id.
///
/// This key is the primary key of:
/// - The node cache
/// - Transactor write-sets
/// - Reference property values
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    /// Type (prototype) name
    pub type_name: String,
    /// Opaque id, unique within the type
    pub id: String,
}

impl NodeKey {
    /// Create a new NodeKey
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }

    /// Create a key with a fresh, time-ordered id
    pub fn generate(type_name: impl Into<String>) -> Self {
        Self::new(type_name, uuid::Uuid::now_v7().to_string())
    }

    /// Parse a key string into a NodeKey
    ///
    /// Expected format: `<type>/<id>`. The id may itself contain `/`.
    pub fn parse(key: &str) -> Result<Self> {
        let (type_name, id) = key.split_once('/')
            .ok_or_else(|| Error::InvalidKey(format!("key must be <type>/<id>: {}", key)))?;

        if type_name.is_empty() {
            return Err(Error::InvalidKey(format!("missing type name: {}", key)));
        }
        if id.is_empty() {
            return Err(Error::InvalidKey(format!("missing id: {}", key)));
        }

        Ok(Self::new(type_name, id))
    }

    /// Convert to key string
    pub fn to_key_string(&self) -> String {
        format!("{}/{}", self.type_name, self.id)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.type_name, self.id)
    }
}

impl FromStr for NodeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for NodeKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_key_string())
    }
}

impl<'de> Deserialize<'de> for NodeKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NodeKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        let key = NodeKey::parse("user/42").unwrap();
        assert_eq!(key.type_name, "user");
        assert_eq!(key.id, "42");
        assert_eq!(key.to_string(), "user/42");
    }

    #[test]
    fn test_id_may_contain_slash() {
        let key = NodeKey::parse("file/docs/readme").unwrap();
        assert_eq!(key.type_name, "file");
        assert_eq!(key.id, "docs/readme");
    }

    #[test]
    fn test_invalid_key() {
        assert!(NodeKey::parse("user").is_err());
        assert!(NodeKey::parse("/42").is_err());
        assert!(NodeKey::parse("user/").is_err());
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = NodeKey::generate("post");
        let b = NodeKey::generate("post");
        assert_ne!(a, b);
        assert_eq!(a.type_name, "post");
    }
}
