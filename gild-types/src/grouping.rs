use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Key whose value names the corpus a grouping belongs to.
pub const SOURCE_TYPE_KEY: &str = "source_type";
/// Key whose value names the test a grouping belongs to.
pub const NAME_KEY: &str = "name";

/// Returns true for a well-formed digest: exactly 32 lowercase hex
/// characters.
pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == 32
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// The key subset that partitions data into comparable buckets, at minimum
/// `source_type` (corpus) and `name` (test). Keys are kept sorted so the
/// canonical JSON used for [`Grouping::id`] falls out of serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grouping(BTreeMap<String, String>);

impl Grouping {
    pub fn new(corpus: impl Into<String>, test: impl Into<String>) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(SOURCE_TYPE_KEY.to_owned(), corpus.into());
        keys.insert(NAME_KEY.to_owned(), test.into());
        Self(keys)
    }

    pub fn from_keys(keys: BTreeMap<String, String>) -> Self {
        Self(keys)
    }

    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.get(NAME_KEY).map(String::as_str).unwrap_or_default()
    }

    pub fn corpus(&self) -> &str {
        self.0.get(SOURCE_TYPE_KEY).map(String::as_str).unwrap_or_default()
    }

    /// MD5 of the canonical (sorted-key) JSON of the keys.
    pub fn id(&self) -> GroupingId {
        let canonical = serde_json::to_string(&self.0).expect("string map serialization cannot fail");
        GroupingId(md5::compute(canonical.as_bytes()).0)
    }
}

/// Stable identifier of a grouping; renders as 32 lowercase hex characters
/// and crosses into the relational store as its 16 raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupingId(pub [u8; 16]);

#[derive(Debug, Error)]
pub enum GroupingIdError {
    #[error("grouping id must be 16 bytes, got {0}")]
    WrongLength(usize),
}

impl GroupingId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GroupingIdError> {
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| GroupingIdError::WrongLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for GroupingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_id_ignores_insertion_order() {
        let mut forward = BTreeMap::new();
        forward.insert("source_type".to_owned(), "round".to_owned());
        forward.insert("name".to_owned(), "circle".to_owned());
        let mut backward = BTreeMap::new();
        backward.insert("name".to_owned(), "circle".to_owned());
        backward.insert("source_type".to_owned(), "round".to_owned());

        assert_eq!(
            Grouping::from_keys(forward).id(),
            Grouping::from_keys(backward).id()
        );
    }

    #[test]
    fn grouping_id_renders_as_32_hex() {
        let id = Grouping::new("round", "circle").id();
        let hex = id.to_string();
        assert_eq!(hex.len(), 32);
        assert!(is_valid_digest(&hex));
        assert_eq!(GroupingId::from_bytes(id.as_bytes()).unwrap(), id);
    }

    #[test]
    fn extra_keys_change_the_id() {
        let plain = Grouping::new("round", "circle");
        let mut keys = plain.keys().clone();
        keys.insert("color_space".to_owned(), "srgb".to_owned());
        assert_ne!(plain.id(), Grouping::from_keys(keys).id());
    }

    #[test]
    fn digest_validation() {
        assert!(is_valid_digest("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_digest("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_digest("0123456789abcdef"));
        assert!(!is_valid_digest("g123456789abcdef0123456789abcdef"));
        assert!(!is_valid_digest(""));
    }
}
