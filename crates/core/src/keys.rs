//! Composite condition keys.
//!
//! Keys are the primitive shared by the inverted index and the matcher. A key is
//! always one of three shapes: `taxonomy:slug`, `specific_item:<id>`, or the
//! not-equals sentinel. Construct keys only through the constructors below so
//! that both sides of a lookup agree on the exact string.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::item::{ItemId, TaxonomyTerm};

/// Attribute name that marks an explicit item-identity condition.
pub const SPECIFIC_ITEM: &str = "specific_item";

const SENTINEL: &str = "*:*";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionKey(String);

impl ConditionKey {
    /// Key for a membership of `slug` in `taxonomy`. Both parts are trimmed and lowercased.
    pub fn taxonomy(taxonomy: &str, slug: &str) -> Self {
        Self(format!(
            "{}:{}",
            taxonomy.trim().to_ascii_lowercase(),
            slug.trim().to_ascii_lowercase()
        ))
    }

    pub fn term(term: &TaxonomyTerm) -> Self {
        Self::taxonomy(&term.taxonomy, &term.slug)
    }

    pub fn item(item_id: ItemId) -> Self {
        Self(format!("{SPECIFIC_ITEM}:{}", item_id.0))
    }

    /// Key carried by every subject and by every rule with a `not_equals` condition.
    pub fn sentinel() -> Self {
        Self(SENTINEL.to_owned())
    }

    /// Rebuilds a key read back from storage. Returns `None` for strings no
    /// constructor could have produced.
    pub fn from_stored(raw: &str) -> Option<Self> {
        if raw == SENTINEL {
            return Some(Self::sentinel());
        }

        let (left, right) = raw.split_once(':')?;
        if left.is_empty() || right.is_empty() {
            return None;
        }
        if left == SPECIFIC_ITEM {
            return ItemId::parse(right).map(Self::item);
        }
        Some(Self::taxonomy(left, right))
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::ConditionKey;
    use crate::domain::item::ItemId;

    #[test]
    fn taxonomy_keys_are_normalized() {
        assert_eq!(ConditionKey::taxonomy(" Category ", "HandGuns").as_str(), "category:handguns");
    }

    #[test]
    fn item_and_sentinel_keys_have_fixed_shapes() {
        assert_eq!(ConditionKey::item(ItemId(42)).as_str(), "specific_item:42");
        assert!(ConditionKey::sentinel().is_sentinel());
        assert!(!ConditionKey::taxonomy("tag", "sale").is_sentinel());
    }

    #[test]
    fn stored_keys_round_trip_through_constructors() {
        for key in [
            ConditionKey::taxonomy("pa_color", "red"),
            ConditionKey::item(ItemId(7)),
            ConditionKey::sentinel(),
        ] {
            assert_eq!(ConditionKey::from_stored(key.as_str()), Some(key));
        }
    }

    #[test]
    fn malformed_stored_keys_are_rejected() {
        assert_eq!(ConditionKey::from_stored("no-separator"), None);
        assert_eq!(ConditionKey::from_stored(":slug"), None);
        assert_eq!(ConditionKey::from_stored("specific_item:abc"), None);
    }
}
