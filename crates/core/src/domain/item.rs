use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Catalog item identifier as issued by the catalog store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl ItemId {
    /// Parses a single id, tolerating surrounding whitespace. Zero is not a valid id.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<u64>().ok().filter(|id| *id > 0).map(Self)
    }

    /// Parses a comma-separated id list, silently dropping malformed entries.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split(',').filter_map(Self::parse).collect()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TermId(pub u64);

/// A term inside a hierarchical or flat taxonomy (`category`, `tag`, `pa_color`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxonomyTerm {
    pub id: TermId,
    pub taxonomy: String,
    pub slug: String,
    pub parent: Option<TermId>,
}

/// Well-known taxonomy names used by action sources and exclusion filters.
pub mod taxonomy {
    pub const CATEGORY: &str = "category";
    pub const TAG: &str = "tag";
}

/// Item record as resolved from the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: ItemId,
    pub name: String,
    pub price: Option<Decimal>,
    pub in_stock: bool,
    pub published: bool,
    pub terms: Vec<TaxonomyTerm>,
    pub total_sales: u64,
    /// Average rating in hundredths of a star (450 = 4.5 stars).
    pub average_rating: u32,
    pub created_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn category_slugs(&self) -> impl Iterator<Item = &str> {
        self.terms
            .iter()
            .filter(|term| term.taxonomy == taxonomy::CATEGORY)
            .map(|term| term.slug.as_str())
    }
}
