//! Read-only access to precomputed affinity lists (co-purchase, trending).
//!
//! The batch jobs that fill these lists run elsewhere; a missing list is a
//! soft miss and is reported as an empty vector, never as an error.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::catalog::CatalogError;
use crate::domain::item::ItemId;

#[async_trait]
pub trait AffinitySource: Send + Sync {
    /// Items frequently bought together with `item_id`, best candidates first.
    async fn copurchased(&self, item_id: ItemId) -> Result<Vec<ItemId>, CatalogError>;

    /// Trending items for a category slug, or store-wide when `category` is `None`.
    async fn trending(&self, category: Option<&str>) -> Result<Vec<ItemId>, CatalogError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAffinitySource {
    copurchase: HashMap<ItemId, Vec<ItemId>>,
    trending_by_category: HashMap<String, Vec<ItemId>>,
    global_trending: Vec<ItemId>,
}

impl InMemoryAffinitySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_copurchase(mut self, item_id: ItemId, candidates: Vec<ItemId>) -> Self {
        self.copurchase.insert(item_id, candidates);
        self
    }

    pub fn with_category_trending(mut self, category: &str, candidates: Vec<ItemId>) -> Self {
        self.trending_by_category.insert(category.to_ascii_lowercase(), candidates);
        self
    }

    pub fn with_global_trending(mut self, candidates: Vec<ItemId>) -> Self {
        self.global_trending = candidates;
        self
    }
}

#[async_trait]
impl AffinitySource for InMemoryAffinitySource {
    async fn copurchased(&self, item_id: ItemId) -> Result<Vec<ItemId>, CatalogError> {
        Ok(self.copurchase.get(&item_id).cloned().unwrap_or_default())
    }

    async fn trending(&self, category: Option<&str>) -> Result<Vec<ItemId>, CatalogError> {
        Ok(match category {
            Some(category) => self
                .trending_by_category
                .get(&category.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default(),
            None => self.global_trending.clone(),
        })
    }
}
