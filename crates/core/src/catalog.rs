//! Catalog adapter seam.
//!
//! The catalog store (items, taxonomy memberships, prices, stock and publish
//! state) lives outside this workspace. The engine reaches it only through
//! [`CatalogAdapter`]; [`InMemoryCatalog`] is the reference implementation used
//! by tests and embedders without a live store.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::action::ResultOrder;
use crate::domain::item::{CatalogItem, ItemId, TaxonomyTerm, TermId};
use crate::domain::rule::PriceRange;
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown catalog item {0}")]
    UnknownItem(ItemId),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl From<CatalogError> for ApplicationError {
    fn from(value: CatalogError) -> Self {
        Self::Integration(value.to_string())
    }
}

/// Taxonomy-backed item query. Only published items are ever returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemQuery {
    pub taxonomy: String,
    /// Accepted term slugs; empty means any term of `taxonomy`.
    pub slugs: Vec<String>,
    pub exclude_ids: Vec<ItemId>,
    pub in_stock_only: bool,
    pub price_range: Option<PriceRange>,
    pub order: ResultOrder,
    pub limit: usize,
}

impl ItemQuery {
    pub fn new(taxonomy: impl Into<String>, slugs: Vec<String>) -> Self {
        Self {
            taxonomy: taxonomy.into(),
            slugs,
            exclude_ids: Vec::new(),
            in_stock_only: false,
            price_range: None,
            order: ResultOrder::default(),
            limit: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemFilter {
    pub published_only: bool,
    pub in_stock_only: bool,
}

impl ItemFilter {
    pub fn live(in_stock_only: bool) -> Self {
        Self { published_only: true, in_stock_only }
    }

    pub fn any() -> Self {
        Self { published_only: false, in_stock_only: false }
    }
}

#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    async fn taxonomy_memberships(&self, item_id: ItemId)
        -> Result<Vec<TaxonomyTerm>, CatalogError>;

    async fn price(&self, item_id: ItemId) -> Result<Option<Decimal>, CatalogError>;

    async fn is_in_stock(&self, item_id: ItemId) -> Result<bool, CatalogError>;

    async fn find_term(
        &self,
        taxonomy: &str,
        slug: &str,
    ) -> Result<Option<TaxonomyTerm>, CatalogError>;

    /// All transitive descendants of `term_id`, excluding the term itself.
    async fn descendant_terms(
        &self,
        taxonomy: &str,
        term_id: TermId,
    ) -> Result<Vec<TaxonomyTerm>, CatalogError>;

    async fn query_items(&self, query: &ItemQuery) -> Result<Vec<ItemId>, CatalogError>;

    /// Resolves ids to records, preserving input order and dropping ids that
    /// do not exist or fail `filter`.
    async fn resolve_items(
        &self,
        ids: &[ItemId],
        filter: ItemFilter,
    ) -> Result<Vec<CatalogItem>, CatalogError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    terms: Vec<TaxonomyTerm>,
    items: Vec<CatalogItem>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a term, creating it under `parent_slug` (same taxonomy) when given.
    /// A known root term is attached to `parent_slug`; a known parent is never replaced.
    pub fn add_term(&mut self, taxonomy: &str, slug: &str, parent_slug: Option<&str>) -> TermId {
        let parent_slug = parent_slug.filter(|parent| !parent.eq_ignore_ascii_case(slug));
        let parent = parent_slug.map(|parent| self.add_term(taxonomy, parent, None));

        if let Some(existing) = self.terms.iter().find(|term| {
            term.taxonomy.eq_ignore_ascii_case(taxonomy) && term.slug.eq_ignore_ascii_case(slug)
        }) {
            let id = existing.id;
            if existing.parent.is_none() && parent.is_some_and(|parent| !self.is_within(parent, id)) {
                self.set_parent(id, parent);
            }
            return id;
        }

        let id = TermId(self.terms.len() as u64 + 1);
        self.terms.push(TaxonomyTerm {
            id,
            taxonomy: taxonomy.to_ascii_lowercase(),
            slug: slug.to_ascii_lowercase(),
            parent,
        });
        id
    }

    pub fn term(&self, taxonomy: &str, slug: &str) -> Option<&TaxonomyTerm> {
        self.terms.iter().find(|term| {
            term.taxonomy.eq_ignore_ascii_case(taxonomy) && term.slug.eq_ignore_ascii_case(slug)
        })
    }

    /// Adds a published, in-stock item. Unknown terms are registered as roots.
    pub fn add_item(
        &mut self,
        id: u64,
        name: &str,
        price: Decimal,
        memberships: &[(&str, &str)],
    ) -> &mut CatalogItem {
        let terms = memberships
            .iter()
            .map(|(taxonomy, slug)| {
                let term_id = self.add_term(taxonomy, slug, None);
                self.terms[(term_id.0 - 1) as usize].clone()
            })
            .collect();

        self.items.retain(|item| item.id != ItemId(id));
        self.items.push(CatalogItem {
            id: ItemId(id),
            name: name.to_owned(),
            price: Some(price),
            in_stock: true,
            published: true,
            terms,
            total_sales: 0,
            average_rating: 0,
            created_at: Utc::now(),
        });
        let last = self.items.len() - 1;
        &mut self.items[last]
    }

    fn item(&self, item_id: ItemId) -> Result<&CatalogItem, CatalogError> {
        self.items.iter().find(|item| item.id == item_id).ok_or(CatalogError::UnknownItem(item_id))
    }

    /// Whether `term_id` is `ancestor` or sits somewhere below it.
    fn is_within(&self, term_id: TermId, ancestor: TermId) -> bool {
        let mut current = Some(term_id);
        let mut hops = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.terms.len() {
                return false;
            }
            current = self.terms.iter().find(|term| term.id == id).and_then(|term| term.parent);
        }
        false
    }

    fn set_parent(&mut self, term_id: TermId, parent: Option<TermId>) {
        if let Some(term) = self.terms.iter_mut().find(|term| term.id == term_id) {
            term.parent = parent;
        }
    }

    fn descendants_of(&self, taxonomy: &str, term_id: TermId) -> Vec<TaxonomyTerm> {
        let mut found = Vec::new();
        let mut seen = HashSet::from([term_id]);
        let mut queue = VecDeque::from([term_id]);

        while let Some(parent) = queue.pop_front() {
            for term in &self.terms {
                if term.parent == Some(parent)
                    && term.taxonomy.eq_ignore_ascii_case(taxonomy)
                    && seen.insert(term.id)
                {
                    found.push(term.clone());
                    queue.push_back(term.id);
                }
            }
        }
        found
    }
}

fn sort_items(items: &mut [&CatalogItem], order: ResultOrder) {
    match order {
        ResultOrder::Random => items.shuffle(&mut rand::thread_rng()),
        ResultOrder::Newest => {
            items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)))
        }
        ResultOrder::PriceAsc => items.sort_by(|a, b| {
            let (a_price, b_price) = (a.price.unwrap_or(Decimal::MAX), b.price.unwrap_or(Decimal::MAX));
            a_price.cmp(&b_price).then_with(|| a.id.cmp(&b.id))
        }),
        ResultOrder::PriceDesc => items.sort_by(|a, b| {
            let (a_price, b_price) = (a.price.unwrap_or(Decimal::MIN), b.price.unwrap_or(Decimal::MIN));
            b_price.cmp(&a_price).then_with(|| a.id.cmp(&b.id))
        }),
        ResultOrder::Bestselling => {
            items.sort_by(|a, b| b.total_sales.cmp(&a.total_sales).then_with(|| a.id.cmp(&b.id)))
        }
        ResultOrder::Rating => items
            .sort_by(|a, b| b.average_rating.cmp(&a.average_rating).then_with(|| a.id.cmp(&b.id))),
    }
}

#[async_trait]
impl CatalogAdapter for InMemoryCatalog {
    async fn taxonomy_memberships(
        &self,
        item_id: ItemId,
    ) -> Result<Vec<TaxonomyTerm>, CatalogError> {
        Ok(self.item(item_id)?.terms.clone())
    }

    async fn price(&self, item_id: ItemId) -> Result<Option<Decimal>, CatalogError> {
        Ok(self.item(item_id)?.price)
    }

    async fn is_in_stock(&self, item_id: ItemId) -> Result<bool, CatalogError> {
        Ok(self.item(item_id)?.in_stock)
    }

    async fn find_term(
        &self,
        taxonomy: &str,
        slug: &str,
    ) -> Result<Option<TaxonomyTerm>, CatalogError> {
        Ok(self.term(taxonomy, slug).cloned())
    }

    async fn descendant_terms(
        &self,
        taxonomy: &str,
        term_id: TermId,
    ) -> Result<Vec<TaxonomyTerm>, CatalogError> {
        Ok(self.descendants_of(taxonomy, term_id))
    }

    async fn query_items(&self, query: &ItemQuery) -> Result<Vec<ItemId>, CatalogError> {
        let excluded: HashSet<ItemId> = query.exclude_ids.iter().copied().collect();
        let mut matches = self
            .items
            .iter()
            .filter(|item| item.published && !excluded.contains(&item.id))
            .filter(|item| !query.in_stock_only || item.in_stock)
            .filter(|item| {
                item.terms.iter().any(|term| {
                    term.taxonomy.eq_ignore_ascii_case(&query.taxonomy)
                        && (query.slugs.is_empty()
                            || query.slugs.iter().any(|slug| slug.eq_ignore_ascii_case(&term.slug)))
                })
            })
            .filter(|item| match (query.price_range, item.price) {
                (Some(range), Some(price)) => range.contains(price),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect::<Vec<_>>();

        sort_items(&mut matches, query.order);
        Ok(matches.into_iter().take(query.limit).map(|item| item.id).collect())
    }

    async fn resolve_items(
        &self,
        ids: &[ItemId],
        filter: ItemFilter,
    ) -> Result<Vec<CatalogItem>, CatalogError> {
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.items.iter().find(|item| item.id == *id))
            .filter(|item| !filter.published_only || item.published)
            .filter(|item| !filter.in_stock_only || item.in_stock)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{CatalogAdapter, CatalogError, InMemoryCatalog, ItemFilter, ItemQuery};
    use crate::domain::action::ResultOrder;
    use crate::domain::item::ItemId;
    use crate::domain::rule::PriceRange;

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_term("category", "firearms", None);
        catalog.add_term("category", "handguns", Some("firearms"));
        catalog.add_term("category", "compact", Some("handguns"));
        catalog.add_item(1, "Compact 9", Decimal::new(49_900, 2), &[("category", "compact")]).total_sales =
            40;
        catalog.add_item(2, "Service 9", Decimal::new(59_900, 2), &[("category", "handguns")]).total_sales =
            90;
        catalog.add_item(3, "Range Bag", Decimal::new(4_900, 2), &[("category", "bags")]).in_stock = false;
        catalog
    }

    #[tokio::test]
    async fn descendant_terms_are_transitive() {
        let catalog = catalog();
        let root = catalog.term("category", "firearms").expect("root term").id;

        let descendants = catalog.descendant_terms("category", root).await.expect("descendants");
        let slugs: Vec<_> = descendants.iter().map(|term| term.slug.as_str()).collect();

        assert_eq!(slugs, vec!["handguns", "compact"]);
    }

    #[tokio::test]
    async fn late_parent_registration_attaches_existing_roots() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_item(5, "Red Dot", Decimal::new(19_900, 2), &[("category", "optics")]);
        catalog.add_term("category", "accessories", None);
        catalog.add_term("category", "optics", Some("accessories"));
        catalog.add_term("category", "optics", Some("firearms"));
        catalog.add_term("category", "accessories", Some("optics"));

        let accessories = catalog.term("category", "accessories").expect("accessories").id;
        let optics = catalog.term("category", "optics").expect("optics");
        assert_eq!(optics.parent, Some(accessories));
        assert_eq!(catalog.term("category", "accessories").expect("accessories").parent, None);

        let descendants = catalog.descendant_terms("category", accessories).await.expect("descendants");
        let slugs: Vec<_> = descendants.iter().map(|term| term.slug.as_str()).collect();
        assert_eq!(slugs, vec!["optics"]);
    }

    #[tokio::test]
    async fn query_orders_and_limits_results() {
        let catalog = catalog();
        let mut query =
            ItemQuery::new("category", vec!["handguns".to_owned(), "compact".to_owned()]);
        query.order = ResultOrder::Bestselling;

        assert_eq!(catalog.query_items(&query).await.expect("query"), vec![ItemId(2), ItemId(1)]);

        query.order = ResultOrder::PriceAsc;
        query.limit = 1;
        assert_eq!(catalog.query_items(&query).await.expect("query"), vec![ItemId(1)]);

        query.limit = 10;
        query.price_range = Some(PriceRange::between(Decimal::new(55_000, 2), Decimal::new(65_000, 2)));
        assert_eq!(catalog.query_items(&query).await.expect("query"), vec![ItemId(2)]);
    }

    #[tokio::test]
    async fn resolve_preserves_order_and_applies_filter() {
        let catalog = catalog();
        let ids = [ItemId(3), ItemId(2), ItemId(99), ItemId(2), ItemId(1)];

        let live = catalog.resolve_items(&ids, ItemFilter::live(true)).await.expect("resolve");
        assert_eq!(live.iter().map(|item| item.id).collect::<Vec<_>>(), vec![ItemId(2), ItemId(1)]);

        let any = catalog.resolve_items(&ids, ItemFilter::any()).await.expect("resolve");
        assert_eq!(any.len(), 3);
    }

    #[tokio::test]
    async fn unknown_items_are_reported() {
        let catalog = catalog();
        assert_eq!(
            catalog.taxonomy_memberships(ItemId(404)).await,
            Err(CatalogError::UnknownItem(ItemId(404)))
        );
    }
}
