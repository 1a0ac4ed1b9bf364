//! Runs a winning rule's action groups and merges their results.
//!
//! Actions inside a group intersect (first action's order kept), groups
//! union in order. Every action source maps to exactly one strategy, chosen
//! by a single `match` on the source.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use upsell_core::affinity::AffinitySource;
use upsell_core::cache::TtlCache;
use upsell_core::catalog::{CatalogAdapter, ItemFilter, ItemQuery};
use upsell_core::config::EngineConfig;
use upsell_core::domain::action::{Action, ActionGroup, ActionSource, ResultOrder};
use upsell_core::domain::item::{taxonomy, ItemId};
use upsell_core::domain::rule::{PriceRange, Rule};
use upsell_core::errors::ApplicationError;
use upsell_core::evaluation::{is_excluded, SubjectProfile};

use crate::profile::expand_slug;

/// Caller-side knobs that take precedence over rule and store settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOverrides {
    /// Global cap on the merged result.
    pub limit: Option<u32>,
    pub exclude_out_of_stock: Option<bool>,
    pub recently_viewed: Vec<ItemId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub group_id: u32,
    pub source: ActionSource,
    pub value: String,
    pub items: Vec<ItemId>,
    /// Set when the strategy failed and contributed nothing.
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Execution {
    pub items: Vec<ItemId>,
    pub actions: Vec<ActionReport>,
}

impl Execution {
    /// Whether any action strategy failed and contributed nothing.
    pub fn is_degraded(&self) -> bool {
        self.actions.iter().any(|action| action.error.is_some())
    }
}

pub struct ActionExecutor {
    catalog: Arc<dyn CatalogAdapter>,
    affinity: Arc<dyn AffinitySource>,
    similar_cache: TtlCache<(ItemId, u32), Vec<ItemId>>,
    config: EngineConfig,
}

struct ActionContext<'a> {
    subject: &'a SubjectProfile,
    in_stock_only: bool,
    recently_viewed: &'a [ItemId],
}

impl ActionExecutor {
    pub fn new(
        catalog: Arc<dyn CatalogAdapter>,
        affinity: Arc<dyn AffinitySource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            affinity,
            similar_cache: TtlCache::new(config.similar_cache_ttl()),
            config,
        }
    }

    /// Stock filter precedence: caller, then rule, then store-wide setting.
    pub fn in_stock_only(&self, rule: &Rule, overrides: &ExecutionOverrides) -> bool {
        overrides
            .exclude_out_of_stock
            .or(rule.exclude_out_of_stock)
            .unwrap_or(self.config.exclude_out_of_stock)
    }

    pub async fn execute(
        &self,
        subject: &SubjectProfile,
        rule: &Rule,
        groups: &[ActionGroup],
        overrides: &ExecutionOverrides,
    ) -> Execution {
        let context = ActionContext {
            subject,
            in_stock_only: self.in_stock_only(rule, overrides),
            recently_viewed: &overrides.recently_viewed,
        };

        let mut execution = Execution::default();
        let mut seen = HashSet::new();

        for group in groups {
            let mut group_items: Option<Vec<ItemId>> = None;

            for action in group.actions.iter().filter(|action| action.source.yields_items()) {
                let (items, error) = match self.run(&context, action).await {
                    Ok(items) => (items, None),
                    Err(error) => {
                        warn!(
                            event_name = "engine.action.degraded",
                            rule_id = rule.id.0,
                            group_id = group.group_id,
                            source = action.source.as_str(),
                            error_class = error.error_class(),
                            error = %error,
                            "action strategy failed; contributing no items"
                        );
                        (Vec::new(), Some(error.to_string()))
                    }
                };

                group_items = Some(match group_items {
                    None => items.clone(),
                    Some(mut kept) => {
                        let present: HashSet<ItemId> = items.iter().copied().collect();
                        kept.retain(|id| present.contains(id));
                        kept
                    }
                });
                execution.actions.push(ActionReport {
                    group_id: group.group_id,
                    source: action.source,
                    value: action.value.clone(),
                    items,
                    error,
                });
            }

            for id in group_items.unwrap_or_default() {
                if seen.insert(id) {
                    execution.items.push(id);
                }
            }
        }

        if let Some(limit) = overrides.limit {
            execution.items.truncate(limit as usize);
        }

        debug!(
            event_name = "engine.action.executed",
            rule_id = rule.id.0,
            item_id = subject.item_id.0,
            groups = groups.len(),
            items = execution.items.len(),
            "rule actions executed"
        );
        execution
    }

    /// Drops every cached `similar` result. Returns how many were held.
    pub async fn flush_cache(&self) -> usize {
        self.similar_cache.flush().await
    }

    async fn run(
        &self,
        context: &ActionContext<'_>,
        action: &Action,
    ) -> Result<Vec<ItemId>, ApplicationError> {
        let limit = self.limit_for(action);
        let candidates = self.candidates(context, action, limit).await?;
        self.finalize(context, action, candidates, limit).await
    }

    async fn candidates(
        &self,
        context: &ActionContext<'_>,
        action: &Action,
        limit: usize,
    ) -> Result<Vec<ItemId>, ApplicationError> {
        let subject = context.subject;
        match action.source {
            ActionSource::Category
            | ActionSource::Tag
            | ActionSource::Attribute
            | ActionSource::AttributeValue => self.taxonomy_items(context, action, limit).await,
            ActionSource::SpecificItems => Ok(if action.item_ids.is_empty() {
                ItemId::parse_list(&action.value)
            } else {
                action.item_ids.clone()
            }),
            ActionSource::Copurchase => Ok(self.affinity.copurchased(subject.item_id).await?),
            ActionSource::Trending => {
                if let Some(category) = subject.primary_category() {
                    let trending = self.affinity.trending(Some(category)).await?;
                    if !trending.is_empty() {
                        return Ok(trending);
                    }
                }
                Ok(self.affinity.trending(None).await?)
            }
            ActionSource::RecentlyViewed => Ok(context.recently_viewed.to_vec()),
            ActionSource::Similar => self.similar_items(subject, limit).await,
            ActionSource::ApplyCoupon => Ok(Vec::new()),
        }
    }

    async fn taxonomy_items(
        &self,
        context: &ActionContext<'_>,
        action: &Action,
        limit: usize,
    ) -> Result<Vec<ItemId>, ApplicationError> {
        let Some(selector) = action.term_selector() else {
            debug!(
                event_name = "engine.action.invalid_value",
                source = action.source.as_str(),
                value = %action.value,
                "action value does not name a taxonomy term"
            );
            return Ok(Vec::new());
        };

        let slugs = match (&selector.slug, action.include_children) {
            (Some(slug), true) => expand_slug(self.catalog.as_ref(), &selector.taxonomy, slug).await?,
            (Some(slug), false) => vec![slug.clone()],
            // An attribute without a value shares whatever terms the subject holds.
            (None, _) => context.subject.slugs_in(&selector.taxonomy),
        };
        if slugs.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = ItemQuery::new(selector.taxonomy, slugs);
        query.exclude_ids = std::iter::once(context.subject.item_id)
            .chain(action.exclusions.items.iter().copied())
            .collect();
        query.in_stock_only = context.in_stock_only;
        query.order = action.order;
        query.limit = with_headroom(limit);
        Ok(self.catalog.query_items(&query).await?)
    }

    /// Same-category items priced within the configured band around the subject.
    async fn similar_items(
        &self,
        subject: &SubjectProfile,
        limit: usize,
    ) -> Result<Vec<ItemId>, ApplicationError> {
        let (Some(category), Some(price)) = (subject.primary_category(), subject.price) else {
            return Ok(Vec::new());
        };
        if price <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let cache_key = (subject.item_id, u32::try_from(limit).unwrap_or(u32::MAX));
        if let Some(cached) = self.similar_cache.get(&cache_key).await {
            return Ok(cached);
        }

        let band = price * Decimal::from(self.config.similar_price_band_pct) / Decimal::ONE_HUNDRED;
        let mut query = ItemQuery::new(taxonomy::CATEGORY, vec![category.to_owned()]);
        query.exclude_ids = vec![subject.item_id];
        query.price_range = Some(PriceRange::between(price - band, price + band));
        query.order = ResultOrder::Bestselling;
        query.limit = with_headroom(limit);

        let items = self.catalog.query_items(&query).await?;
        self.similar_cache.insert(cache_key, items.clone()).await;
        Ok(items)
    }

    /// Validates candidates against the live catalog in candidate order and
    /// applies the subject, stock and exclusion filters.
    async fn finalize(
        &self,
        context: &ActionContext<'_>,
        action: &Action,
        candidates: Vec<ItemId>,
        limit: usize,
    ) -> Result<Vec<ItemId>, ApplicationError> {
        let candidates: Vec<ItemId> =
            candidates.into_iter().filter(|id| *id != context.subject.item_id).collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let items = self
            .catalog
            .resolve_items(&candidates, ItemFilter::live(context.in_stock_only))
            .await?;

        Ok(items
            .iter()
            .filter(|item| {
                !is_excluded(&action.exclusions, &SubjectProfile::from_item(item))
            })
            .map(|item| item.id)
            .take(limit)
            .collect())
    }

    fn limit_for(&self, action: &Action) -> usize {
        let limit = if action.limit == 0 { self.config.default_limit } else { action.limit };
        limit as usize
    }
}

/// Post-filters may drop catalog hits, so queries ask for a few more.
fn with_headroom(limit: usize) -> usize {
    limit.saturating_mul(2)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use upsell_core::affinity::InMemoryAffinitySource;
    use upsell_core::catalog::InMemoryCatalog;
    use upsell_core::config::EngineConfig;
    use upsell_core::domain::action::{Action, ActionGroup, ActionSource, ResultOrder};
    use upsell_core::domain::item::ItemId;
    use upsell_core::domain::rule::{Exclusions, Rule, RuleId, RuleStatus};
    use upsell_core::evaluation::SubjectProfile;

    use super::{ActionExecutor, ExecutionOverrides};

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_term("category", "accessories", None);
        catalog.add_term("category", "holsters", Some("accessories"));
        catalog.add_item(1, "Service 9", Decimal::new(50_000, 2), &[("category", "handguns")]);
        catalog.add_item(2, "Striker 9", Decimal::new(55_000, 2), &[("category", "handguns")]).total_sales = 5;
        catalog.add_item(3, "Magnum", Decimal::new(90_000, 2), &[("category", "handguns")]).total_sales = 50;
        catalog.add_item(4, "Compact 380", Decimal::new(42_000, 2), &[("category", "handguns")]).total_sales = 20;
        catalog
            .add_item(10, "IWB Holster", Decimal::new(4_500, 2), &[("category", "holsters"), ("tag", "leather")])
            .total_sales = 30;
        catalog
            .add_item(11, "OWB Holster", Decimal::new(5_500, 2), &[("category", "holsters")])
            .total_sales = 10;
        catalog
            .add_item(12, "Sold Out Holster", Decimal::new(6_500, 2), &[("category", "holsters"), ("tag", "leather")])
            .in_stock = false;
        catalog.add_item(20, "Red Sling", Decimal::new(2_500, 2), &[("category", "slings"), ("pa_color", "red")]);
        catalog.add_item(21, "Blue Sling", Decimal::new(2_500, 2), &[("category", "slings"), ("pa_color", "blue")]);
        catalog.add_item(30, "Cleaning Kit", Decimal::new(1_900, 2), &[("category", "cleaning")]).published = false;
        catalog
    }

    fn executor(affinity: InMemoryAffinitySource) -> ActionExecutor {
        ActionExecutor::new(Arc::new(catalog()), Arc::new(affinity), EngineConfig::default())
    }

    fn rule(exclude_out_of_stock: Option<bool>) -> Rule {
        Rule {
            id: RuleId(1),
            name: "Test".to_owned(),
            priority: 1,
            status: RuleStatus::Active,
            starts_at: None,
            ends_at: None,
            exclude_out_of_stock,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn subject_in(id: u64, category: &str, price: i64) -> SubjectProfile {
        let mut catalog = InMemoryCatalog::new();
        let item = catalog.add_item(id, "Subject", Decimal::new(price, 2), &[("category", category)]);
        SubjectProfile::from_item(item)
    }

    fn one_group(actions: Vec<Action>) -> Vec<ActionGroup> {
        vec![ActionGroup::new(1, actions)]
    }

    #[tokio::test]
    async fn category_action_orders_filters_and_expands() {
        let executor = executor(InMemoryAffinitySource::new());
        let subject = subject_in(1, "handguns", 50_000);

        let bestselling = Action::new(ActionSource::Category, "holsters", 5).ordered_by(ResultOrder::Bestselling);
        let result = executor
            .execute(&subject, &rule(None), &one_group(vec![bestselling.clone()]), &ExecutionOverrides::default())
            .await;
        assert_eq!(result.items, vec![ItemId(10), ItemId(11)]);

        let with_stock = executor
            .execute(&subject, &rule(Some(false)), &one_group(vec![bestselling]), &ExecutionOverrides::default())
            .await;
        assert_eq!(with_stock.items.len(), 3);

        let parent_only = Action::new(ActionSource::Category, "accessories", 5);
        let result = executor
            .execute(&subject, &rule(None), &one_group(vec![parent_only.clone()]), &ExecutionOverrides::default())
            .await;
        assert!(result.items.is_empty());

        let expanded = parent_only.with_children().ordered_by(ResultOrder::PriceDesc);
        let result = executor
            .execute(&subject, &rule(None), &one_group(vec![expanded]), &ExecutionOverrides::default())
            .await;
        assert_eq!(result.items, vec![ItemId(11), ItemId(10)]);
    }

    #[test]
    fn stock_override_precedence_is_caller_then_rule_then_config() {
        let executor = executor(InMemoryAffinitySource::new());
        let caller = ExecutionOverrides { exclude_out_of_stock: Some(true), ..ExecutionOverrides::default() };

        assert!(executor.in_stock_only(&rule(Some(false)), &caller));
        assert!(!executor.in_stock_only(&rule(Some(false)), &ExecutionOverrides::default()));
        assert!(executor.in_stock_only(&rule(None), &ExecutionOverrides::default()));
    }

    #[tokio::test]
    async fn attribute_sources_match_the_subjects_terms() {
        let executor = executor(InMemoryAffinitySource::new());
        let subject = subject_in(1, "handguns", 50_000);
        let overrides = ExecutionOverrides::default();

        let same_color = one_group(vec![Action::new(ActionSource::Attribute, "pa_color", 5)]);
        let mut catalog = InMemoryCatalog::new();
        let red_item = catalog.add_item(
            40,
            "Red Pouch",
            Decimal::new(1_500, 2),
            &[("category", "pouches"), ("pa_color", "red")],
        );
        let red_subject = SubjectProfile::from_item(red_item);
        let result = executor.execute(&red_subject, &rule(None), &same_color, &overrides).await;
        assert_eq!(result.items, vec![ItemId(20)]);

        let result = executor.execute(&subject, &rule(None), &same_color, &overrides).await;
        assert!(result.items.is_empty());

        let red = Action::new(ActionSource::AttributeValue, "pa_color:red", 5);
        let result = executor.execute(&subject, &rule(None), &one_group(vec![red]), &overrides).await;
        assert_eq!(result.items, vec![ItemId(20)]);

        let malformed = Action::new(ActionSource::AttributeValue, "pa_color", 5);
        let result = executor.execute(&subject, &rule(None), &one_group(vec![malformed]), &overrides).await;
        assert!(result.items.is_empty());
    }

    #[tokio::test]
    async fn specific_items_keep_order_and_drop_subject_unpublished_and_excluded() {
        let executor = executor(InMemoryAffinitySource::new());
        let subject = subject_in(1, "handguns", 50_000);
        let action = Action::specific_items(vec![ItemId(11), ItemId(1), ItemId(30), ItemId(20), ItemId(10)])
            .with_exclusions(Exclusions { categories: vec!["slings".to_owned()], ..Exclusions::default() });

        let result = executor
            .execute(&subject, &rule(None), &one_group(vec![action]), &ExecutionOverrides::default())
            .await;

        assert_eq!(result.items, vec![ItemId(11), ItemId(10)]);
    }

    #[tokio::test]
    async fn intersection_within_group_and_union_across_groups() {
        let executor = executor(InMemoryAffinitySource::new());
        let subject = subject_in(1, "handguns", 50_000);
        let groups = vec![
            ActionGroup::new(
                1,
                vec![
                    Action::specific_items(vec![ItemId(20), ItemId(10), ItemId(11)]),
                    Action::new(ActionSource::Category, "holsters", 10),
                    Action::apply_coupon("HOLSTER10", None),
                ],
            ),
            ActionGroup::new(2, vec![Action::apply_coupon("ONLY", None)]),
            ActionGroup::new(3, vec![Action::specific_items(vec![ItemId(21), ItemId(11)])]),
        ];

        let result = executor.execute(&subject, &rule(None), &groups, &ExecutionOverrides::default()).await;
        assert_eq!(result.items, vec![ItemId(10), ItemId(11), ItemId(21)]);
        assert_eq!(result.actions.len(), 3);

        let capped = ExecutionOverrides { limit: Some(2), ..ExecutionOverrides::default() };
        let result = executor.execute(&subject, &rule(None), &groups, &capped).await;
        assert_eq!(result.items, vec![ItemId(10), ItemId(11)]);
    }

    #[tokio::test]
    async fn affinity_sources_validate_candidates_and_fall_back() {
        let affinity = InMemoryAffinitySource::new()
            .with_copurchase(ItemId(1), vec![ItemId(12), ItemId(11), ItemId(99), ItemId(10)])
            .with_global_trending(vec![ItemId(20), ItemId(1)]);
        let executor = executor(affinity);
        let subject = subject_in(1, "handguns", 50_000);

        let copurchase = executor
            .execute(&subject, &rule(None), &one_group(vec![Action::new(ActionSource::Copurchase, "", 2)]), &ExecutionOverrides::default())
            .await;
        assert_eq!(copurchase.items, vec![ItemId(11), ItemId(10)]);

        let trending = executor
            .execute(&subject, &rule(None), &one_group(vec![Action::new(ActionSource::Trending, "", 4)]), &ExecutionOverrides::default())
            .await;
        assert_eq!(trending.items, vec![ItemId(20)]);

        let viewed = ExecutionOverrides { recently_viewed: vec![ItemId(21), ItemId(30)], ..ExecutionOverrides::default() };
        let recent = executor
            .execute(&subject, &rule(None), &one_group(vec![Action::new(ActionSource::RecentlyViewed, "", 4)]), &viewed)
            .await;
        assert_eq!(recent.items, vec![ItemId(21)]);

        let empty = executor
            .execute(&subject_in(4, "handguns", 42_000), &rule(None), &one_group(vec![Action::new(ActionSource::Copurchase, "", 4)]), &ExecutionOverrides::default())
            .await;
        assert!(empty.items.is_empty());
    }

    #[tokio::test]
    async fn similar_uses_price_band_and_caches() {
        let executor = executor(InMemoryAffinitySource::new());
        let subject = subject_in(1, "handguns", 50_000);
        let similar = one_group(vec![Action::new(ActionSource::Similar, "", 4)]);

        let result = executor.execute(&subject, &rule(None), &similar, &ExecutionOverrides::default()).await;
        assert_eq!(result.items, vec![ItemId(4), ItemId(2)]);

        assert_eq!(executor.flush_cache().await, 1);
        assert_eq!(executor.flush_cache().await, 0);

        let unpriced = SubjectProfile::new(ItemId(1), &[], None);
        let result = executor.execute(&unpriced, &rule(None), &similar, &ExecutionOverrides::default()).await;
        assert!(result.items.is_empty());
    }
}
