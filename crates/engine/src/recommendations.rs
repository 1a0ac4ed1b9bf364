//! Public recommendation entry points: cached lookups and diagnostics.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use upsell_core::cache::TtlCache;
use upsell_core::config::EngineConfig;
use upsell_core::domain::item::ItemId;
use upsell_core::domain::rule::RuleId;
use upsell_core::errors::ApplicationError;
use upsell_core::evaluation::SubjectProfile;
use upsell_db::RuleRepository;

use crate::executor::{ActionExecutor, ActionReport, ExecutionOverrides};
use crate::matcher::{CandidateReport, Matcher};

struct Computed {
    items: Vec<ItemId>,
    degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecommendationRequest {
    pub item_id: ItemId,
    pub limit: Option<u32>,
    pub exclude_out_of_stock: Option<bool>,
    /// Client-supplied history, most recent first.
    pub recently_viewed: Vec<ItemId>,
}

impl RecommendationRequest {
    pub fn new(item_id: ItemId) -> Self {
        Self { item_id, limit: None, exclude_out_of_stock: None, recently_viewed: Vec::new() }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn exclude_out_of_stock(mut self, exclude: bool) -> Self {
        self.exclude_out_of_stock = Some(exclude);
        self
    }

    pub fn with_recently_viewed(mut self, items: Vec<ItemId>) -> Self {
        self.recently_viewed = items;
        self
    }

    /// Stable key over the subject and every caller override.
    pub fn cache_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"upsell.recommendations.v1");
        hasher.update(&self.item_id.0.to_le_bytes());
        match self.limit {
            Some(limit) => hasher.update(&[1]).update(&limit.to_le_bytes()),
            None => hasher.update(&[0]),
        };
        match self.exclude_out_of_stock {
            Some(exclude) => hasher.update(&[1, u8::from(exclude)]),
            None => hasher.update(&[0]),
        };
        hasher.update(&(self.recently_viewed.len() as u64).to_le_bytes());
        for item in &self.recently_viewed {
            hasher.update(&item.0.to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    fn overrides(&self) -> ExecutionOverrides {
        ExecutionOverrides {
            limit: self.limit,
            exclude_out_of_stock: self.exclude_out_of_stock,
            recently_viewed: self.recently_viewed.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SubjectSummary {
    pub item_id: ItemId,
    pub keys: Vec<String>,
    pub categories: Vec<String>,
    pub price: Option<Decimal>,
}

impl From<&SubjectProfile> for SubjectSummary {
    fn from(subject: &SubjectProfile) -> Self {
        Self {
            item_id: subject.item_id,
            keys: subject.lookup_keys().iter().map(|key| key.as_str().to_owned()).collect(),
            categories: subject.categories.clone(),
            price: subject.price,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchedSummary {
    pub rule_id: RuleId,
    pub name: String,
    pub priority: i32,
    pub group_id: u32,
}

/// Everything the engine decided for one subject, for troubleshooting rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub item_id: ItemId,
    pub subject: Option<SubjectSummary>,
    pub candidates: Vec<CandidateReport>,
    pub matched: Option<MatchedSummary>,
    pub actions: Vec<ActionReport>,
    pub items: Vec<ItemId>,
    pub elapsed_micros: u64,
    pub error: Option<String>,
}

impl Diagnostics {
    fn empty(item_id: ItemId) -> Self {
        Self {
            item_id,
            subject: None,
            candidates: Vec::new(),
            matched: None,
            actions: Vec::new(),
            items: Vec::new(),
            elapsed_micros: 0,
            error: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub struct RecommendationService {
    matcher: Matcher,
    executor: ActionExecutor,
    rules: Arc<dyn RuleRepository>,
    results: TtlCache<String, Vec<ItemId>>,
}

impl RecommendationService {
    pub fn new(
        matcher: Matcher,
        executor: ActionExecutor,
        rules: Arc<dyn RuleRepository>,
        config: &EngineConfig,
    ) -> Self {
        Self { matcher, executor, rules, results: TtlCache::new(config.result_cache_ttl()) }
    }

    pub async fn get_recommendations(&self, request: &RecommendationRequest) -> Vec<ItemId> {
        self.get_recommendations_at(request, Utc::now()).await
    }

    /// Recommended item ids for the request, or an empty list when no rule
    /// applies or a dependency fails.
    pub async fn get_recommendations_at(
        &self,
        request: &RecommendationRequest,
        now: DateTime<Utc>,
    ) -> Vec<ItemId> {
        let cache_key = request.cache_key();
        if let Some(items) = self.results.get(&cache_key).await {
            debug!(
                event_name = "engine.recommend.cache_hit",
                item_id = request.item_id.0,
                items = items.len(),
                "recommendations served from cache"
            );
            return items;
        }

        match self.compute(request, now).await {
            Ok(Computed { items, degraded: false }) => {
                self.results.insert(cache_key, items.clone()).await;
                items
            }
            Ok(Computed { items, degraded: true }) => {
                debug!(
                    event_name = "engine.recommend.uncached",
                    item_id = request.item_id.0,
                    items = items.len(),
                    "an action strategy failed; result not cached"
                );
                items
            }
            Err(error) => {
                warn!(
                    event_name = "engine.recommend.degraded",
                    item_id = request.item_id.0,
                    error_class = error.error_class(),
                    error = %error,
                    "recommendation failed; returning no items"
                );
                Vec::new()
            }
        }
    }

    async fn compute(
        &self,
        request: &RecommendationRequest,
        now: DateTime<Utc>,
    ) -> Result<Computed, ApplicationError> {
        let subject = self.matcher.profile(request.item_id).await?;
        let Some(matched) = self.matcher.resolve_subject(&subject, now).await? else {
            return Ok(Computed { items: Vec::new(), degraded: false });
        };

        let groups = self.rules.action_groups(matched.rule.id).await?;
        let execution =
            self.executor.execute(&subject, &matched.rule, &groups, &request.overrides()).await;
        Ok(Computed { degraded: execution.is_degraded(), items: execution.items })
    }

    pub async fn get_diagnostics(&self, item_id: ItemId) -> Diagnostics {
        self.get_diagnostics_at(&RecommendationRequest::new(item_id), Utc::now()).await
    }

    /// Runs the full pipeline uncached and reports every intermediate decision.
    pub async fn get_diagnostics_at(
        &self,
        request: &RecommendationRequest,
        now: DateTime<Utc>,
    ) -> Diagnostics {
        let started = Instant::now();
        let mut diagnostics = Diagnostics::empty(request.item_id);
        if let Err(error) = self.diagnose(request, now, &mut diagnostics).await {
            diagnostics.error = Some(error.to_string());
        }
        diagnostics.elapsed_micros =
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        diagnostics
    }

    async fn diagnose(
        &self,
        request: &RecommendationRequest,
        now: DateTime<Utc>,
        diagnostics: &mut Diagnostics,
    ) -> Result<(), ApplicationError> {
        let subject = self.matcher.profile(request.item_id).await?;
        diagnostics.subject = Some(SubjectSummary::from(&subject));

        let trace = self.matcher.trace(&subject, now).await?;
        diagnostics.candidates = trace.candidates;
        let Some(matched) = trace.matched else {
            return Ok(());
        };
        diagnostics.matched = Some(MatchedSummary {
            rule_id: matched.rule.id,
            name: matched.rule.name.clone(),
            priority: matched.rule.priority,
            group_id: matched.group_id,
        });

        let groups = self.rules.action_groups(matched.rule.id).await?;
        let execution =
            self.executor.execute(&subject, &matched.rule, &groups, &request.overrides()).await;
        diagnostics.actions = execution.actions;
        diagnostics.items = execution.items;
        Ok(())
    }

    /// Drops cached recommendation and `similar` results. Returns how many
    /// entries were dropped.
    pub async fn flush_cache(&self) -> usize {
        let flushed = self.results.flush().await + self.executor.flush_cache().await;
        info!(event_name = "engine.cache.flushed", entries = flushed, "recommendation caches flushed");
        flushed
    }
}
