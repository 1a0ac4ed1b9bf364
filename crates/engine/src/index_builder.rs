use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use upsell_core::catalog::CatalogAdapter;
use upsell_core::config::EngineConfig;
use upsell_core::domain::rule::RuleId;
use upsell_core::errors::ApplicationError;
use upsell_core::indexing::derive_index_entries;
use upsell_db::{RuleIndexRepository, RuleRepository};

use crate::profile::collect_descendants;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub cleared_entries: u64,
    pub rules: usize,
    pub entries: usize,
}

/// Keeps the inverted index in step with rule state.
///
/// A per-rule rebuild is "delete, then insert" without a transaction; readers
/// may briefly see the rule un-indexed.
#[derive(Clone)]
pub struct IndexBuilder {
    rules: Arc<dyn RuleRepository>,
    index: Arc<dyn RuleIndexRepository>,
    catalog: Arc<dyn CatalogAdapter>,
    max_descendant_keys: usize,
}

impl IndexBuilder {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        index: Arc<dyn RuleIndexRepository>,
        catalog: Arc<dyn CatalogAdapter>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            rules,
            index,
            catalog,
            max_descendant_keys: usize::try_from(config.max_descendant_keys).unwrap_or(usize::MAX),
        }
    }

    /// Re-derives the rule's entries. Returns how many entries it now has;
    /// a rule that no longer exists is left un-indexed.
    pub async fn rebuild_for_rule(&self, rule_id: RuleId) -> Result<usize, ApplicationError> {
        let cleared = self.index.delete_for_rule(rule_id).await?;

        let Some(rule) = self.rules.find_by_id(rule_id).await? else {
            debug!(
                event_name = "index.rebuild.rule_missing",
                rule_id = rule_id.0,
                cleared,
                "rule no longer exists; index entries cleared"
            );
            return Ok(0);
        };

        let groups = self.rules.condition_groups(rule_id).await?;
        let descendants = collect_descendants(self.catalog.as_ref(), &groups).await?;
        let entries = derive_index_entries(&rule, &groups, &descendants, self.max_descendant_keys);
        self.index.insert_entries(&entries).await?;

        debug!(
            event_name = "index.rebuild.rule",
            rule_id = rule_id.0,
            cleared,
            entries = entries.len(),
            "rule index entries rebuilt"
        );
        Ok(entries.len())
    }

    /// Truncates the index and rebuilds every active rule in turn.
    pub async fn rebuild_all(&self) -> Result<RebuildSummary, ApplicationError> {
        let cleared_entries = self.index.truncate().await?;
        let rule_ids = self.rules.list_active_ids().await?;

        let mut summary = RebuildSummary { cleared_entries, ..RebuildSummary::default() };
        for rule_id in rule_ids {
            summary.entries += self.rebuild_for_rule(rule_id).await?;
            summary.rules += 1;
        }

        info!(
            event_name = "index.rebuild.all",
            cleared_entries = summary.cleared_entries,
            rules = summary.rules,
            entries = summary.entries,
            "rule index rebuilt"
        );
        Ok(summary)
    }
}
