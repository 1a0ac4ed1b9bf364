use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;

use upsell_core::domain::action::{ActionGroup, ActionSource};
use upsell_core::domain::rule::{ConditionGroup, NewRule, Rule, RuleId, RuleStatus};
use upsell_core::indexing::{IndexCandidate, IndexEntry};
use upsell_core::keys::ConditionKey;

use super::{Page, RepositoryError, RuleFilter, RuleIndexRepository, RuleRepository};

#[derive(Default)]
struct RuleTables {
    next_id: i64,
    rules: HashMap<RuleId, Rule>,
    conditions: HashMap<RuleId, Vec<ConditionGroup>>,
    actions: HashMap<RuleId, Vec<ActionGroup>>,
}

impl RuleTables {
    fn sorted(&self, filter: &RuleFilter) -> Vec<Rule> {
        let mut rules: Vec<Rule> =
            self.rules.values().filter(|rule| filter.matches(rule)).cloned().collect();
        rules.sort_by_key(Rule::precedence);
        rules
    }
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
    tables: RwLock<RuleTables>,
}

fn normalized<T: Clone>(groups: &[T], is_empty: impl Fn(&T) -> bool) -> Vec<T> {
    groups.iter().filter(|group| !is_empty(group)).cloned().collect()
}

#[async_trait::async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn create(&self, rule: NewRule) -> Result<Rule, RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.next_id += 1;
        let now = Utc::now();
        let created = Rule {
            id: RuleId(tables.next_id),
            name: rule.name,
            priority: rule.priority,
            status: rule.status,
            starts_at: rule.starts_at,
            ends_at: rule.ends_at,
            exclude_out_of_stock: rule.exclude_out_of_stock,
            created_at: now,
            updated_at: now,
        };
        tables.rules.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: RuleId, rule: NewRule) -> Result<Rule, RepositoryError> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .rules
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("rule {id}")))?;

        existing.name = rule.name;
        existing.priority = rule.priority;
        existing.status = rule.status;
        existing.starts_at = rule.starts_at;
        existing.ends_at = rule.ends_at;
        existing.exclude_out_of_stock = rule.exclude_out_of_stock;
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn delete(&self, id: RuleId) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.conditions.remove(&id);
        tables.actions.remove(&id);
        Ok(tables.rules.remove(&id).is_some())
    }

    async fn find_by_id(&self, id: RuleId) -> Result<Option<Rule>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.rules.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[RuleId]) -> Result<Vec<Rule>, RepositoryError> {
        let tables = self.tables.read().await;
        let wanted: BTreeSet<RuleId> = ids.iter().copied().collect();
        let mut rules: Vec<Rule> =
            wanted.iter().filter_map(|id| tables.rules.get(id).cloned()).collect();
        rules.sort_by_key(Rule::precedence);
        Ok(rules)
    }

    async fn save_condition_groups(
        &self,
        id: RuleId,
        groups: &[ConditionGroup],
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.rules.contains_key(&id) {
            return Err(RepositoryError::NotFound(format!("rule {id}")));
        }

        let mut stored = normalized(groups, |group| group.conditions.is_empty());
        stored.sort_by_key(|group| group.group_id);
        tables.conditions.insert(id, stored);
        if let Some(rule) = tables.rules.get_mut(&id) {
            rule.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn save_action_groups(
        &self,
        id: RuleId,
        groups: &[ActionGroup],
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        if !tables.rules.contains_key(&id) {
            return Err(RepositoryError::NotFound(format!("rule {id}")));
        }

        let mut stored = normalized(groups, |group| group.actions.is_empty());
        stored.sort_by_key(|group| group.group_id);
        tables.actions.insert(id, stored);
        if let Some(rule) = tables.rules.get_mut(&id) {
            rule.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn condition_groups(&self, id: RuleId) -> Result<Vec<ConditionGroup>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.conditions.get(&id).cloned().unwrap_or_default())
    }

    async fn condition_groups_for(
        &self,
        ids: &[RuleId],
    ) -> Result<HashMap<RuleId, Vec<ConditionGroup>>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.conditions.get(id).map(|groups| (*id, groups.clone())))
            .filter(|(_, groups)| !groups.is_empty())
            .collect())
    }

    async fn action_groups(&self, id: RuleId) -> Result<Vec<ActionGroup>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.actions.get(&id).cloned().unwrap_or_default())
    }

    async fn action_groups_for(
        &self,
        ids: &[RuleId],
    ) -> Result<HashMap<RuleId, Vec<ActionGroup>>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.actions.get(id).map(|groups| (*id, groups.clone())))
            .filter(|(_, groups)| !groups.is_empty())
            .collect())
    }

    async fn list(&self, filter: &RuleFilter, page: Page) -> Result<Vec<Rule>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .sorted(filter)
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn count(&self, filter: &RuleFilter) -> Result<u64, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.rules.values().filter(|rule| filter.matches(rule)).count() as u64)
    }

    async fn list_active_ids(&self) -> Result<Vec<RuleId>, RepositoryError> {
        let tables = self.tables.read().await;
        let active = RuleFilter { status: Some(RuleStatus::Active), ..RuleFilter::default() };
        Ok(tables.sorted(&active).into_iter().map(|rule| rule.id).collect())
    }

    async fn list_coupon_rules(&self) -> Result<Vec<Rule>, RepositoryError> {
        let tables = self.tables.read().await;
        let active = RuleFilter { status: Some(RuleStatus::Active), ..RuleFilter::default() };
        Ok(tables
            .sorted(&active)
            .into_iter()
            .filter(|rule| {
                tables.actions.get(&rule.id).is_some_and(|groups| {
                    groups.iter().flat_map(|group| group.actions.iter()).any(|action| {
                        action.source == ActionSource::ApplyCoupon
                    })
                })
            })
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryRuleIndexRepository {
    entries: RwLock<BTreeSet<IndexEntry>>,
}

#[async_trait::async_trait]
impl RuleIndexRepository for InMemoryRuleIndexRepository {
    async fn delete_for_rule(&self, rule_id: RuleId) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.rule_id != rule_id);
        Ok((before - entries.len()) as u64)
    }

    async fn insert_entries(&self, new_entries: &[IndexEntry]) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let mut inserted = 0;
        for entry in new_entries {
            let duplicate = entries.iter().any(|existing| {
                existing.condition_key == entry.condition_key && existing.rule_id == entry.rule_id
            });
            if !duplicate && entries.insert(entry.clone()) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn truncate(&self) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }

    async fn candidates(
        &self,
        keys: &[ConditionKey],
    ) -> Result<Vec<IndexCandidate>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut best: HashMap<RuleId, i32> = HashMap::new();
        for entry in entries.iter().filter(|entry| keys.contains(&entry.condition_key)) {
            best.entry(entry.rule_id)
                .and_modify(|priority| *priority = (*priority).min(entry.priority))
                .or_insert(entry.priority);
        }

        let mut candidates: Vec<IndexCandidate> = best
            .into_iter()
            .map(|(rule_id, priority)| IndexCandidate { priority, rule_id })
            .collect();
        candidates.sort();
        Ok(candidates)
    }

    async fn entries_for_rule(&self, rule_id: RuleId) -> Result<Vec<IndexEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut found: Vec<IndexEntry> =
            entries.iter().filter(|entry| entry.rule_id == rule_id).cloned().collect();
        found.sort_by(|a, b| a.condition_key.cmp(&b.condition_key));
        Ok(found)
    }
}
