use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use upsell_core::domain::action::{Action, ActionGroup, ActionSource};
use upsell_core::domain::item::ItemId;
use upsell_core::domain::rule::{Condition, ConditionGroup, NewRule, Rule, RuleId};
use upsell_core::errors::{ApplicationError, DomainError};
use upsell_db::{Page, RuleFilter, RuleIndexRepository, RuleRepository};

use crate::index_builder::{IndexBuilder, RebuildSummary};

/// A rule header together with its condition and action groups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub rule: NewRule,
    #[serde(default)]
    pub condition_groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub action_groups: Vec<ActionGroup>,
}

impl RuleDefinition {
    pub fn new(rule: NewRule) -> Self {
        Self { rule, condition_groups: Vec::new(), action_groups: Vec::new() }
    }

    pub fn when(mut self, conditions: Vec<Condition>) -> Self {
        let group_id = self.condition_groups.len() as u32 + 1;
        self.condition_groups.push(ConditionGroup::new(group_id, conditions));
        self
    }

    pub fn then(mut self, actions: Vec<Action>) -> Self {
        let group_id = self.action_groups.len() as u32 + 1;
        self.action_groups.push(ActionGroup::new(group_id, actions));
        self
    }

    /// Checks every part and returns a copy with empty groups dropped and the
    /// remaining groups numbered 1..n in their given order.
    pub fn normalized(&self) -> Result<Self, DomainError> {
        self.rule.validate()?;
        for condition in self.condition_groups.iter().flat_map(|group| group.conditions.iter()) {
            validate_condition(condition)?;
        }
        for action in self.action_groups.iter().flat_map(|group| group.actions.iter()) {
            validate_action(action)?;
        }

        let condition_groups = self
            .condition_groups
            .iter()
            .filter(|group| !group.conditions.is_empty())
            .enumerate()
            .map(|(index, group)| ConditionGroup::new(index as u32 + 1, group.conditions.clone()))
            .collect();
        let action_groups = self
            .action_groups
            .iter()
            .filter(|group| !group.actions.is_empty())
            .enumerate()
            .map(|(index, group)| ActionGroup::new(index as u32 + 1, group.actions.clone()))
            .collect();

        Ok(Self { rule: self.rule.clone(), condition_groups, action_groups })
    }
}

fn validate_condition(condition: &Condition) -> Result<(), DomainError> {
    if condition.keys().is_empty() {
        return Err(DomainError::InvalidRule(format!(
            "condition on `{}` needs a value naming a term or item ids",
            condition.attribute.as_str()
        )));
    }
    Ok(())
}

fn validate_action(action: &Action) -> Result<(), DomainError> {
    let valid = match action.source {
        ActionSource::Category
        | ActionSource::Tag
        | ActionSource::Attribute
        | ActionSource::AttributeValue => action.term_selector().is_some(),
        ActionSource::SpecificItems => {
            !action.item_ids.is_empty() || !ItemId::parse_list(&action.value).is_empty()
        }
        ActionSource::ApplyCoupon => {
            action.coupon.as_ref().is_some_and(|coupon| !coupon.code.trim().is_empty())
        }
        ActionSource::Copurchase
        | ActionSource::Trending
        | ActionSource::RecentlyViewed
        | ActionSource::Similar => true,
    };

    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidRule(format!(
            "`{}` action has an unusable value `{}`",
            action.source.as_str(),
            action.value
        )))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredRule {
    pub rule: Rule,
    pub condition_groups: Vec<ConditionGroup>,
    pub action_groups: Vec<ActionGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RulePage {
    pub rules: Vec<Rule>,
    pub total: u64,
}

/// Write path for rules. Every change is followed by a rebuild of the rule's
/// index entries.
pub struct RuleAdmin {
    rules: Arc<dyn RuleRepository>,
    index: Arc<dyn RuleIndexRepository>,
    builder: IndexBuilder,
}

impl RuleAdmin {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        index: Arc<dyn RuleIndexRepository>,
        builder: IndexBuilder,
    ) -> Self {
        Self { rules, index, builder }
    }

    pub async fn create_rule(&self, definition: RuleDefinition) -> Result<Rule, ApplicationError> {
        let definition = definition.normalized()?;
        let rule = self.rules.create(definition.rule.clone()).await?;
        self.write_groups(rule.id, &definition).await?;
        let entries = self.builder.rebuild_for_rule(rule.id).await?;

        info!(
            event_name = "rule.admin.created",
            rule_id = rule.id.0,
            priority = rule.priority,
            entries,
            "rule created"
        );
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        id: RuleId,
        definition: RuleDefinition,
    ) -> Result<Rule, ApplicationError> {
        let definition = definition.normalized()?;
        let rule = self.rules.update(id, definition.rule.clone()).await?;
        self.write_groups(id, &definition).await?;
        let entries = self.builder.rebuild_for_rule(id).await?;

        info!(event_name = "rule.admin.updated", rule_id = id.0, entries, "rule updated");
        Ok(rule)
    }

    /// Returns whether the rule existed.
    pub async fn delete_rule(&self, id: RuleId) -> Result<bool, ApplicationError> {
        let existed = self.rules.delete(id).await?;
        let cleared = self.index.delete_for_rule(id).await?;

        info!(event_name = "rule.admin.deleted", rule_id = id.0, existed, cleared, "rule deleted");
        Ok(existed)
    }

    pub async fn get_rule(&self, id: RuleId) -> Result<Option<StoredRule>, ApplicationError> {
        let Some(rule) = self.rules.find_by_id(id).await? else {
            return Ok(None);
        };
        Ok(Some(StoredRule {
            rule,
            condition_groups: self.rules.condition_groups(id).await?,
            action_groups: self.rules.action_groups(id).await?,
        }))
    }

    pub async fn list_rules(
        &self,
        filter: &RuleFilter,
        page: Page,
    ) -> Result<RulePage, ApplicationError> {
        Ok(RulePage {
            rules: self.rules.list(filter, page).await?,
            total: self.rules.count(filter).await?,
        })
    }

    pub async fn rebuild_index(&self) -> Result<RebuildSummary, ApplicationError> {
        self.builder.rebuild_all().await
    }

    async fn write_groups(
        &self,
        id: RuleId,
        definition: &RuleDefinition,
    ) -> Result<(), ApplicationError> {
        self.rules.save_condition_groups(id, &definition.condition_groups).await?;
        self.rules.save_action_groups(id, &definition.action_groups).await?;
        Ok(())
    }
}
