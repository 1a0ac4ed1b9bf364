use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use upsell_core::domain::action::ActionGroup;
use upsell_core::domain::rule::{ConditionGroup, NewRule, Rule, RuleId, RuleStatus};
use upsell_core::errors::{ApplicationError, DomainError};
use upsell_core::indexing::{IndexCandidate, IndexEntry};
use upsell_core::keys::ConditionKey;

pub mod memory;
pub mod rule;
pub mod rule_index;

pub use memory::{InMemoryRuleIndexRepository, InMemoryRuleRepository};
pub use rule::SqlRuleRepository;
pub use rule_index::SqlRuleIndexRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound(what) => {
                Self::Domain(DomainError::InvalidRule(format!("{what} does not exist")))
            }
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Listing filter for the administration surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub status: Option<RuleStatus>,
    /// Case-insensitive substring match on the rule name.
    pub name_contains: Option<String>,
}

impl RuleFilter {
    pub fn matches(&self, rule: &Rule) -> bool {
        if self.status.is_some_and(|status| status != rule.status) {
            return false;
        }
        match self.name_contains.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => {
                rule.name.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
            }
            _ => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 50 }
    }
}

/// Authoritative store for rules and their condition and action groups.
///
/// Listings are ordered by precedence: ascending priority, then ascending id.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn create(&self, rule: NewRule) -> Result<Rule, RepositoryError>;

    async fn update(&self, id: RuleId, rule: NewRule) -> Result<Rule, RepositoryError>;

    /// Removes the rule together with its groups. Returns whether it existed.
    async fn delete(&self, id: RuleId) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: RuleId) -> Result<Option<Rule>, RepositoryError>;

    async fn find_by_ids(&self, ids: &[RuleId]) -> Result<Vec<Rule>, RepositoryError>;

    /// Replaces every condition group of the rule.
    async fn save_condition_groups(
        &self,
        id: RuleId,
        groups: &[ConditionGroup],
    ) -> Result<(), RepositoryError>;

    /// Replaces every action group of the rule.
    async fn save_action_groups(
        &self,
        id: RuleId,
        groups: &[ActionGroup],
    ) -> Result<(), RepositoryError>;

    async fn condition_groups(&self, id: RuleId) -> Result<Vec<ConditionGroup>, RepositoryError>;

    async fn condition_groups_for(
        &self,
        ids: &[RuleId],
    ) -> Result<HashMap<RuleId, Vec<ConditionGroup>>, RepositoryError>;

    async fn action_groups(&self, id: RuleId) -> Result<Vec<ActionGroup>, RepositoryError>;

    async fn action_groups_for(
        &self,
        ids: &[RuleId],
    ) -> Result<HashMap<RuleId, Vec<ActionGroup>>, RepositoryError>;

    async fn list(&self, filter: &RuleFilter, page: Page) -> Result<Vec<Rule>, RepositoryError>;

    async fn count(&self, filter: &RuleFilter) -> Result<u64, RepositoryError>;

    async fn list_active_ids(&self) -> Result<Vec<RuleId>, RepositoryError>;

    /// Active rules carrying at least one `apply_coupon` action.
    async fn list_coupon_rules(&self) -> Result<Vec<Rule>, RepositoryError>;
}

/// Inverted index from condition key to candidate rules.
#[async_trait]
pub trait RuleIndexRepository: Send + Sync {
    async fn delete_for_rule(&self, rule_id: RuleId) -> Result<u64, RepositoryError>;

    /// Inserts entries, ignoring ones already present.
    async fn insert_entries(&self, entries: &[IndexEntry]) -> Result<u64, RepositoryError>;

    async fn truncate(&self) -> Result<u64, RepositoryError>;

    /// Distinct rules indexed under any of `keys`, ordered by priority then id.
    async fn candidates(&self, keys: &[ConditionKey])
        -> Result<Vec<IndexCandidate>, RepositoryError>;

    async fn entries_for_rule(&self, rule_id: RuleId) -> Result<Vec<IndexEntry>, RepositoryError>;
}
