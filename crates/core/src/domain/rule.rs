use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::item::ItemId;
use crate::errors::DomainError;
use crate::keys::{ConditionKey, SPECIFIC_ITEM};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(pub i64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Inactive,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for RuleStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(DomainError::invalid_value("rule.status", other)),
        }
    }
}

/// Rule header. Condition and action groups are stored and fetched separately.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    /// Lower value wins; ties are broken by ascending id.
    pub priority: i32,
    pub status: RuleStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Per-rule override of the global exclude-out-of-stock setting.
    pub exclude_out_of_stock: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Whether the rule may win at `now`: active and inside its scheduling window.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Active {
            return false;
        }
        if self.starts_at.is_some_and(|starts_at| now < starts_at) {
            return false;
        }
        if self.ends_at.is_some_and(|ends_at| now > ends_at) {
            return false;
        }
        true
    }

    /// Sort key implementing "lower priority first, then lower id".
    pub fn precedence(&self) -> (i32, RuleId) {
        (self.priority, self.id)
    }
}

/// Input for creating a rule; the store assigns id and timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub priority: i32,
    pub status: RuleStatus,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub exclude_out_of_stock: Option<bool>,
}

impl NewRule {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            status: RuleStatus::Active,
            starts_at: None,
            ends_at: None,
            exclude_out_of_stock: None,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidRule("rule name must not be empty".to_owned()));
        }
        if let (Some(starts_at), Some(ends_at)) = (self.starts_at, self.ends_at) {
            if ends_at < starts_at {
                return Err(DomainError::InvalidRule(
                    "rule end date must not precede its start date".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

/// What a condition inspects: membership in a taxonomy, or the item identity itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ConditionAttribute {
    Taxonomy(String),
    SpecificItem,
}

impl ConditionAttribute {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Taxonomy(name) => name,
            Self::SpecificItem => SPECIFIC_ITEM,
        }
    }
}

impl FromStr for ConditionAttribute {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if normalized.is_empty() || normalized.contains(':') {
            return Err(DomainError::invalid_value("condition.attribute", value));
        }
        if normalized == SPECIFIC_ITEM {
            return Ok(Self::SpecificItem);
        }
        Ok(Self::Taxonomy(normalized))
    }
}

impl From<ConditionAttribute> for String {
    fn from(value: ConditionAttribute) -> Self {
        value.as_str().to_owned()
    }
}

impl TryFrom<String> for ConditionAttribute {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
        }
    }

    pub fn apply(&self, key_matched: bool) -> bool {
        match self {
            Self::Equals => key_matched,
            Self::NotEquals => !key_matched,
        }
    }
}

impl FromStr for ConditionOperator {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" => Ok(Self::Equals),
            "not_equals" | "neq" => Ok(Self::NotEquals),
            other => Err(DomainError::invalid_value("condition.operator", other)),
        }
    }
}

/// Inclusive price bounds; either side may be open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

impl PriceRange {
    pub fn between(min: Decimal, max: Decimal) -> Self {
        Self { min: Some(min), max: Some(max) }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, price: Decimal) -> bool {
        self.min.map_or(true, |min| price >= min) && self.max.map_or(true, |max| price <= max)
    }
}

/// Exclusion sub-filters shared by conditions and actions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    #[serde(default)]
    pub items: Vec<ItemId>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Items priced inside this range are excluded.
    #[serde(default)]
    pub price_range: Option<PriceRange>,
}

impl Exclusions {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
            && self.categories.is_empty()
            && self.price_range.map_or(true, |range| range.is_unbounded())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: ConditionAttribute,
    pub operator: ConditionOperator,
    /// Term slug, or a comma-separated id list for `specific_item`.
    pub value: String,
    #[serde(default)]
    pub include_children: bool,
    #[serde(default = "default_min_quantity")]
    pub min_quantity: u32,
    #[serde(default)]
    pub exclusions: Exclusions,
}

fn default_min_quantity() -> u32 {
    1
}

impl Condition {
    pub fn equals(attribute: ConditionAttribute, value: impl Into<String>) -> Self {
        Self {
            attribute,
            operator: ConditionOperator::Equals,
            value: value.into(),
            include_children: false,
            min_quantity: 1,
            exclusions: Exclusions::default(),
        }
    }

    pub fn not_equals(attribute: ConditionAttribute, value: impl Into<String>) -> Self {
        Self { operator: ConditionOperator::NotEquals, ..Self::equals(attribute, value) }
    }

    pub fn with_children(mut self) -> Self {
        self.include_children = true;
        self
    }

    pub fn with_min_quantity(mut self, min_quantity: u32) -> Self {
        self.min_quantity = min_quantity.max(1);
        self
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// The directly-matching keys of this condition, ignoring descendants.
    pub fn keys(&self) -> Vec<ConditionKey> {
        match &self.attribute {
            ConditionAttribute::SpecificItem => {
                ItemId::parse_list(&self.value).into_iter().map(ConditionKey::item).collect()
            }
            ConditionAttribute::Taxonomy(taxonomy) => {
                let slug = self.value.trim();
                if slug.is_empty() {
                    Vec::new()
                } else {
                    vec![ConditionKey::taxonomy(taxonomy, slug)]
                }
            }
        }
    }

    /// Whether descendant terms must be considered for this condition.
    pub fn expands_children(&self) -> bool {
        self.include_children && matches!(self.attribute, ConditionAttribute::Taxonomy(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub group_id: u32,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn new(group_id: u32, conditions: Vec<Condition>) -> Self {
        Self { group_id, conditions }
    }
}
