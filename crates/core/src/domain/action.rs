use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::item::{taxonomy, ItemId};
use crate::domain::rule::Exclusions;
use crate::errors::DomainError;

/// Where an action draws its items from. Each variant is bound to exactly one
/// strategy in the action executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Category,
    Tag,
    Attribute,
    AttributeValue,
    SpecificItems,
    Copurchase,
    Trending,
    RecentlyViewed,
    Similar,
    ApplyCoupon,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Tag => "tag",
            Self::Attribute => "attribute",
            Self::AttributeValue => "attribute_value",
            Self::SpecificItems => "specific_items",
            Self::Copurchase => "copurchase",
            Self::Trending => "trending",
            Self::RecentlyViewed => "recently_viewed",
            Self::Similar => "similar",
            Self::ApplyCoupon => "apply_coupon",
        }
    }

    /// Sources that produce item ids. `apply_coupon` is only a signal for the coupon engine.
    pub fn yields_items(&self) -> bool {
        !matches!(self, Self::ApplyCoupon)
    }
}

impl FromStr for ActionSource {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "category" => Ok(Self::Category),
            "tag" => Ok(Self::Tag),
            "attribute" => Ok(Self::Attribute),
            "attribute_value" => Ok(Self::AttributeValue),
            "specific_items" => Ok(Self::SpecificItems),
            "copurchase" => Ok(Self::Copurchase),
            "trending" => Ok(Self::Trending),
            "recently_viewed" => Ok(Self::RecentlyViewed),
            "similar" => Ok(Self::Similar),
            "apply_coupon" => Ok(Self::ApplyCoupon),
            other => Err(DomainError::invalid_value("action.source", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrder {
    #[default]
    Random,
    Newest,
    PriceAsc,
    PriceDesc,
    Bestselling,
    Rating,
}

impl ResultOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Newest => "newest",
            Self::PriceAsc => "price_asc",
            Self::PriceDesc => "price_desc",
            Self::Bestselling => "bestselling",
            Self::Rating => "rating",
        }
    }
}

impl FromStr for ResultOrder {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" | "rand" => Ok(Self::Random),
            "newest" | "date" => Ok(Self::Newest),
            "price_asc" | "price" => Ok(Self::PriceAsc),
            "price_desc" => Ok(Self::PriceDesc),
            "bestselling" | "popularity" => Ok(Self::Bestselling),
            "rating" => Ok(Self::Rating),
            other => Err(DomainError::invalid_value("action.order", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CouponRef {
    pub code: String,
    /// Replaces the generic "coupon applied" notice when present.
    pub message: Option<String>,
}

/// Taxonomy selector an action resolves to: a taxonomy and optionally one term in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TermSelector {
    pub taxonomy: String,
    /// `None` means the subject's own terms in `taxonomy`.
    pub slug: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub source: ActionSource,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub item_ids: Vec<ItemId>,
    pub limit: u32,
    #[serde(default)]
    pub order: ResultOrder,
    #[serde(default)]
    pub include_children: bool,
    #[serde(default)]
    pub coupon: Option<CouponRef>,
    #[serde(default)]
    pub exclusions: Exclusions,
}

impl Action {
    pub fn new(source: ActionSource, value: impl Into<String>, limit: u32) -> Self {
        Self {
            source,
            value: value.into(),
            item_ids: Vec::new(),
            limit,
            order: ResultOrder::default(),
            include_children: false,
            coupon: None,
            exclusions: Exclusions::default(),
        }
    }

    pub fn specific_items(item_ids: Vec<ItemId>) -> Self {
        let limit = u32::try_from(item_ids.len()).unwrap_or(u32::MAX);
        Self { item_ids, ..Self::new(ActionSource::SpecificItems, "", limit) }
    }

    pub fn apply_coupon(code: impl Into<String>, message: Option<String>) -> Self {
        Self {
            coupon: Some(CouponRef { code: code.into(), message }),
            ..Self::new(ActionSource::ApplyCoupon, "", 0)
        }
    }

    pub fn ordered_by(mut self, order: ResultOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_children(mut self) -> Self {
        self.include_children = true;
        self
    }

    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Resolves the taxonomy-backed sources to the taxonomy and term they query.
    /// Returns `None` for other sources and for values that cannot name a term.
    pub fn term_selector(&self) -> Option<TermSelector> {
        let value = self.value.trim();
        match self.source {
            ActionSource::Category | ActionSource::Tag if value.is_empty() => None,
            ActionSource::Category => Some(TermSelector {
                taxonomy: taxonomy::CATEGORY.to_owned(),
                slug: Some(value.to_ascii_lowercase()),
            }),
            ActionSource::Tag => Some(TermSelector {
                taxonomy: taxonomy::TAG.to_owned(),
                slug: Some(value.to_ascii_lowercase()),
            }),
            ActionSource::Attribute => {
                let taxonomy = value.split(':').next().unwrap_or_default().trim();
                (!taxonomy.is_empty()).then(|| TermSelector {
                    taxonomy: taxonomy.to_ascii_lowercase(),
                    slug: None,
                })
            }
            ActionSource::AttributeValue => {
                let (taxonomy, slug) = value.split_once(':')?;
                let (taxonomy, slug) = (taxonomy.trim(), slug.trim());
                (!taxonomy.is_empty() && !slug.is_empty()).then(|| TermSelector {
                    taxonomy: taxonomy.to_ascii_lowercase(),
                    slug: Some(slug.to_ascii_lowercase()),
                })
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionGroup {
    pub group_id: u32,
    pub actions: Vec<Action>,
}

impl ActionGroup {
    pub fn new(group_id: u32, actions: Vec<Action>) -> Self {
        Self { group_id, actions }
    }

    pub fn coupons(&self) -> impl Iterator<Item = &CouponRef> {
        self.actions
            .iter()
            .filter(|action| action.source == ActionSource::ApplyCoupon)
            .filter_map(|action| action.coupon.as_ref())
    }
}
