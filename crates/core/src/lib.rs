pub mod affinity;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod errors;
pub mod evaluation;
pub mod indexing;
pub mod keys;
pub mod telemetry;

pub use affinity::{AffinitySource, InMemoryAffinitySource};
pub use catalog::{CatalogAdapter, CatalogError, InMemoryCatalog, ItemFilter, ItemQuery};
pub use domain::action::{Action, ActionGroup, ActionSource, CouponRef, ResultOrder};
pub use domain::cart::{CartLine, CartNotice};
pub use domain::coupon::{Coupon, CouponRejection, CouponStatus, CouponVerdict};
pub use domain::item::{CatalogItem, ItemId, TaxonomyTerm, TermId};
pub use domain::rule::{
    Condition, ConditionAttribute, ConditionGroup, ConditionOperator, Exclusions, NewRule,
    PriceRange, Rule, RuleId, RuleStatus,
};
pub use errors::{ApplicationError, DomainError};
pub use indexing::{IndexCandidate, IndexEntry};
pub use keys::ConditionKey;
