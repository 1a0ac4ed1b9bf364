//! Rule-driven cross-sell recommendations and coupon auto-apply.

pub mod admin;
pub mod bootstrap;
pub mod coupons;
pub mod executor;
pub mod index_builder;
pub mod matcher;
pub mod profile;
pub mod recommendations;

pub use admin::{RuleAdmin, RuleDefinition, RulePage, StoredRule};
pub use bootstrap::{bootstrap, Application, BootstrapError, UpsellEngine};
pub use coupons::{
    validity_override, AutoAppliedCoupons, CartHost, CouponAutoApply, CouponChanges,
    RecalculationContext, ReconcileOutcome,
};
pub use executor::{ActionExecutor, ActionReport, Execution, ExecutionOverrides};
pub use index_builder::{IndexBuilder, RebuildSummary};
pub use matcher::{CandidateOutcome, CandidateReport, MatchTrace, MatchedRule, Matcher};
pub use recommendations::{Diagnostics, RecommendationRequest, RecommendationService};
