//! Automatic coupon application driven by cart-level rule evaluation.
//!
//! Runs on every cart total recalculation. Rules that carry `apply_coupon`
//! actions are evaluated against the cart lines (quantity-aware, no index),
//! and the set of auto-applied codes is reconciled with what now qualifies.
//! Codes the shopper entered by hand are never touched.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use upsell_core::catalog::{CatalogAdapter, CatalogError};
use upsell_core::domain::action::CouponRef;
use upsell_core::domain::cart::{CartLine, CartNotice, GENERIC_COUPON_APPLIED};
use upsell_core::domain::coupon::{Coupon, CouponRejection, CouponVerdict};
use upsell_core::domain::rule::Rule;
use upsell_core::errors::ApplicationError;
use upsell_core::evaluation::{first_satisfied_cart_group, CartLineProfile};
use upsell_db::RuleRepository;

use crate::profile::{collect_descendants, subject_profile};

/// The cart and discount side the engine drives.
#[async_trait]
pub trait CartHost: Send + Sync {
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, ApplicationError>;

    /// Codes currently applied to the cart, manual and automatic alike.
    async fn applied_codes(&self) -> Result<Vec<String>, ApplicationError>;

    /// May trigger a nested recalculation on the same context.
    async fn apply_coupon(&self, code: &str) -> Result<(), ApplicationError>;

    async fn remove_coupon(&self, code: &str) -> Result<(), ApplicationError>;

    async fn notify(&self, notice: CartNotice);
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase()
}

/// Per-cart recalculation state. Holding its guard marks a reconciliation
/// in progress; nested recalculations see it and return immediately.
#[derive(Debug, Default)]
pub struct RecalculationContext {
    reconciling: AtomicBool,
}

impl RecalculationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the reconciliation section, or `None` when already inside it.
    pub fn enter(&self) -> Option<ReconcileGuard<'_>> {
        self.reconciling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconcileGuard { context: self })
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct ReconcileGuard<'a> {
    context: &'a RecalculationContext,
}

impl Drop for ReconcileGuard<'_> {
    fn drop(&mut self) {
        self.context.reconciling.store(false, Ordering::Release);
    }
}

/// Codes the engine applied in this session, stored normalized.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AutoAppliedCoupons(BTreeSet<String>);

impl AutoAppliedCoupons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(&normalize_code(code))
    }

    pub fn insert(&mut self, code: &str) -> bool {
        self.0.insert(normalize_code(code))
    }

    pub fn remove(&mut self, code: &str) -> bool {
        self.0.remove(&normalize_code(code))
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CouponChanges {
    pub applied: Vec<String>,
    pub removed: Vec<String>,
    /// Qualifying codes that failed the integrity checks.
    pub skipped: Vec<String>,
}

impl CouponChanges {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.removed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReconcileOutcome {
    /// Called from inside a running reconciliation; nothing was done.
    Reentrant,
    /// A dependency failed; the cart was left as it was.
    Degraded,
    Reconciled(CouponChanges),
}

pub struct CouponAutoApply {
    rules: Arc<dyn RuleRepository>,
    catalog: Arc<dyn CatalogAdapter>,
}

impl CouponAutoApply {
    pub fn new(rules: Arc<dyn RuleRepository>, catalog: Arc<dyn CatalogAdapter>) -> Self {
        Self { rules, catalog }
    }

    pub async fn on_cart_recalculated(
        &self,
        context: &RecalculationContext,
        host: &dyn CartHost,
        lines: &[CartLine],
        session: &mut AutoAppliedCoupons,
    ) -> ReconcileOutcome {
        self.on_cart_recalculated_at(context, host, lines, session, Utc::now()).await
    }

    pub async fn on_cart_recalculated_at(
        &self,
        context: &RecalculationContext,
        host: &dyn CartHost,
        lines: &[CartLine],
        session: &mut AutoAppliedCoupons,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        let Some(_guard) = context.enter() else {
            debug!(
                event_name = "coupon.reconcile.reentrant",
                "nested cart recalculation ignored"
            );
            return ReconcileOutcome::Reentrant;
        };

        match self.reconcile(host, lines, session, now).await {
            Ok(changes) => {
                if !changes.is_empty() {
                    info!(
                        event_name = "coupon.reconcile.completed",
                        applied = changes.applied.len(),
                        removed = changes.removed.len(),
                        skipped = changes.skipped.len(),
                        "auto-applied coupons reconciled"
                    );
                }
                ReconcileOutcome::Reconciled(changes)
            }
            Err(error) => {
                warn!(
                    event_name = "coupon.reconcile.degraded",
                    error_class = error.error_class(),
                    error = %error,
                    "coupon reconciliation failed; cart left unchanged"
                );
                ReconcileOutcome::Degraded
            }
        }
    }

    /// Coupons whose rules the cart satisfies, in rule precedence order. The
    /// first rule carrying a code decides its message.
    pub async fn qualifying_coupons(
        &self,
        lines: &[CartLine],
        now: DateTime<Utc>,
    ) -> Result<Vec<CouponRef>, ApplicationError> {
        let mut rules: Vec<Rule> = self
            .rules
            .list_coupon_rules()
            .await?
            .into_iter()
            .filter(|rule| rule.is_live_at(now))
            .collect();
        rules.sort_by_key(Rule::precedence);

        let profiles = self.line_profiles(lines).await?;
        if rules.is_empty() || profiles.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<_> = rules.iter().map(|rule| rule.id).collect();
        let conditions = self.rules.condition_groups_for(&ids).await?;
        let actions = self.rules.action_groups_for(&ids).await?;
        let descendants = collect_descendants(self.catalog.as_ref(), conditions.values().flatten()).await?;

        let mut seen = HashSet::new();
        let mut coupons = Vec::new();
        for rule in &rules {
            let groups = conditions.get(&rule.id).map(Vec::as_slice).unwrap_or_default();
            if first_satisfied_cart_group(groups, &profiles, &descendants).is_none() {
                continue;
            }

            let rule_coupons = actions
                .get(&rule.id)
                .into_iter()
                .flatten()
                .flat_map(|group| group.coupons());
            for coupon in rule_coupons {
                let code = normalize_code(&coupon.code);
                if !code.is_empty() && seen.insert(code.clone()) {
                    coupons.push(CouponRef { code, message: coupon.message.clone() });
                }
            }
        }
        Ok(coupons)
    }

    async fn line_profiles(&self, lines: &[CartLine]) -> Result<Vec<CartLineProfile>, ApplicationError> {
        let mut profiles = Vec::with_capacity(lines.len());
        for line in lines.iter().filter(|line| line.quantity > 0) {
            match subject_profile(self.catalog.as_ref(), line.item_id).await {
                Ok(subject) => profiles.push(CartLineProfile { subject, quantity: line.quantity }),
                Err(CatalogError::UnknownItem(item_id)) => {
                    debug!(
                        event_name = "coupon.evaluate.unknown_item",
                        item_id = item_id.0,
                        "cart line ignored; item not in catalog"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(profiles)
    }

    async fn reconcile(
        &self,
        host: &dyn CartHost,
        lines: &[CartLine],
        session: &mut AutoAppliedCoupons,
        now: DateTime<Utc>,
    ) -> Result<CouponChanges, ApplicationError> {
        let qualifying = self.qualifying_coupons(lines, now).await?;
        let applied: HashSet<String> =
            host.applied_codes().await?.iter().map(|code| normalize_code(code)).collect();
        let mut changes = CouponChanges::default();

        for coupon in &qualifying {
            if applied.contains(&coupon.code) {
                continue;
            }

            let check = match host.find_coupon(&coupon.code).await? {
                Some(found) => found.basic_check(now),
                None => Err(CouponRejection::NotFound),
            };
            if let Err(rejection) = check {
                debug!(
                    event_name = "coupon.reconcile.skipped",
                    code = %coupon.code,
                    rejection = ?rejection,
                    "qualifying coupon failed integrity checks"
                );
                changes.skipped.push(coupon.code.clone());
                continue;
            }

            host.apply_coupon(&coupon.code).await?;
            session.insert(&coupon.code);
            host.notify(CartNotice::CouponApplied {
                code: coupon.code.clone(),
                message: coupon
                    .message
                    .clone()
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_COUPON_APPLIED.to_owned()),
            })
            .await;
            debug!(event_name = "coupon.reconcile.applied", code = %coupon.code, "coupon auto-applied");
            changes.applied.push(coupon.code.clone());
        }

        let still_qualifying: HashSet<&str> =
            qualifying.iter().map(|coupon| coupon.code.as_str()).collect();
        let stale: Vec<String> = session
            .codes()
            .filter(|code| !still_qualifying.contains(code))
            .map(str::to_owned)
            .collect();
        for code in stale {
            if applied.contains(&code) {
                host.remove_coupon(&code).await?;
                host.notify(CartNotice::CouponRemoved { code: code.clone() }).await;
                debug!(event_name = "coupon.reconcile.removed", code = %code, "auto-applied coupon removed");
                changes.removed.push(code.clone());
            }
            session.remove(&code);
        }

        Ok(changes)
    }
}

/// Lets an auto-applied coupon through when the discount engine rejected it
/// only for unmet manual-entry prerequisites. Expiry, suspension and usage
/// limits are never overridden.
pub fn validity_override(
    coupon: Option<&Coupon>,
    verdict: CouponVerdict,
    session: &AutoAppliedCoupons,
    now: DateTime<Utc>,
) -> CouponVerdict {
    let overridable =
        matches!(&verdict, CouponVerdict::Rejected(rejection) if rejection.is_overridable());
    let Some(coupon) = coupon.filter(|coupon| {
        overridable && session.contains(&coupon.code) && coupon.basic_check(now).is_ok()
    }) else {
        return verdict;
    };

    debug!(
        event_name = "coupon.validity.overridden",
        code = %coupon.code,
        "auto-applied coupon kept valid despite manual-entry prerequisites"
    );
    CouponVerdict::Valid
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use tokio::sync::Mutex;
    use upsell_core::catalog::InMemoryCatalog;
    use upsell_core::domain::action::{Action, ActionGroup, ActionSource};
    use upsell_core::domain::cart::{CartLine, CartNotice, GENERIC_COUPON_APPLIED};
    use upsell_core::domain::coupon::{Coupon, CouponRejection, CouponStatus, CouponVerdict};
    use upsell_core::domain::item::ItemId;
    use upsell_core::domain::rule::{Condition, ConditionAttribute, ConditionGroup, NewRule};
    use upsell_core::errors::ApplicationError;
    use upsell_db::{InMemoryRuleRepository, RuleRepository};

    use super::{
        validity_override, AutoAppliedCoupons, CartHost, CouponAutoApply, ReconcileOutcome,
        RecalculationContext,
    };

    #[derive(Default)]
    struct FakeCart {
        coupons: Vec<Coupon>,
        applied: Mutex<Vec<String>>,
        notices: Mutex<Vec<CartNotice>>,
    }

    impl FakeCart {
        fn with_coupons(coupons: Vec<Coupon>) -> Self {
            Self { coupons, ..Self::default() }
        }
    }

    #[async_trait]
    impl CartHost for FakeCart {
        async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, ApplicationError> {
            Ok(self.coupons.iter().find(|coupon| coupon.code.eq_ignore_ascii_case(code)).cloned())
        }

        async fn applied_codes(&self) -> Result<Vec<String>, ApplicationError> {
            Ok(self.applied.lock().await.clone())
        }

        async fn apply_coupon(&self, code: &str) -> Result<(), ApplicationError> {
            self.applied.lock().await.push(code.to_owned());
            Ok(())
        }

        async fn remove_coupon(&self, code: &str) -> Result<(), ApplicationError> {
            self.applied.lock().await.retain(|applied| !applied.eq_ignore_ascii_case(code));
            Ok(())
        }

        async fn notify(&self, notice: CartNotice) {
            self.notices.lock().await.push(notice);
        }
    }

    fn category() -> ConditionAttribute {
        ConditionAttribute::Taxonomy("category".to_owned())
    }

    async fn engine() -> (CouponAutoApply, Arc<InMemoryRuleRepository>) {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_item(1, "Service 9", Decimal::new(59_900, 2), &[("category", "handguns")]);
        catalog.add_item(2, "9mm Box", Decimal::new(1_999, 2), &[("category", "ammo")]);

        let rules = Arc::new(InMemoryRuleRepository::default());
        let ammo = rules.create(NewRule::new("Ammo bulk", 10)).await.expect("create");
        rules
            .save_condition_groups(
                ammo.id,
                &[ConditionGroup::new(1, vec![Condition::equals(category(), "ammo").with_min_quantity(3)])],
            )
            .await
            .expect("save conditions");
        rules
            .save_action_groups(
                ammo.id,
                &[ActionGroup::new(1, vec![Action::apply_coupon("AMMO10", Some("Bulk ammo discount applied!".to_owned()))])],
            )
            .await
            .expect("save actions");

        let handgun = rules.create(NewRule::new("Handgun bonus", 5)).await.expect("create");
        rules
            .save_condition_groups(handgun.id, &[ConditionGroup::new(1, vec![Condition::equals(category(), "handguns")])])
            .await
            .expect("save conditions");
        rules
            .save_action_groups(
                handgun.id,
                &[ActionGroup::new(
                    1,
                    vec![Action::apply_coupon("RANGEDAY", None), Action::new(ActionSource::Category, "holsters", 4)],
                )],
            )
            .await
            .expect("save actions");

        (CouponAutoApply::new(rules.clone(), Arc::new(catalog)), rules)
    }

    fn coupons() -> Vec<Coupon> {
        vec![Coupon::active("AMMO10"), Coupon::active("RANGEDAY"), Coupon::active("WELCOME")]
    }

    #[tokio::test]
    async fn quantity_thresholds_gate_coupon_rules() {
        let (engine, _) = engine().await;
        let now = Utc::now();

        let two_boxes = [CartLine::new(ItemId(2), 2, Decimal::new(1_999, 2))];
        assert!(engine.qualifying_coupons(&two_boxes, now).await.expect("evaluate").is_empty());

        let split = [
            CartLine::new(ItemId(2), 2, Decimal::new(1_999, 2)),
            CartLine::new(ItemId(2), 1, Decimal::new(1_999, 2)),
            CartLine::new(ItemId(1), 1, Decimal::new(59_900, 2)),
        ];
        let codes: Vec<_> = engine
            .qualifying_coupons(&split, now)
            .await
            .expect("evaluate")
            .into_iter()
            .map(|coupon| coupon.code)
            .collect();
        assert_eq!(codes, vec!["rangeday".to_owned(), "ammo10".to_owned()]);
    }

    #[tokio::test]
    async fn reconciliation_applies_and_removes_as_lines_change() {
        let (engine, _) = engine().await;
        let cart = FakeCart::with_coupons(coupons());
        let context = RecalculationContext::new();
        let mut session = AutoAppliedCoupons::new();

        let mut lines = vec![CartLine::new(ItemId(2), 3, Decimal::new(1_999, 2))];
        let outcome = engine.on_cart_recalculated(&context, &cart, &lines, &mut session).await;
        let ReconcileOutcome::Reconciled(changes) = outcome else { panic!("expected reconcile") };
        assert_eq!(changes.applied, vec!["ammo10".to_owned()]);
        assert!(session.contains("AMMO10"));
        assert_eq!(
            cart.notices.lock().await.clone(),
            vec![CartNotice::CouponApplied {
                code: "ammo10".to_owned(),
                message: "Bulk ammo discount applied!".to_owned(),
            }]
        );

        lines[0].quantity = 1;
        lines.push(CartLine::new(ItemId(1), 1, Decimal::new(59_900, 2)));
        let outcome = engine.on_cart_recalculated(&context, &cart, &lines, &mut session).await;
        let ReconcileOutcome::Reconciled(changes) = outcome else { panic!("expected reconcile") };
        assert_eq!(changes.applied, vec!["rangeday".to_owned()]);
        assert_eq!(changes.removed, vec!["ammo10".to_owned()]);
        assert_eq!(cart.applied.lock().await.clone(), vec!["rangeday".to_owned()]);
        assert!(cart.notices.lock().await.contains(&CartNotice::CouponApplied {
            code: "rangeday".to_owned(),
            message: GENERIC_COUPON_APPLIED.to_owned(),
        }));

        let outcome = engine.on_cart_recalculated(&context, &cart, &[], &mut session).await;
        let ReconcileOutcome::Reconciled(changes) = outcome else { panic!("expected reconcile") };
        assert_eq!(changes.removed, vec!["rangeday".to_owned()]);
        assert!(session.is_empty());
        assert!(cart.applied.lock().await.is_empty());
    }

    #[tokio::test]
    async fn manual_coupons_are_left_alone() {
        let (engine, _) = engine().await;
        let cart = FakeCart::with_coupons(coupons());
        cart.applied.lock().await.extend(["WELCOME".to_owned(), "RANGEDAY".to_owned()]);
        let context = RecalculationContext::new();
        let mut session = AutoAppliedCoupons::new();

        let lines = [CartLine::new(ItemId(1), 1, Decimal::new(59_900, 2))];
        let outcome = engine.on_cart_recalculated(&context, &cart, &lines, &mut session).await;
        assert_eq!(outcome, ReconcileOutcome::Reconciled(Default::default()));

        let outcome = engine.on_cart_recalculated(&context, &cart, &[], &mut session).await;
        assert_eq!(outcome, ReconcileOutcome::Reconciled(Default::default()));
        assert_eq!(
            cart.applied.lock().await.clone(),
            vec!["WELCOME".to_owned(), "RANGEDAY".to_owned()]
        );
    }

    #[tokio::test]
    async fn integrity_misses_are_skipped() {
        let (engine, _) = engine().await;
        let mut expired = Coupon::active("AMMO10");
        expired.expires_at = Some(Utc::now() - Duration::days(1));
        let cart = FakeCart::with_coupons(vec![expired]);
        let context = RecalculationContext::new();
        let mut session = AutoAppliedCoupons::new();

        let lines = [
            CartLine::new(ItemId(2), 5, Decimal::new(1_999, 2)),
            CartLine::new(ItemId(1), 1, Decimal::new(59_900, 2)),
        ];
        let outcome = engine.on_cart_recalculated(&context, &cart, &lines, &mut session).await;
        let ReconcileOutcome::Reconciled(changes) = outcome else { panic!("expected reconcile") };

        assert!(changes.applied.is_empty());
        assert_eq!(changes.skipped, vec!["rangeday".to_owned(), "ammo10".to_owned()]);
        assert!(session.is_empty());
        assert!(cart.notices.lock().await.is_empty());
    }

    #[tokio::test]
    async fn nested_recalculation_returns_immediately() {
        let (engine, _) = engine().await;
        let cart = FakeCart::with_coupons(coupons());
        let context = RecalculationContext::new();
        let mut session = AutoAppliedCoupons::new();
        let lines = [CartLine::new(ItemId(1), 1, Decimal::new(59_900, 2))];

        {
            let _guard = context.enter().expect("first entry");
            assert!(context.enter().is_none());
            let outcome = engine.on_cart_recalculated(&context, &cart, &lines, &mut session).await;
            assert_eq!(outcome, ReconcileOutcome::Reentrant);
        }

        assert!(!context.is_reconciling());
        let outcome = engine.on_cart_recalculated(&context, &cart, &lines, &mut session).await;
        assert!(matches!(outcome, ReconcileOutcome::Reconciled(_)));
        assert!(session.contains("rangeday"));
    }

    #[test]
    fn validity_override_only_covers_prerequisites_of_auto_applied_coupons() {
        let now = Utc::now();
        let coupon = Coupon::active("AMMO10");
        let mut session = AutoAppliedCoupons::new();
        let prerequisites =
            CouponVerdict::Rejected(CouponRejection::PrerequisitesUnmet("minimum spend".to_owned()));

        assert_eq!(validity_override(Some(&coupon), prerequisites.clone(), &session, now), prerequisites);

        session.insert("ammo10");
        assert_eq!(validity_override(Some(&coupon), prerequisites.clone(), &session, now), CouponVerdict::Valid);
        assert_eq!(validity_override(None, prerequisites.clone(), &session, now), prerequisites);

        let mut exhausted = coupon.clone();
        exhausted.usage_limit = Some(1);
        exhausted.usage_count = 1;
        assert_eq!(validity_override(Some(&exhausted), prerequisites.clone(), &session, now), prerequisites);

        let mut suspended = coupon.clone();
        suspended.status = CouponStatus::Suspended;
        assert_eq!(validity_override(Some(&suspended), prerequisites.clone(), &session, now), prerequisites);

        let expired = CouponVerdict::Rejected(CouponRejection::Expired);
        assert_eq!(validity_override(Some(&coupon), expired.clone(), &session, now), expired);
    }
}
