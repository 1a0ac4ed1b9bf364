use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use upsell_core::affinity::InMemoryAffinitySource;
use upsell_core::catalog::InMemoryCatalog;
use upsell_core::config::EngineConfig;
use upsell_core::domain::action::{Action, ActionSource, ResultOrder};
use upsell_core::domain::cart::{CartLine, CartNotice};
use upsell_core::domain::coupon::Coupon;
use upsell_core::domain::item::ItemId;
use upsell_core::domain::rule::{Condition, ConditionAttribute, NewRule};
use upsell_core::errors::ApplicationError;
use upsell_db::{
    connect_with_settings, migrations, DbPool, InMemoryRuleIndexRepository,
    InMemoryRuleRepository, RuleIndexRepository, SqlRuleIndexRepository, SqlRuleRepository,
};
use upsell_engine::{
    AutoAppliedCoupons, CartHost, RecalculationContext, RecommendationRequest, ReconcileOutcome,
    RuleDefinition, UpsellEngine,
};

fn category(slug: &str) -> Condition {
    Condition::equals(ConditionAttribute::Taxonomy("category".to_owned()), slug)
}

fn tag(slug: &str) -> Condition {
    Condition::equals(ConditionAttribute::Taxonomy("tag".to_owned()), slug)
}

fn store_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_term("category", "firearms", None);
    catalog.add_term("category", "handguns", Some("firearms"));
    catalog.add_term("category", "rifles", Some("firearms"));
    catalog.add_term("category", "accessories", None);
    catalog.add_term("category", "holsters", Some("accessories"));

    catalog.add_item(1, "Service 9", Decimal::new(59_900, 2), &[("category", "handguns")]);
    catalog.add_item(2, "Bolt Rifle", Decimal::new(89_900, 2), &[("category", "rifles")]);
    catalog.add_item(
        3,
        "Clearance Scope",
        Decimal::new(19_900, 2),
        &[("category", "optics"), ("tag", "clearance")],
    );
    catalog.add_item(4, "Red Dot", Decimal::new(24_900, 2), &[("category", "optics")]);

    catalog.add_item(10, "IWB Holster", Decimal::new(4_500, 2), &[("category", "holsters")]).total_sales = 80;
    catalog.add_item(11, "OWB Holster", Decimal::new(5_500, 2), &[("category", "holsters")]).total_sales = 40;
    catalog.add_item(12, "Gun Belt", Decimal::new(3_900, 2), &[("category", "belts")]);
    catalog.add_item(20, "Bore Snake", Decimal::new(1_500, 2), &[("category", "cleaning")]);
    catalog.add_item(21, "Lens Pen", Decimal::new(900, 2), &[("category", "cleaning")]);
    catalog.add_item(30, "9mm Box", Decimal::new(1_999, 2), &[("category", "ammo")]);
    catalog
}

async fn sqlite_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
    migrations::run_pending(&pool).await.expect("run migrations");
    pool
}

fn sql_engine(pool: &DbPool) -> (UpsellEngine, Arc<SqlRuleIndexRepository>) {
    let index = Arc::new(SqlRuleIndexRepository::new(pool.clone()));
    let engine = UpsellEngine::new(
        &EngineConfig::default(),
        Arc::new(SqlRuleRepository::new(pool.clone())),
        index.clone(),
        Arc::new(store_catalog()),
        Arc::new(InMemoryAffinitySource::new()),
    );
    (engine, index)
}

#[tokio::test]
async fn handgun_buyers_see_holsters_from_the_highest_precedence_rule() {
    let pool = sqlite_pool().await;
    let (engine, _) = sql_engine(&pool);

    engine
        .admin
        .create_rule(
            RuleDefinition::new(NewRule::new("Firearm belts", 10))
                .when(vec![category("firearms").with_children()])
                .then(vec![Action::specific_items(vec![ItemId(12)])]),
        )
        .await
        .expect("create R2");
    let holsters = engine
        .admin
        .create_rule(
            RuleDefinition::new(NewRule::new("Handgun holsters", 5))
                .when(vec![category("handguns")])
                .then(vec![Action::new(ActionSource::Category, "holsters", 4)
                    .ordered_by(ResultOrder::Bestselling)]),
        )
        .await
        .expect("create R1");

    let items = engine
        .recommendations
        .get_recommendations(&RecommendationRequest::new(ItemId(1)))
        .await;
    assert_eq!(items, vec![ItemId(10), ItemId(11)]);

    let diagnostics = engine.recommendations.get_diagnostics(ItemId(1)).await;
    assert_eq!(diagnostics.matched.map(|matched| matched.rule_id), Some(holsters.id));
    assert_eq!(diagnostics.candidates.len(), 2);

    let rifle_items = engine
        .recommendations
        .get_recommendations(&RecommendationRequest::new(ItemId(2)))
        .await;
    assert_eq!(rifle_items, vec![ItemId(12)]);

    let capped = engine
        .recommendations
        .get_recommendations(&RecommendationRequest::new(ItemId(1)).with_limit(1))
        .await;
    assert_eq!(capped, vec![ItemId(10)]);

    pool.close().await;
}

#[tokio::test]
async fn rifles_or_clearance_optics_union_and_intersection() {
    let pool = sqlite_pool().await;
    let (engine, _) = sql_engine(&pool);

    engine
        .admin
        .create_rule(
            RuleDefinition::new(NewRule::new("Cleaning upsell", 1))
                .when(vec![category("rifles")])
                .when(vec![tag("clearance"), category("optics")])
                .then(vec![
                    Action::specific_items(vec![ItemId(21), ItemId(20), ItemId(12)]),
                    Action::new(ActionSource::Category, "cleaning", 10),
                ])
                .then(vec![Action::specific_items(vec![ItemId(12)])]),
        )
        .await
        .expect("create rule");

    let expected = vec![ItemId(21), ItemId(20), ItemId(12)];
    for subject in [ItemId(2), ItemId(3)] {
        let items = engine
            .recommendations
            .get_recommendations(&RecommendationRequest::new(subject))
            .await;
        assert_eq!(items, expected, "subject {subject}");
    }

    let optics_only = engine
        .recommendations
        .get_recommendations(&RecommendationRequest::new(ItemId(4)))
        .await;
    assert!(optics_only.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn out_of_window_rules_never_win() {
    let pool = sqlite_pool().await;
    let (engine, _) = sql_engine(&pool);
    let now = Utc::now();

    let mut expired = NewRule::new("Last season", 1);
    expired.starts_at = Some(now - Duration::days(30));
    expired.ends_at = Some(now - Duration::days(1));
    engine
        .admin
        .create_rule(
            RuleDefinition::new(expired)
                .when(vec![category("handguns")])
                .then(vec![Action::specific_items(vec![ItemId(12)])]),
        )
        .await
        .expect("create expired");
    engine
        .admin
        .create_rule(
            RuleDefinition::new(NewRule::new("Evergreen", 9))
                .when(vec![category("handguns")])
                .then(vec![Action::specific_items(vec![ItemId(20)])]),
        )
        .await
        .expect("create evergreen");

    let items = engine
        .recommendations
        .get_recommendations_at(&RecommendationRequest::new(ItemId(1)), now)
        .await;
    assert_eq!(items, vec![ItemId(20)]);

    let last_week = RecommendationRequest::new(ItemId(1)).with_limit(5);
    let items = engine
        .recommendations
        .get_recommendations_at(&last_week, now - Duration::days(7))
        .await;
    assert_eq!(items, vec![ItemId(12)]);

    pool.close().await;
}

#[tokio::test]
async fn full_rebuild_reproduces_per_rule_entries() {
    let pool = sqlite_pool().await;
    let (engine, index) = sql_engine(&pool);

    let rule = engine
        .admin
        .create_rule(
            RuleDefinition::new(NewRule::new("Firearms", 3))
                .when(vec![category("firearms").with_children()])
                .when(vec![Condition::not_equals(
                    ConditionAttribute::Taxonomy("category".to_owned()),
                    "ammo",
                )])
                .then(vec![Action::specific_items(vec![ItemId(20)])]),
        )
        .await
        .expect("create rule");
    let incremental = index.entries_for_rule(rule.id).await.expect("entries");

    let summary = engine.admin.rebuild_index().await.expect("rebuild");
    let rebuilt = index.entries_for_rule(rule.id).await.expect("entries");

    assert_eq!(incremental, rebuilt);
    assert_eq!(summary.entries, rebuilt.len());
    assert_eq!(summary.cleared_entries, rebuilt.len() as u64);
    assert_eq!(rebuilt.len(), 4);

    pool.close().await;
}

#[derive(Default)]
struct SessionCart {
    coupons: Vec<Coupon>,
    applied: Mutex<Vec<String>>,
    notices: Mutex<Vec<CartNotice>>,
}

#[async_trait]
impl CartHost for SessionCart {
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

#[tokio::test]
async fn coupons_follow_the_cart_and_spare_manual_codes() {
    let engine = UpsellEngine::new(
        &EngineConfig::default(),
        Arc::new(InMemoryRuleRepository::default()),
        Arc::new(InMemoryRuleIndexRepository::default()),
        Arc::new(store_catalog()),
        Arc::new(InMemoryAffinitySource::new()),
    );
    engine
        .admin
        .create_rule(
            RuleDefinition::new(NewRule::new("Holster promo", 2))
                .when(vec![category("firearms").with_children()])
                .then(vec![
                    Action::apply_coupon("HOLSTER15", Some("15% off holsters unlocked".to_owned())),
                    Action::new(ActionSource::Category, "holsters", 4),
                ]),
        )
        .await
        .expect("create coupon rule");

    let cart = SessionCart {
        coupons: vec![Coupon::active("HOLSTER15"), Coupon::active("NEWSLETTER")],
        ..SessionCart::default()
    };
    cart.applied.lock().await.push("NEWSLETTER".to_owned());
    let context = RecalculationContext::new();
    let mut session = AutoAppliedCoupons::new();

    let ammo_only = vec![CartLine::new(ItemId(30), 2, Decimal::new(1_999, 2))];
    let outcome = engine.coupons.on_cart_recalculated(&context, &cart, &ammo_only, &mut session).await;
    assert!(matches!(outcome, ReconcileOutcome::Reconciled(ref changes) if changes.is_empty()));

    let mut with_rifle = ammo_only.clone();
    with_rifle.push(CartLine::new(ItemId(2), 1, Decimal::new(89_900, 2)));
    engine.coupons.on_cart_recalculated(&context, &cart, &with_rifle, &mut session).await;
    assert_eq!(
        cart.applied.lock().await.clone(),
        vec!["NEWSLETTER".to_owned(), "holster15".to_owned()]
    );
    assert!(cart.notices.lock().await.contains(&CartNotice::CouponApplied {
        code: "holster15".to_owned(),
        message: "15% off holsters unlocked".to_owned(),
    }));

    engine.coupons.on_cart_recalculated(&context, &cart, &ammo_only, &mut session).await;
    assert_eq!(cart.applied.lock().await.clone(), vec!["NEWSLETTER".to_owned()]);
    assert!(session.is_empty());

    engine.coupons.on_cart_recalculated(&context, &cart, &with_rifle, &mut session).await;
    assert!(session.contains("HOLSTER15"));
    assert_eq!(cart.applied.lock().await.len(), 2);
}
