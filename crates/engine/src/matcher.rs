//! Resolves the winning rule for a subject item.
//!
//! The index only narrows the candidate set. Every candidate is re-checked
//! against the rule store (status, schedule, full boolean conditions) in
//! precedence order, and the first one with a satisfied group wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use upsell_core::catalog::CatalogAdapter;
use upsell_core::domain::item::ItemId;
use upsell_core::domain::rule::{Rule, RuleId, RuleStatus};
use upsell_core::errors::ApplicationError;
use upsell_core::evaluation::{first_matching_group, SubjectProfile};
use upsell_db::{RuleIndexRepository, RuleRepository};

use crate::profile::{collect_descendants, subject_profile};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchedRule {
    pub rule: Rule,
    /// The first condition group the subject satisfied.
    pub group_id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOutcome {
    Matched,
    /// Indexed but absent from the rule store.
    Missing,
    Inactive,
    OutsideSchedule,
    NoGroupSatisfied,
    /// Not evaluated because a rule with higher precedence already won.
    Outranked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CandidateReport {
    pub rule_id: RuleId,
    pub priority: i32,
    pub outcome: CandidateOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MatchTrace {
    pub candidates: Vec<CandidateReport>,
    pub matched: Option<MatchedRule>,
}

#[derive(Clone)]
pub struct Matcher {
    rules: Arc<dyn RuleRepository>,
    index: Arc<dyn RuleIndexRepository>,
    catalog: Arc<dyn CatalogAdapter>,
}

impl Matcher {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        index: Arc<dyn RuleIndexRepository>,
        catalog: Arc<dyn CatalogAdapter>,
    ) -> Self {
        Self { rules, index, catalog }
    }

    pub async fn resolve(&self, item_id: ItemId) -> Option<MatchedRule> {
        self.resolve_at(item_id, Utc::now()).await
    }

    /// Like [`Matcher::resolve`] with a caller-supplied clock. Failures are
    /// logged and treated as "no rule".
    pub async fn resolve_at(&self, item_id: ItemId, now: DateTime<Utc>) -> Option<MatchedRule> {
        match self.resolve_item(item_id, now).await {
            Ok(matched) => matched,
            Err(error) => {
                warn!(
                    event_name = "engine.match.degraded",
                    item_id = item_id.0,
                    error_class = error.error_class(),
                    error = %error,
                    "rule matching failed; treating as no match"
                );
                None
            }
        }
    }

    async fn resolve_item(
        &self,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchedRule>, ApplicationError> {
        let subject = self.profile(item_id).await?;
        self.resolve_subject(&subject, now).await
    }

    pub async fn profile(&self, item_id: ItemId) -> Result<SubjectProfile, ApplicationError> {
        Ok(subject_profile(self.catalog.as_ref(), item_id).await?)
    }

    pub async fn resolve_subject(
        &self,
        subject: &SubjectProfile,
        now: DateTime<Utc>,
    ) -> Result<Option<MatchedRule>, ApplicationError> {
        Ok(self.evaluate(subject, now, false).await?.matched)
    }

    /// Evaluates every candidate and records why each one did or did not win.
    pub async fn trace(
        &self,
        subject: &SubjectProfile,
        now: DateTime<Utc>,
    ) -> Result<MatchTrace, ApplicationError> {
        self.evaluate(subject, now, true).await
    }

    async fn evaluate(
        &self,
        subject: &SubjectProfile,
        now: DateTime<Utc>,
        record: bool,
    ) -> Result<MatchTrace, ApplicationError> {
        let candidates = self.index.candidates(&subject.lookup_keys()).await?;
        if candidates.is_empty() {
            debug!(
                event_name = "engine.match.no_candidates",
                item_id = subject.item_id.0,
                "no indexed rule overlaps the subject"
            );
            return Ok(MatchTrace::default());
        }

        let ids: Vec<RuleId> = candidates.iter().map(|candidate| candidate.rule_id).collect();
        let mut rules = self.rules.find_by_ids(&ids).await?;
        rules.sort_by_key(Rule::precedence);
        let mut groups = self.rules.condition_groups_for(&ids).await?;
        let descendants = collect_descendants(self.catalog.as_ref(), groups.values().flatten()).await?;

        let mut trace = MatchTrace::default();
        if record {
            trace.candidates.extend(
                candidates
                    .iter()
                    .filter(|candidate| !rules.iter().any(|rule| rule.id == candidate.rule_id))
                    .map(|candidate| CandidateReport {
                        rule_id: candidate.rule_id,
                        priority: candidate.priority,
                        outcome: CandidateOutcome::Missing,
                    }),
            );
        }

        for rule in rules {
            let outcome = if trace.matched.is_some() {
                CandidateOutcome::Outranked
            } else if rule.status != RuleStatus::Active {
                CandidateOutcome::Inactive
            } else if !rule.is_live_at(now) {
                CandidateOutcome::OutsideSchedule
            } else {
                let rule_groups = groups.remove(&rule.id).unwrap_or_default();
                match first_matching_group(&rule_groups, subject, &descendants) {
                    Some(group_id) => {
                        trace.matched = Some(MatchedRule { rule: rule.clone(), group_id });
                        CandidateOutcome::Matched
                    }
                    None => CandidateOutcome::NoGroupSatisfied,
                }
            };

            if record {
                trace.candidates.push(CandidateReport {
                    rule_id: rule.id,
                    priority: rule.priority,
                    outcome,
                });
            } else if trace.matched.is_some() {
                break;
            }
        }

        match &trace.matched {
            Some(matched) => debug!(
                event_name = "engine.match.resolved",
                item_id = subject.item_id.0,
                rule_id = matched.rule.id.0,
                group_id = matched.group_id,
                candidates = candidates.len(),
                "rule matched"
            ),
            None => debug!(
                event_name = "engine.match.none",
                item_id = subject.item_id.0,
                candidates = candidates.len(),
                "no candidate rule satisfied"
            ),
        }
        Ok(trace)
    }
}
