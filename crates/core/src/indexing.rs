//! Derivation of inverted-index entries from a rule's conditions.
//!
//! The index is a projection of rule state and is never authoritative: it only
//! narrows the candidate set, and the matcher re-verifies every candidate. The
//! derivation is therefore allowed to over-approximate (sentinel keys) but must
//! never under-approximate a rule that could match.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::rule::{ConditionGroup, ConditionOperator, Rule, RuleId};
use crate::evaluation::Descendants;
use crate::keys::ConditionKey;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub condition_key: ConditionKey,
    pub rule_id: RuleId,
    pub priority: i32,
}

/// Candidate surfaced by an index lookup, ordered by `(priority, rule_id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexCandidate {
    pub priority: i32,
    pub rule_id: RuleId,
}

/// Whether a rule carries at least one condition group that has conditions.
pub fn is_indexable(groups: &[ConditionGroup]) -> bool {
    groups.iter().any(|group| !group.conditions.is_empty())
}

/// Derives the de-duplicated, sorted entry set for one rule.
///
/// `descendants` must hold the descendant keys of every `include_children`
/// condition value; a value whose expansion exceeds `max_descendant_keys`
/// contributes the sentinel key instead of its descendants.
pub fn derive_index_entries(
    rule: &Rule,
    groups: &[ConditionGroup],
    descendants: &Descendants,
    max_descendant_keys: usize,
) -> Vec<IndexEntry> {
    if !is_indexable(groups) {
        return Vec::new();
    }

    let mut keys = BTreeSet::new();
    for condition in groups.iter().flat_map(|group| group.conditions.iter()) {
        if condition.operator == ConditionOperator::NotEquals {
            keys.insert(ConditionKey::sentinel());
            continue;
        }

        for key in condition.keys() {
            if condition.expands_children() {
                match descendants.of(&key) {
                    Some(children) if children.len() > max_descendant_keys => {
                        keys.insert(ConditionKey::sentinel());
                    }
                    Some(children) => keys.extend(children.iter().cloned()),
                    None => {}
                }
            }
            keys.insert(key);
        }
    }

    keys.into_iter()
        .map(|condition_key| IndexEntry { condition_key, rule_id: rule.id, priority: rule.priority })
        .collect()
}
