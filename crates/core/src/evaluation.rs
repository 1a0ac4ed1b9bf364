//! Boolean rule evaluation: OR across condition groups, AND within a group.
//!
//! Evaluation is pure. Everything that needs the catalog (the subject's terms,
//! descendant terms of `include_children` conditions) is resolved up front into
//! a [`SubjectProfile`] and a [`Descendants`] map, so the item matcher and the
//! cart-level coupon evaluator share the same logic.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::item::{taxonomy, CatalogItem, ItemId, TaxonomyTerm};
use crate::domain::rule::{Condition, ConditionAttribute, ConditionGroup, Exclusions};
use crate::keys::ConditionKey;

/// Everything the evaluator knows about one item being matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectProfile {
    pub item_id: ItemId,
    pub keys: HashSet<ConditionKey>,
    /// Category slugs in catalog order; the first one is the primary category.
    pub categories: Vec<String>,
    pub price: Option<Decimal>,
}

impl SubjectProfile {
    /// Builds the key set: one key per membership, the identity key and the sentinel.
    pub fn new(item_id: ItemId, terms: &[TaxonomyTerm], price: Option<Decimal>) -> Self {
        let mut keys: HashSet<ConditionKey> = terms.iter().map(ConditionKey::term).collect();
        keys.insert(ConditionKey::item(item_id));
        keys.insert(ConditionKey::sentinel());

        let categories = terms
            .iter()
            .filter(|term| term.taxonomy.eq_ignore_ascii_case(taxonomy::CATEGORY))
            .map(|term| term.slug.to_ascii_lowercase())
            .collect();

        Self { item_id, keys, categories, price }
    }

    pub fn from_item(item: &CatalogItem) -> Self {
        Self::new(item.id, &item.terms, item.price)
    }

    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    pub fn in_category(&self, slug: &str) -> bool {
        self.keys.contains(&ConditionKey::taxonomy(taxonomy::CATEGORY, slug))
    }

    /// The subject's own term slugs in `taxonomy`, sorted.
    pub fn slugs_in(&self, taxonomy: &str) -> Vec<String> {
        let taxonomy = taxonomy.trim().to_ascii_lowercase();
        let mut slugs: Vec<String> = self
            .keys
            .iter()
            .filter_map(|key| key.as_str().split_once(':'))
            .filter(|(name, _)| *name == taxonomy)
            .map(|(_, slug)| slug.to_owned())
            .collect();
        slugs.sort();
        slugs
    }

    /// Keys worth looking up in the index. All of them, sentinel included.
    pub fn lookup_keys(&self) -> Vec<ConditionKey> {
        let mut keys: Vec<_> = self.keys.iter().cloned().collect();
        keys.sort();
        keys
    }
}

/// Descendant keys for every `include_children` condition value in play.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Descendants(HashMap<ConditionKey, HashSet<ConditionKey>>);

impl Descendants {
    pub fn insert(&mut self, parent: ConditionKey, children: impl IntoIterator<Item = ConditionKey>) {
        self.0.entry(parent).or_default().extend(children);
    }

    pub fn contains_parent(&self, parent: &ConditionKey) -> bool {
        self.0.contains_key(parent)
    }

    pub fn of(&self, parent: &ConditionKey) -> Option<&HashSet<ConditionKey>> {
        self.0.get(parent)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    /// The subject hit one of the condition's exclusion sub-filters.
    Excluded,
    Passed,
    Failed,
}

pub fn is_excluded(exclusions: &Exclusions, subject: &SubjectProfile) -> bool {
    if exclusions.items.contains(&subject.item_id) {
        return true;
    }
    if exclusions.categories.iter().any(|slug| subject.in_category(slug)) {
        return true;
    }
    match (exclusions.price_range, subject.price) {
        (Some(range), Some(price)) if !range.is_unbounded() => range.contains(price),
        _ => false,
    }
}

/// Whether the subject carries the condition's key, ignoring the operator.
pub fn key_matched(
    condition: &Condition,
    subject: &SubjectProfile,
    descendants: &Descendants,
) -> bool {
    let direct = condition.keys();
    if direct.iter().any(|key| subject.keys.contains(key)) {
        return true;
    }

    if condition.attribute == ConditionAttribute::SpecificItem {
        return ItemId::parse_list(&condition.value).contains(&subject.item_id);
    }

    condition.expands_children()
        && direct.iter().any(|parent| {
            descendants
                .of(parent)
                .is_some_and(|children| children.iter().any(|child| subject.keys.contains(child)))
        })
}

pub fn evaluate_condition(
    condition: &Condition,
    subject: &SubjectProfile,
    descendants: &Descendants,
) -> ConditionOutcome {
    if is_excluded(&condition.exclusions, subject) {
        return ConditionOutcome::Excluded;
    }
    if condition.operator.apply(key_matched(condition, subject, descendants)) {
        ConditionOutcome::Passed
    } else {
        ConditionOutcome::Failed
    }
}

/// AND across the group's conditions, short-circuiting on the first failure.
/// An empty group never matches.
pub fn group_matches(
    group: &ConditionGroup,
    subject: &SubjectProfile,
    descendants: &Descendants,
) -> bool {
    !group.conditions.is_empty()
        && group.conditions.iter().all(|condition| {
            evaluate_condition(condition, subject, descendants) == ConditionOutcome::Passed
        })
}

/// OR across groups. Returns the id of the first satisfied group.
pub fn first_matching_group(
    groups: &[ConditionGroup],
    subject: &SubjectProfile,
    descendants: &Descendants,
) -> Option<u32> {
    groups
        .iter()
        .find(|group| group_matches(group, subject, descendants))
        .map(|group| group.group_id)
}

/// One cart line as seen by the cart-level evaluator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CartLineProfile {
    pub subject: SubjectProfile,
    pub quantity: u32,
}

/// Sum of quantities over lines that are not excluded and pass the key/operator test.
pub fn qualifying_quantity(
    condition: &Condition,
    lines: &[CartLineProfile],
    descendants: &Descendants,
) -> u64 {
    lines
        .iter()
        .filter(|line| {
            evaluate_condition(condition, &line.subject, descendants) == ConditionOutcome::Passed
        })
        .map(|line| u64::from(line.quantity))
        .sum()
}

pub fn cart_condition_satisfied(
    condition: &Condition,
    lines: &[CartLineProfile],
    descendants: &Descendants,
) -> bool {
    qualifying_quantity(condition, lines, descendants) >= u64::from(condition.min_quantity.max(1))
}

pub fn first_satisfied_cart_group(
    groups: &[ConditionGroup],
    lines: &[CartLineProfile],
    descendants: &Descendants,
) -> Option<u32> {
    groups
        .iter()
        .find(|group| {
            !group.conditions.is_empty()
                && group
                    .conditions
                    .iter()
                    .all(|condition| cart_condition_satisfied(condition, lines, descendants))
        })
        .map(|group| group.group_id)
}
