//! Catalog lookups that turn ids and conditions into evaluator inputs.

use upsell_core::catalog::{CatalogAdapter, CatalogError};
use upsell_core::domain::item::ItemId;
use upsell_core::domain::rule::{ConditionAttribute, ConditionGroup};
use upsell_core::evaluation::{Descendants, SubjectProfile};
use upsell_core::keys::ConditionKey;

pub async fn subject_profile(
    catalog: &dyn CatalogAdapter,
    item_id: ItemId,
) -> Result<SubjectProfile, CatalogError> {
    let terms = catalog.taxonomy_memberships(item_id).await?;
    let price = catalog.price(item_id).await?;
    Ok(SubjectProfile::new(item_id, &terms, price))
}

/// Resolves descendant keys for every `include_children` condition value in
/// `groups`. Values naming an unknown term resolve to an empty set.
pub async fn collect_descendants<'a>(
    catalog: &dyn CatalogAdapter,
    groups: impl IntoIterator<Item = &'a ConditionGroup>,
) -> Result<Descendants, CatalogError> {
    let mut descendants = Descendants::default();

    for condition in groups.into_iter().flat_map(|group| group.conditions.iter()) {
        if !condition.expands_children() {
            continue;
        }
        let ConditionAttribute::Taxonomy(taxonomy) = &condition.attribute else {
            continue;
        };

        let slug = condition.value.trim();
        let parent = ConditionKey::taxonomy(taxonomy, slug);
        if slug.is_empty() || descendants.contains_parent(&parent) {
            continue;
        }

        let children = match catalog.find_term(taxonomy, slug).await? {
            Some(term) => catalog.descendant_terms(taxonomy, term.id).await?,
            None => Vec::new(),
        };
        descendants.insert(parent, children.iter().map(ConditionKey::term));
    }

    Ok(descendants)
}

/// Slugs of `slug` and every term below it in `taxonomy`.
pub async fn expand_slug(
    catalog: &dyn CatalogAdapter,
    taxonomy: &str,
    slug: &str,
) -> Result<Vec<String>, CatalogError> {
    let mut slugs = vec![slug.to_owned()];
    if let Some(term) = catalog.find_term(taxonomy, slug).await? {
        slugs.extend(
            catalog.descendant_terms(taxonomy, term.id).await?.into_iter().map(|term| term.slug),
        );
    }
    Ok(slugs)
}
