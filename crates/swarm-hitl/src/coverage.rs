//! Clarification coverage scoring and context merging.
//!
//! Coverage is the weighted ratio of filled subfields across the five
//! clarification categories. The clarifier's self-reported progress is
//! advisory; the state machine trusts only this computation.

use std::collections::BTreeMap;

use swarm_core::Json;
use swarm_store::GatheredContext;

/// Category weights; sum to 100.
pub const CATEGORY_WEIGHTS: [(&str, u8); 5] = [
    ("project_type", 20),
    ("tech_stack", 25),
    ("scale", 15),
    ("features", 25),
    ("constraints", 15),
];

/// Expected subfields per category. A category scores by how many of these
/// carry a non-empty value.
#[must_use]
pub fn expected_subfields(category: &str) -> &'static [&'static str] {
    match category {
        "project_type" => &["kind", "platform", "audience"],
        "tech_stack" => &["language", "framework", "storage"],
        "scale" => &["users", "availability"],
        "features" => &["core", "integrations"],
        "constraints" => &["timeline", "compliance"],
        _ => &[],
    }
}

/// Deep-merge newly gathered categories into the accumulated context.
///
/// Additive: existing subfields are refined (object values merge
/// recursively, scalars are replaced), never removed.
pub fn merge_gathered(
    gathered: &mut GatheredContext,
    incoming: &BTreeMap<String, BTreeMap<String, Json>>,
) {
    for (category, subfields) in incoming {
        let target = gathered.categories.entry(category.clone()).or_default();
        for (name, value) in subfields {
            match target.get_mut(name) {
                Some(existing) => merge_json(existing, value),
                None => {
                    target.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

fn merge_json(existing: &mut Json, incoming: &Json) {
    match (existing, incoming) {
        (Json::Object(existing), Json::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(key) {
                    Some(nested) => merge_json(nested, value),
                    None => {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (existing, incoming) => *existing = incoming.clone(),
    }
}

/// Compute the weighted coverage percentage for the gathered context.
#[must_use]
pub fn compute_coverage(gathered: &GatheredContext) -> u8 {
    let mut total = 0.0_f64;
    for (category, weight) in CATEGORY_WEIGHTS {
        let expected = expected_subfields(category);
        if expected.is_empty() {
            continue;
        }

        let filled = gathered
            .categories
            .get(category)
            .map_or(0, |subfields| {
                expected
                    .iter()
                    .filter(|name| subfields.get(**name).is_some_and(is_filled))
                    .count()
            });

        let ratio = filled as f64 / expected.len() as f64;
        total += f64::from(weight) * ratio.min(1.0);
    }

    total.round().clamp(0.0, 100.0) as u8
}

fn is_filled(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::String(s) => !s.trim().is_empty(),
        Json::Array(items) => !items.is_empty(),
        Json::Object(map) => !map.is_empty(),
        Json::Bool(_) | Json::Number(_) => true,
    }
}
