use std::collections::{BTreeSet, HashSet};

/// Trims, drops blank entries, and collects identifiers into a sorted set.
pub fn normalize_id_set<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|value| value.as_ref().trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

/// Trims and de-duplicates identifiers while keeping first-seen order.
pub fn dedupe_preserving_order<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for value in values {
        let value = value.as_ref().trim();
        if value.is_empty() || !seen.insert(value.to_string()) {
            continue;
        }
        ordered.push(value.to_string());
    }
    ordered
}
