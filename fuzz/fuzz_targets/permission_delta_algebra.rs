#![no_main]

use std::collections::BTreeSet;

use libfuzzer_sys::fuzz_target;
use polar_governance_types::PermissionDelta;

fn split_permissions(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|permission| !permission.is_empty())
        .map(str::to_string)
        .collect()
}

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let (previous, next) = raw.split_once('|').unwrap_or((raw.as_ref(), ""));
    let previous = split_permissions(previous);
    let next = split_permissions(next);
    let delta = PermissionDelta::compute(&previous, &next);

    let added: BTreeSet<String> = delta.added.iter().cloned().collect();
    let removed: BTreeSet<String> = delta.removed.iter().cloned().collect();
    let retained: BTreeSet<String> = delta.retained.iter().cloned().collect();

    assert!(added.is_disjoint(&removed));
    assert!(retained.is_disjoint(&added));
    assert_eq!(added, next.difference(&previous).cloned().collect());
    assert_eq!(removed, previous.difference(&next).cloned().collect());
    assert_eq!(retained, previous.intersection(&next).cloned().collect());
    assert_eq!(delta.is_unchanged(), previous == next);
});
