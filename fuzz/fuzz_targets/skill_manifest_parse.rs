#![no_main]

use libfuzzer_sys::fuzz_target;
use polar_skills::{collect_missing_metadata, enrich_capability, parse_skill_manifest};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let Ok(manifest) = parse_skill_manifest(&raw) else {
        return;
    };

    assert!(!manifest.extension_id.trim().is_empty());
    assert!(!manifest.capabilities.is_empty());
    assert!(manifest
        .permissions
        .iter()
        .all(|permission| !permission.trim().is_empty()));

    let ids = manifest.capability_ids();
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    let capabilities: Vec<_> = manifest
        .capabilities
        .iter()
        .map(|declared| enrich_capability(declared, None))
        .collect();
    for missing in collect_missing_metadata(&capabilities) {
        assert!(ids.contains(&missing.capability_id));
        assert!(!missing.missing_fields.is_empty());
    }
});
