use anyhow::Result;
use polar_governance_types::{Capability, MissingMetadata};
use polar_skills::{
    collect_missing_metadata, enrich_capability, parse_skill_manifest, sha256_hex,
};
use serde::{Deserialize, Serialize};

/// Risk metadata report for a skill manifest, before any operator overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillInspection {
    pub extension_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub manifest_hash: String,
    pub permissions: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub missing_metadata: Vec<MissingMetadata>,
}

impl SkillInspection {
    pub fn is_installable(&self) -> bool {
        self.missing_metadata.is_empty()
    }
}

pub fn inspect_skill_manifest(raw: &str) -> Result<SkillInspection> {
    let manifest = parse_skill_manifest(raw)?;
    let capabilities: Vec<Capability> = manifest
        .capabilities
        .iter()
        .map(|declared| enrich_capability(declared, None))
        .collect();
    let missing_metadata = collect_missing_metadata(&capabilities);
    Ok(SkillInspection {
        extension_id: manifest.extension_id,
        display_name: manifest.display_name,
        manifest_hash: sha256_hex(raw.as_bytes()),
        permissions: manifest.permissions,
        capabilities,
        missing_metadata,
    })
}

pub fn render_skill_inspection(report: &SkillInspection) -> String {
    let mut lines = vec![format!(
        "skill inspect: id={} permissions={} capabilities={} installable={} manifest_hash={}",
        report.extension_id,
        if report.permissions.is_empty() {
            "none".to_string()
        } else {
            report.permissions.join(",")
        },
        report.capabilities.len(),
        report.is_installable(),
        report.manifest_hash
    )];
    for capability in &report.capabilities {
        lines.push(format!(
            "capability: id={} risk_level={} side_effects={} data_egress={} source={}",
            capability.capability_id,
            capability.risk_level,
            capability.side_effects,
            capability.data_egress,
            capability.metadata_source
        ));
    }
    for missing in &report.missing_metadata {
        lines.push(format!(
            "missing metadata: id={} fields={}",
            missing.capability_id,
            missing.missing_fields.join(",")
        ));
    }
    lines.join("\n")
}
