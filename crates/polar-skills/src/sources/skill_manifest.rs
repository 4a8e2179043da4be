use anyhow::{bail, Context, Result};
use polar_governance_types::{DataEgress, ExtensionType, RiskLevel, SideEffects};

use super::{
    normalize_permissions, validate_capabilities, validate_identifier, ContentHashField,
    InstallSource, ParsedManifest,
};
use crate::registry::DeclaredCapability;

const FRONT_MATTER_DELIMITER: &str = "---";
const CAPABILITIES_HEADING: &str = "## capabilities";

/// Markdown skill manifest: `---` front matter plus a `## Capabilities` bullet list.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkillManifestSource;

impl InstallSource for SkillManifestSource {
    fn extension_type(&self) -> ExtensionType {
        ExtensionType::Skill
    }

    fn content_hash_field(&self) -> ContentHashField {
        ContentHashField::Manifest
    }

    fn parse(&self, content: &str) -> Result<ParsedManifest> {
        parse_skill_manifest(content)
    }
}

pub fn parse_skill_manifest(content: &str) -> Result<ParsedManifest> {
    let content = content.trim_start_matches('\u{feff}');
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some(FRONT_MATTER_DELIMITER) {
        bail!("skill manifest must start with a '---' front matter block");
    }

    let mut extension_id = None;
    let mut display_name = None;
    let mut permissions = Vec::new();
    let mut closed = false;
    for line in lines.by_ref() {
        let line = line.trim();
        if line == FRONT_MATTER_DELIMITER {
            closed = true;
            break;
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("malformed front matter line '{line}'");
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "id" => extension_id = Some(validate_identifier("skill id", value)?),
            "name" => display_name = Some(value.to_string()).filter(|name| !name.is_empty()),
            "permissions" => {
                permissions = value
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .split(',')
                    .map(|permission| permission.trim().trim_matches('"').to_string())
                    .filter(|permission| !permission.is_empty())
                    .collect();
            }
            _ => {}
        }
    }
    if !closed {
        bail!("skill manifest front matter is not terminated by '---'");
    }
    let Some(extension_id) = extension_id else {
        bail!("skill manifest front matter is missing 'id'");
    };

    let mut capabilities = Vec::new();
    let mut in_capabilities = false;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            in_capabilities = trimmed.to_ascii_lowercase() == CAPABILITIES_HEADING;
            continue;
        }
        if !in_capabilities {
            continue;
        }
        let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        else {
            continue;
        };
        capabilities.push(
            parse_capability_line(item)
                .with_context(|| format!("invalid capability line '{trimmed}'"))?,
        );
    }

    validate_capabilities(&extension_id, &capabilities)?;
    Ok(ParsedManifest {
        permissions: normalize_permissions(&extension_id, &permissions)?,
        extension_id,
        display_name,
        capabilities,
    })
}

/// Parses `id: description [riskLevel=read, sideEffects=none, dataEgress=network]`.
fn parse_capability_line(item: &str) -> Result<DeclaredCapability> {
    let item = item.trim();
    let (head, attributes) = match (item.rfind('['), item.ends_with(']')) {
        (Some(open), true) => (&item[..open], Some(&item[open + 1..item.len() - 1])),
        _ => (item, None),
    };
    let (raw_id, description) = match head.split_once(':') {
        Some((id, description)) => (id, Some(description.trim())),
        None => (head, None),
    };
    let mut capability = DeclaredCapability::new(validate_identifier(
        "capability id",
        raw_id.trim().trim_matches('`'),
    )?);
    capability.description = description
        .filter(|description| !description.is_empty())
        .map(str::to_string);

    for attribute in attributes.into_iter().flat_map(|raw| raw.split(',')) {
        let attribute = attribute.trim();
        if attribute.is_empty() {
            continue;
        }
        let Some((key, value)) = attribute.split_once('=') else {
            bail!("capability attribute '{attribute}' must be key=value");
        };
        let value = value.trim();
        match key.trim() {
            "riskLevel" | "risk_level" => {
                capability.risk_level = Some(value.parse::<RiskLevel>()?);
            }
            "sideEffects" | "side_effects" => {
                capability.side_effects = Some(value.parse::<SideEffects>()?);
            }
            "dataEgress" | "data_egress" => {
                capability.data_egress = Some(value.parse::<DataEgress>()?);
            }
            other => bail!("unsupported capability attribute '{other}'"),
        }
    }
    Ok(capability)
}
