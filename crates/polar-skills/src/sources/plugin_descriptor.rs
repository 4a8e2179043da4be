use anyhow::{bail, Context, Result};
use polar_governance_types::{DataEgress, ExtensionType, RiskLevel, SideEffects};
use serde::{Deserialize, Serialize};

use super::{
    normalize_permissions, validate_capabilities, validate_identifier, ContentHashField,
    InstallSource, ParsedManifest,
};
use crate::registry::DeclaredCapability;

pub const PLUGIN_DESCRIPTOR_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub schema_version: u32,
    pub plugin_id: String,
    #[serde(default)]
    pub name_for_model: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub operations: Vec<PluginOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginOperation {
    pub operation_id: String,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub side_effects: Option<SideEffects>,
    #[serde(default)]
    pub data_egress: Option<DataEgress>,
}

/// ai-plugin style JSON descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginDescriptorSource;

impl InstallSource for PluginDescriptorSource {
    fn extension_type(&self) -> ExtensionType {
        ExtensionType::Plugin
    }

    fn content_hash_field(&self) -> ContentHashField {
        ContentHashField::Descriptor
    }

    fn parse(&self, content: &str) -> Result<ParsedManifest> {
        parse_plugin_descriptor(content)
    }
}

pub fn parse_plugin_descriptor(content: &str) -> Result<ParsedManifest> {
    let descriptor: PluginDescriptor =
        serde_json::from_str(content).context("failed to parse plugin descriptor")?;
    if descriptor.schema_version != PLUGIN_DESCRIPTOR_SCHEMA_VERSION {
        bail!(
            "unsupported plugin descriptor schema version {} (expected {})",
            descriptor.schema_version,
            PLUGIN_DESCRIPTOR_SCHEMA_VERSION
        );
    }
    let extension_id = validate_identifier("plugin id", &descriptor.plugin_id)?;
    let capabilities = descriptor
        .operations
        .iter()
        .map(|operation| {
            Ok(DeclaredCapability {
                capability_id: validate_identifier("plugin operation id", &operation.operation_id)?,
                description: None,
                risk_level: operation.risk_level,
                side_effects: operation.side_effects,
                data_egress: operation.data_egress,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    validate_capabilities(&extension_id, &capabilities)?;
    Ok(ParsedManifest {
        permissions: normalize_permissions(&extension_id, &descriptor.permissions)?,
        extension_id,
        display_name: descriptor
            .name_for_model
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()),
        capabilities,
    })
}
