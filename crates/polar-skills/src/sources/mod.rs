use std::collections::BTreeSet;

use anyhow::{bail, Result};
use polar_governance_types::ExtensionType;
use serde::{Deserialize, Serialize};

use crate::registry::DeclaredCapability;

mod mcp_catalog;
mod plugin_descriptor;
mod skill_manifest;

pub use mcp_catalog::*;
pub use plugin_descriptor::*;
pub use skill_manifest::*;

/// Normalized form every install source parses into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedManifest {
    pub extension_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub permissions: Vec<String>,
    pub capabilities: Vec<DeclaredCapability>,
}

impl ParsedManifest {
    pub fn capability_ids(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|capability| capability.capability_id.clone())
            .collect()
    }
}

/// Which response field carries the content hash for a source kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentHashField {
    Manifest,
    Catalog,
    Descriptor,
}

/// Manifest parser for one extension kind.
pub trait InstallSource: Send + Sync {
    fn extension_type(&self) -> ExtensionType;

    fn content_hash_field(&self) -> ContentHashField;

    fn parse(&self, content: &str) -> Result<ParsedManifest>;
}

pub(crate) fn validate_identifier(kind: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        bail!("{kind} cannot be empty");
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | ':'))
    {
        bail!("{kind} '{value}' contains unsupported characters");
    }
    Ok(value.to_string())
}

/// Rejects empty or duplicated capability lists.
pub(crate) fn validate_capabilities(
    extension_id: &str,
    capabilities: &[DeclaredCapability],
) -> Result<()> {
    if capabilities.is_empty() {
        bail!("extension '{extension_id}' declares no capabilities");
    }
    let mut seen = BTreeSet::new();
    for capability in capabilities {
        if !seen.insert(capability.capability_id.as_str()) {
            bail!(
                "extension '{extension_id}' declares capability '{}' more than once",
                capability.capability_id
            );
        }
    }
    Ok(())
}

pub(crate) fn normalize_permissions(extension_id: &str, permissions: &[String]) -> Result<Vec<String>> {
    let mut normalized = Vec::with_capacity(permissions.len());
    for permission in permissions {
        let permission = permission.trim();
        if permission.is_empty() {
            bail!("extension '{extension_id}' declares a blank permission");
        }
        normalized.push(permission.to_string());
    }
    Ok(polar_core::normalize_id_set(normalized).into_iter().collect())
}
