use anyhow::{Context, Result};
use async_trait::async_trait;
use polar_governance_types::{DataEgress, ExtensionType, RiskLevel, SideEffects};
use serde::{Deserialize, Serialize};

use super::{
    normalize_permissions, validate_capabilities, validate_identifier, ContentHashField,
    InstallSource, ParsedManifest,
};
use crate::registry::DeclaredCapability;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolCatalog {
    pub server_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub tools: Vec<McpToolEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub annotations: Option<McpToolAnnotations>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolAnnotations {
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub side_effects: Option<SideEffects>,
    #[serde(default)]
    pub data_egress: Option<DataEgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn is_unreachable(&self) -> bool {
        self.status == HealthStatus::Unreachable
    }
}

/// Connectivity check run against an MCP server before its catalog is admitted.
#[async_trait]
pub trait McpHealthProbe: Send + Sync {
    async fn probe(&self, server_id: &str, source_uri: &str) -> HealthReport;
}

/// JSON MCP tool catalog (`serverId`, `permissions`, `tools[]`).
#[derive(Debug, Clone, Copy, Default)]
pub struct McpCatalogSource;

impl InstallSource for McpCatalogSource {
    fn extension_type(&self) -> ExtensionType {
        ExtensionType::Mcp
    }

    fn content_hash_field(&self) -> ContentHashField {
        ContentHashField::Catalog
    }

    fn parse(&self, content: &str) -> Result<ParsedManifest> {
        parse_mcp_catalog(content)
    }
}

pub fn parse_mcp_catalog(content: &str) -> Result<ParsedManifest> {
    let catalog: McpToolCatalog =
        serde_json::from_str(content).context("failed to parse MCP tool catalog")?;
    let extension_id = validate_identifier("MCP server id", &catalog.server_id)?;
    let capabilities = catalog
        .tools
        .iter()
        .map(|tool| {
            let annotations = tool.annotations.clone().unwrap_or_default();
            Ok(DeclaredCapability {
                capability_id: validate_identifier("MCP tool name", &tool.name)?,
                description: tool.description.clone(),
                risk_level: annotations.risk_level,
                side_effects: annotations.side_effects,
                data_egress: annotations.data_egress,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    validate_capabilities(&extension_id, &capabilities)?;
    Ok(ParsedManifest {
        permissions: normalize_permissions(&extension_id, &catalog.permissions)?,
        extension_id,
        display_name: None,
        capabilities,
    })
}
