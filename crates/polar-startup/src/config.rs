use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use polar_orchestrator::MultiAgentScopeConfig;
use polar_skills::{InstallerPolicy, ProvenancePolicy};
use serde::{Deserialize, Serialize};

pub const GOVERNANCE_CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Skill scoping settings applied to every session and delegation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    pub global_allowed_skills: Vec<String>,
    pub forward_skill_allowlist: Vec<String>,
    pub allow_empty_delegation: bool,
}

impl ScopeSettings {
    pub fn to_scope_config(&self) -> MultiAgentScopeConfig {
        MultiAgentScopeConfig {
            global_allowed_skills: self.global_allowed_skills.clone(),
            forward_skill_allowlist: self.forward_skill_allowlist.clone(),
            allow_empty_delegation: self.allow_empty_delegation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub allowlist: Vec<String>,
    pub default_model: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Process-wide governance configuration. Fixed once the runtime is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceConfig {
    schema_version: u32,
    #[serde(default)]
    pub dev_mode: bool,
    /// JSONL audit log; audit envelopes go to `tracing` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_path: Option<PathBuf>,
    #[serde(default)]
    pub approval_required_permissions: BTreeSet<String>,
    #[serde(default)]
    pub auto_enable_trusted: bool,
    #[serde(default)]
    pub provenance: ProvenancePolicy,
    #[serde(default)]
    pub scope: ScopeSettings,
    #[serde(default)]
    pub models: ModelSettings,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            schema_version: GOVERNANCE_CONFIG_SCHEMA_VERSION,
            dev_mode: false,
            audit_log_path: None,
            approval_required_permissions: BTreeSet::new(),
            auto_enable_trusted: false,
            provenance: ProvenancePolicy::default(),
            scope: ScopeSettings::default(),
            models: ModelSettings::default(),
        }
    }
}

impl GovernanceConfig {
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn installer_policy(&self) -> InstallerPolicy {
        InstallerPolicy {
            approval_required_permissions: self.approval_required_permissions.clone(),
            auto_enable_trusted: self.auto_enable_trusted,
            provenance: self.provenance.clone(),
        }
    }
}

/// Loads the config file at `path`. A missing file yields the defaults.
pub fn load_governance_config(path: &Path) -> Result<GovernanceConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "governance config not found; using defaults");
        return Ok(GovernanceConfig::default());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read governance config {}", path.display()))?;
    parse_governance_config_with_source(&raw, &path.display().to_string())
}

pub fn parse_governance_config(raw: &str) -> Result<GovernanceConfig> {
    parse_governance_config_with_source(raw, "<inline-governance-config>")
}

fn parse_governance_config_with_source(raw: &str, source_label: &str) -> Result<GovernanceConfig> {
    let mut parsed = serde_json::from_str::<GovernanceConfig>(raw)
        .with_context(|| format!("failed to parse governance config {source_label}"))?;
    normalize_and_validate_config(source_label, &mut parsed)?;
    Ok(parsed)
}

fn normalize_and_validate_config(source_label: &str, config: &mut GovernanceConfig) -> Result<()> {
    if config.schema_version != GOVERNANCE_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported governance config schema_version {} in {} (expected {})",
            config.schema_version,
            source_label,
            GOVERNANCE_CONFIG_SCHEMA_VERSION
        );
    }

    if config
        .audit_log_path
        .as_ref()
        .is_some_and(|path| path.as_os_str().is_empty())
    {
        bail!("audit_log_path in {source_label} cannot be empty");
    }

    let mut permissions = BTreeSet::new();
    for permission in &config.approval_required_permissions {
        let trimmed = permission.trim();
        if trimmed.is_empty() {
            bail!("approval_required_permissions in {source_label} contains a blank entry");
        }
        permissions.insert(trimmed.to_string());
    }
    config.approval_required_permissions = permissions;

    let provenance = &mut config.provenance;
    for (field, prefixes) in [
        ("allowed_source_prefixes", &mut provenance.allowed_source_prefixes),
        ("blocked_source_prefixes", &mut provenance.blocked_source_prefixes),
        ("trusted_source_prefixes", &mut provenance.trusted_source_prefixes),
    ] {
        *prefixes = normalize_entries(source_label, &format!("provenance.{field}"), prefixes)?;
    }

    let scope = &mut config.scope;
    scope.global_allowed_skills = normalize_entries(
        source_label,
        "scope.global_allowed_skills",
        &scope.global_allowed_skills,
    )?;
    scope.forward_skill_allowlist = normalize_entries(
        source_label,
        "scope.forward_skill_allowlist",
        &scope.forward_skill_allowlist,
    )?;

    let models = &mut config.models;
    models.allowlist = normalize_entries(source_label, "models.allowlist", &models.allowlist)?;
    models.default_model = models.default_model.trim().to_string();
    if models.default_model.is_empty() {
        bail!("models.default_model in {source_label} cannot be empty");
    }
    if !models.allowlist.is_empty() && !models.allowlist.contains(&models.default_model) {
        bail!(
            "models.default_model '{}' in {} is not in models.allowlist",
            models.default_model,
            source_label
        );
    }
    Ok(())
}

fn normalize_entries(source_label: &str, field: &str, entries: &[String]) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            bail!("{field} in {source_label} contains a blank entry");
        }
        if !normalized.iter().any(|existing| existing == trimmed) {
            normalized.push(trimmed.to_string());
        }
    }
    Ok(normalized)
}
