//! Shared data model for Polar extension governance.
//!
//! Defines extension lifecycle and trust enums, capability risk metadata,
//! permission deltas, and the wire shapes of lifecycle and execute calls.

use std::collections::{BTreeMap, BTreeSet};

use polar_core::normalize_id_set;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod wire;

pub use wire::*;

/// Stable domain failure codes returned as data by the extension gateway.
pub mod codes {
    pub const EXTENSION_NOT_INSTALLED: &str = "POLAR_EXTENSION_NOT_INSTALLED";
    pub const EXTENSION_TYPE_MISMATCH: &str = "POLAR_EXTENSION_TYPE_MISMATCH";
    pub const EXTENSION_TRUST_LEVEL_MISMATCH: &str = "POLAR_EXTENSION_TRUST_LEVEL_MISMATCH";
    pub const EXTENSION_BLOCKED: &str = "POLAR_EXTENSION_BLOCKED";
    pub const EXTENSION_NOT_ENABLED: &str = "POLAR_EXTENSION_NOT_ENABLED";
    pub const EXTENSION_POLICY_DENIED: &str = "POLAR_EXTENSION_POLICY_DENIED";
    pub const EXTENSION_ADAPTER_MISSING: &str = "POLAR_EXTENSION_ADAPTER_MISSING";
    pub const RUNTIME_EXECUTION_ERROR: &str = "POLAR_RUNTIME_EXECUTION_ERROR";
}

/// Error returned when parsing a governance enum from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported {kind} '{value}'")]
pub struct UnknownVariantError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn all() -> &'static [Self] {
                &[$(Self::$variant,)+]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariantError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                match raw.trim() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariantError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Kind of installable extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionType {
    Skill,
    Mcp,
    Plugin,
}

string_enum!(ExtensionType, "extension type", {
    Skill => "skill",
    Mcp => "mcp",
    Plugin => "plugin",
});

impl ExtensionType {
    /// Human label used as the prefix of installer rejection reasons.
    pub fn display_label(self) -> &'static str {
        match self {
            Self::Skill => "Skill",
            Self::Mcp => "MCP",
            Self::Plugin => "Plugin",
        }
    }
}

/// Coarse authorization tier, independent of lifecycle state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    Reviewed,
    #[default]
    Sandboxed,
    Blocked,
}

string_enum!(TrustLevel, "trust level", {
    Trusted => "trusted",
    Reviewed => "reviewed",
    Sandboxed => "sandboxed",
    Blocked => "blocked",
});

/// Install/enable status of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    PendingInstall,
    Installed,
    Enabled,
    Disabled,
    Removed,
    Blocked,
}

string_enum!(LifecycleState, "lifecycle state", {
    PendingInstall => "pending_install",
    Installed => "installed",
    Enabled => "enabled",
    Disabled => "disabled",
    Removed => "removed",
    Blocked => "blocked",
});

/// Transition requested through `applyLifecycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOperation {
    Install,
    Enable,
    Disable,
    Upgrade,
    Rollback,
    Retrust,
    Remove,
}

string_enum!(LifecycleOperation, "lifecycle operation", {
    Install => "install",
    Enable => "enable",
    Disable => "disable",
    Upgrade => "upgrade",
    Rollback => "rollback",
    Retrust => "retrust",
    Remove => "remove",
});

impl LifecycleOperation {
    /// Operations whose permission delta diffs stored permissions against the request.
    pub fn diffs_requested_permissions(self) -> bool {
        matches!(self, Self::Install | Self::Upgrade | Self::Rollback)
    }

    /// Operations allowed to change the persisted trust level.
    pub fn accepts_trust_level(self) -> bool {
        matches!(
            self,
            Self::Install | Self::Upgrade | Self::Rollback | Self::Retrust
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Read,
    Write,
    Destructive,
    Unknown,
}

string_enum!(RiskLevel, "risk level", {
    Read => "read",
    Write => "write",
    Destructive => "destructive",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffects {
    None,
    Internal,
    External,
    Unknown,
}

string_enum!(SideEffects, "side effects", {
    None => "none",
    Internal => "internal",
    External => "external",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEgress {
    None,
    Network,
    Unknown,
}

string_enum!(DataEgress, "data egress", {
    None => "none",
    Network => "network",
    Unknown => "unknown",
});

/// Where a capability's resolved risk metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    #[default]
    Manifest,
    Operator,
}

string_enum!(MetadataSource, "metadata source", {
    Manifest => "manifest",
    Operator => "operator",
});

pub const RISK_FIELD_RISK_LEVEL: &str = "riskLevel";
pub const RISK_FIELD_SIDE_EFFECTS: &str = "sideEffects";

/// One externally invokable operation exposed by an extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub capability_id: String,
    pub risk_level: RiskLevel,
    pub side_effects: SideEffects,
    pub data_egress: DataEgress,
    #[serde(default)]
    pub metadata_source: MetadataSource,
}

impl Capability {
    /// Builds a capability with no declared metadata.
    pub fn unknown(capability_id: impl Into<String>) -> Self {
        Self {
            capability_id: capability_id.into(),
            risk_level: RiskLevel::Unknown,
            side_effects: SideEffects::Unknown,
            data_egress: DataEgress::Unknown,
            metadata_source: MetadataSource::Manifest,
        }
    }

    /// Risk fields that still resolve to `unknown`, in wire order.
    pub fn missing_risk_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.risk_level == RiskLevel::Unknown {
            missing.push(RISK_FIELD_RISK_LEVEL.to_string());
        }
        if self.side_effects == SideEffects::Unknown {
            missing.push(RISK_FIELD_SIDE_EFFECTS.to_string());
        }
        missing
    }

    pub fn has_complete_risk_metadata(&self) -> bool {
        self.risk_level != RiskLevel::Unknown && self.side_effects != SideEffects::Unknown
    }
}

/// Persisted governance state of one installed extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionState {
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub trust_level: TrustLevel,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ExtensionState {
    pub fn is_blocked(&self) -> bool {
        self.trust_level == TrustLevel::Blocked || self.lifecycle_state == LifecycleState::Blocked
    }

    pub fn capability(&self, capability_id: &str) -> Option<&Capability> {
        self.capabilities
            .iter()
            .find(|capability| capability.capability_id == capability_id)
    }

    pub fn capability_ids(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|capability| capability.capability_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> ExtensionSnapshot {
        ExtensionSnapshot {
            extension_id: self.extension_id.clone(),
            lifecycle_state: self.lifecycle_state,
            capability_ids: self.capability_ids(),
        }
    }
}

/// Lifecycle view of an extension consumed by the capability scope projector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSnapshot {
    pub extension_id: String,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub capability_ids: Vec<String>,
}

/// Added/removed/retained partition between two permission sets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PermissionDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub retained: Vec<String>,
}

impl PermissionDelta {
    /// Diffs `previous` against `next`; all three output lists are sorted and disjoint.
    pub fn compute<P, N, S1, S2>(previous: P, next: N) -> Self
    where
        P: IntoIterator<Item = S1>,
        N: IntoIterator<Item = S2>,
        S1: AsRef<str>,
        S2: AsRef<str>,
    {
        let previous = normalize_id_set(previous);
        let next = normalize_id_set(next);
        Self {
            added: next.difference(&previous).cloned().collect(),
            removed: previous.difference(&next).cloned().collect(),
            retained: previous.intersection(&next).cloned().collect(),
        }
    }

    /// Delta of a permission set against itself.
    pub fn retained_only<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            retained: normalize_id_set(permissions).into_iter().collect(),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Capability that failed the risk-metadata gate, listed for operator remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingMetadata {
    pub capability_id: String,
    pub missing_fields: Vec<String>,
}

/// Per-session allowlist of invokable capabilities as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityScopeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
}

impl CapabilityScopeInput {
    pub fn from_allowed(allowed: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            allowed: Some(allowed),
            constraints: None,
        }
    }
}

#[cfg(test)]
mod tests;
