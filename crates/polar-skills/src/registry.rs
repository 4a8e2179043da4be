use std::collections::BTreeMap;

use polar_core::current_rfc3339_timestamp;
use polar_governance_types::{
    Capability, DataEgress, ExtensionSnapshot, LifecycleState, MetadataSource, MissingMetadata,
    RiskLevel, SideEffects,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub const OVERRIDE_EXPLANATION_MIN_CHARS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("extension id cannot be empty")]
    EmptyExtensionId,
    #[error("capability id cannot be empty")]
    EmptyCapabilityId,
    #[error("invalid override for '{extension_id}/{capability_id}': {reason}")]
    InvalidOverride {
        extension_id: String,
        capability_id: String,
        reason: String,
    },
    #[error("no proposal recorded for extension '{0}'")]
    ProposalNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub extension_id: String,
    pub manifest: String,
    pub status: ProposalStatus,
    pub proposed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalDecision {
    Approve,
    Reject,
}

/// Operator-supplied risk metadata for one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideMetadata {
    pub risk_level: RiskLevel,
    pub side_effects: SideEffects,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_egress: Option<DataEgress>,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityOverride {
    pub extension_id: String,
    pub capability_id: String,
    pub metadata: OverrideMetadata,
    pub submitted_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideOutcome {
    pub record: CapabilityOverride,
    pub unblocked: bool,
    pub remaining: Vec<MissingMetadata>,
}

/// Capability as declared by a manifest, before operator enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredCapability {
    pub capability_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<SideEffects>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_egress: Option<DataEgress>,
}

impl DeclaredCapability {
    pub fn new(capability_id: impl Into<String>) -> Self {
        Self {
            capability_id: capability_id.into(),
            ..Self::default()
        }
    }
}

/// Resolves risk metadata: operator override, then manifest value, else `unknown`.
pub fn enrich_capability(
    declared: &DeclaredCapability,
    operator_override: Option<&OverrideMetadata>,
) -> Capability {
    let manifest_risk = declared.risk_level.filter(|level| *level != RiskLevel::Unknown);
    let manifest_side_effects = declared
        .side_effects
        .filter(|effects| *effects != SideEffects::Unknown);
    match operator_override {
        Some(metadata) => Capability {
            capability_id: declared.capability_id.clone(),
            risk_level: metadata.risk_level,
            side_effects: metadata.side_effects,
            data_egress: metadata
                .data_egress
                .or(declared.data_egress)
                .unwrap_or(DataEgress::Unknown),
            metadata_source: MetadataSource::Operator,
        },
        None => Capability {
            capability_id: declared.capability_id.clone(),
            risk_level: manifest_risk.unwrap_or(RiskLevel::Unknown),
            side_effects: manifest_side_effects.unwrap_or(SideEffects::Unknown),
            data_egress: declared.data_egress.unwrap_or(DataEgress::Unknown),
            metadata_source: MetadataSource::Manifest,
        },
    }
}

/// Capabilities still missing risk metadata after enrichment.
pub fn collect_missing_metadata(capabilities: &[Capability]) -> Vec<MissingMetadata> {
    capabilities
        .iter()
        .filter_map(|capability| {
            let missing_fields = capability.missing_risk_fields();
            (!missing_fields.is_empty()).then(|| MissingMetadata {
                capability_id: capability.capability_id.clone(),
                missing_fields,
            })
        })
        .collect()
}

#[derive(Debug, Default)]
struct RegistryState {
    proposals: BTreeMap<String, Proposal>,
    overrides: BTreeMap<(String, String), CapabilityOverride>,
    blocked: BTreeMap<String, Vec<MissingMetadata>>,
    authority: BTreeMap<String, ExtensionSnapshot>,
}

impl RegistryState {
    /// Drops the blocked authority overlay, falling back to `pending_install`
    /// while a proposal is outstanding.
    fn release_block(&mut self, extension_id: &str) {
        self.blocked.remove(extension_id);
        if self.proposals.contains_key(extension_id) {
            self.authority
                .insert(extension_id.to_string(), pending_snapshot(extension_id));
        } else {
            self.authority.remove(extension_id);
        }
    }
}

/// Install proposals, operator risk overrides, and blocked capability state.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    state: RwLock<RegistryState>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn propose(
        &self,
        extension_id: &str,
        manifest: impl Into<String>,
    ) -> Result<Proposal, RegistryError> {
        let extension_id = required_id(extension_id, RegistryError::EmptyExtensionId)?;
        let proposal = Proposal {
            extension_id: extension_id.clone(),
            manifest: manifest.into(),
            status: ProposalStatus::Pending,
            proposed_at: current_rfc3339_timestamp(),
            reviewed_at: None,
        };
        let mut state = self.state.write().await;
        state.proposals.insert(extension_id.clone(), proposal.clone());
        if !state.blocked.contains_key(&extension_id) {
            state
                .authority
                .insert(extension_id.clone(), pending_snapshot(&extension_id));
        }
        tracing::debug!(extension_id = %extension_id, "extension proposal recorded");
        Ok(proposal)
    }

    /// Approves or rejects a proposal. Rejection deletes it and its pending overlay.
    pub async fn review_proposal(
        &self,
        extension_id: &str,
        decision: ProposalDecision,
    ) -> Result<Option<Proposal>, RegistryError> {
        let extension_id = extension_id.trim();
        let mut state = self.state.write().await;
        if !state.proposals.contains_key(extension_id) {
            return Err(RegistryError::ProposalNotFound(extension_id.to_string()));
        }
        match decision {
            ProposalDecision::Approve => {
                let proposal = state.proposals.get_mut(extension_id).map(|proposal| {
                    proposal.status = ProposalStatus::Approved;
                    proposal.reviewed_at = Some(current_rfc3339_timestamp());
                    proposal.clone()
                });
                Ok(proposal)
            }
            ProposalDecision::Reject => {
                state.proposals.remove(extension_id);
                if state
                    .authority
                    .get(extension_id)
                    .is_some_and(|snapshot| snapshot.lifecycle_state == LifecycleState::PendingInstall)
                {
                    state.authority.remove(extension_id);
                }
                tracing::info!(extension_id, "extension proposal rejected");
                Ok(None)
            }
        }
    }

    pub async fn get_proposal(&self, extension_id: &str) -> Option<Proposal> {
        self.state.read().await.proposals.get(extension_id.trim()).cloned()
    }

    pub async fn list_proposals(&self) -> Vec<Proposal> {
        self.state.read().await.proposals.values().cloned().collect()
    }

    /// Records operator metadata and removes the capability from the blocked
    /// list; the extension unblocks once no blocked capability remains.
    pub async fn submit_override(
        &self,
        extension_id: &str,
        capability_id: &str,
        metadata: OverrideMetadata,
    ) -> Result<OverrideOutcome, RegistryError> {
        let extension_id = required_id(extension_id, RegistryError::EmptyExtensionId)?;
        let capability_id = required_id(capability_id, RegistryError::EmptyCapabilityId)?;
        let invalid = |reason: &str| RegistryError::InvalidOverride {
            extension_id: extension_id.clone(),
            capability_id: capability_id.clone(),
            reason: reason.to_string(),
        };
        let explanation = metadata.explanation.trim().to_string();
        if explanation.chars().count() < OVERRIDE_EXPLANATION_MIN_CHARS {
            return Err(invalid("explanation must be at least 5 characters"));
        }
        if metadata.risk_level == RiskLevel::Unknown {
            return Err(invalid("riskLevel cannot be unknown"));
        }
        if metadata.side_effects == SideEffects::Unknown {
            return Err(invalid("sideEffects cannot be unknown"));
        }

        let record = CapabilityOverride {
            extension_id: extension_id.clone(),
            capability_id: capability_id.clone(),
            metadata: OverrideMetadata {
                explanation,
                ..metadata
            },
            submitted_at: current_rfc3339_timestamp(),
        };
        let mut state = self.state.write().await;
        state.overrides.insert(
            (extension_id.clone(), capability_id.clone()),
            record.clone(),
        );

        let remaining = match state.blocked.get_mut(&extension_id) {
            Some(entries) => {
                entries.retain(|entry| entry.capability_id != capability_id);
                Some(entries.clone())
            }
            None => None,
        };
        let unblocked = remaining.as_ref().is_some_and(Vec::is_empty);
        if unblocked {
            state.release_block(&extension_id);
        }
        tracing::info!(
            extension_id = %extension_id,
            capability_id = %capability_id,
            unblocked,
            "capability risk override submitted"
        );
        Ok(OverrideOutcome {
            record,
            unblocked,
            remaining: remaining.unwrap_or_default(),
        })
    }

    pub async fn list_overrides(&self, extension_id: Option<&str>) -> Vec<CapabilityOverride> {
        let state = self.state.read().await;
        state
            .overrides
            .values()
            .filter(|record| match extension_id {
                Some(extension_id) => extension_id.trim() == record.extension_id,
                None => true,
            })
            .cloned()
            .collect()
    }

    pub async fn mark_blocked(&self, extension_id: &str, entries: Vec<MissingMetadata>) {
        let extension_id = extension_id.trim().to_string();
        let mut state = self.state.write().await;
        if entries.is_empty() {
            state.release_block(&extension_id);
            return;
        }
        state.blocked.insert(extension_id.clone(), entries);
        state.authority.insert(
            extension_id.clone(),
            ExtensionSnapshot {
                extension_id,
                lifecycle_state: LifecycleState::Blocked,
                capability_ids: Vec::new(),
            },
        );
    }

    pub async fn unblock(&self, extension_id: &str) {
        self.state.write().await.release_block(extension_id.trim());
    }

    pub async fn blocked_entries(&self, extension_id: &str) -> Option<Vec<MissingMetadata>> {
        self.state.read().await.blocked.get(extension_id.trim()).cloned()
    }

    pub async fn is_blocked(&self, extension_id: &str) -> bool {
        self.state.read().await.blocked.contains_key(extension_id.trim())
    }

    /// Enriches declared capabilities with any operator overrides on record.
    pub async fn process_metadata(
        &self,
        extension_id: &str,
        capabilities: &[DeclaredCapability],
    ) -> Vec<Capability> {
        let state = self.state.read().await;
        let extension_id = extension_id.trim().to_string();
        capabilities
            .iter()
            .map(|declared| {
                let key = (extension_id.clone(), declared.capability_id.clone());
                enrich_capability(declared, state.overrides.get(&key).map(|record| &record.metadata))
            })
            .collect()
    }

    pub async fn authority_states(&self) -> Vec<ExtensionSnapshot> {
        self.state.read().await.authority.values().cloned().collect()
    }

    /// Replaces (`Some`) or deletes (`None`) the authority entry for an extension.
    pub async fn sync_authority(&self, extension_id: &str, snapshot: Option<ExtensionSnapshot>) {
        let mut state = self.state.write().await;
        match snapshot {
            Some(snapshot) => {
                state.authority.insert(extension_id.trim().to_string(), snapshot);
            }
            None => {
                state.authority.remove(extension_id.trim());
            }
        }
    }

    /// Clears blocked, proposal, and authority state after a successful install.
    pub async fn clear_install_state(&self, extension_id: &str) {
        let extension_id = extension_id.trim();
        let mut state = self.state.write().await;
        state.blocked.remove(extension_id);
        state.proposals.remove(extension_id);
        state.authority.remove(extension_id);
    }
}

fn pending_snapshot(extension_id: &str) -> ExtensionSnapshot {
    ExtensionSnapshot {
        extension_id: extension_id.to_string(),
        lifecycle_state: LifecycleState::PendingInstall,
        capability_ids: Vec::new(),
    }
}

fn required_id(value: &str, error: RegistryError) -> Result<String, RegistryError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(error);
    }
    Ok(value.to_string())
}
