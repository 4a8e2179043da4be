use std::collections::BTreeMap;

use polar_core::dedupe_preserving_order;
use polar_governance_types::{CapabilityScopeInput, ExtensionSnapshot, LifecycleState};
use serde::{Deserialize, Serialize};

pub const SYSTEM_SCOPE_BUCKET: &str = "system";

/// Built-in agent capabilities that are always in scope.
pub const SYSTEM_CAPABILITIES: [&str; 5] = [
    "delegate_to_agent",
    "complete_task",
    "memory_search",
    "memory_write",
    "workflow_propose",
];

/// Per-session skill allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProfile {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub allowed_skills: Vec<String>,
}

/// Server-wide skill scoping settings shared by every agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiAgentScopeConfig {
    #[serde(default)]
    pub global_allowed_skills: Vec<String>,
    #[serde(default)]
    pub forward_skill_allowlist: Vec<String>,
    #[serde(default)]
    pub allow_empty_delegation: bool,
}

/// Delegation currently executing on behalf of a parent agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDelegation {
    pub agent_id: String,
    #[serde(default)]
    pub forward_skills: Vec<String>,
    #[serde(default)]
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillRejectionReason {
    NotInstalled,
    NotEnabled,
    NoCapabilities,
}

impl SkillRejectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::NotEnabled => "not_enabled",
            Self::NoCapabilities => "no_capabilities",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedSkill {
    pub skill_id: String,
    pub reason: SkillRejectionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_state: Option<LifecycleState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub effective_skills: Vec<String>,
}

/// Least-privilege capability allowlist computed fresh for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityScope {
    pub allowed: BTreeMap<String, Vec<String>>,
    pub constraints: ScopeConstraints,
    pub rejected_skills: Vec<RejectedSkill>,
}

impl CapabilityScope {
    pub fn allows(&self, extension_id: &str, capability_id: &str) -> bool {
        self.allowed.get(extension_id).is_some_and(|capabilities| {
            capabilities
                .iter()
                .any(|capability| capability == "*" || capability == capability_id)
        })
    }

    /// Wire shape passed as `capabilityScope` on execute requests.
    pub fn to_input(&self) -> CapabilityScopeInput {
        CapabilityScopeInput {
            allowed: Some(self.allowed.clone()),
            constraints: serde_json::to_value(&self.constraints).ok(),
        }
    }
}

/// Builds the authority projection: installed snapshots overlaid by registry authority.
///
/// A `removed` authority entry deletes the projection; an authority entry with
/// no capability ids inherits the installed list.
pub fn project_authority(
    installed_extensions: &[ExtensionSnapshot],
    authority_states: &[ExtensionSnapshot],
) -> BTreeMap<String, ExtensionSnapshot> {
    let mut projection = installed_extensions
        .iter()
        .map(|snapshot| (snapshot.extension_id.clone(), snapshot.clone()))
        .collect::<BTreeMap<_, _>>();
    for authority in authority_states {
        if authority.lifecycle_state == LifecycleState::Removed {
            projection.remove(&authority.extension_id);
            continue;
        }
        let capability_ids = if authority.capability_ids.is_empty() {
            projection
                .get(&authority.extension_id)
                .map(|prior| prior.capability_ids.clone())
                .unwrap_or_default()
        } else {
            authority.capability_ids.clone()
        };
        projection.insert(
            authority.extension_id.clone(),
            ExtensionSnapshot {
                extension_id: authority.extension_id.clone(),
                lifecycle_state: authority.lifecycle_state,
                capability_ids,
            },
        );
    }
    projection
}

/// Skills in priority order: delegation forwards, then session, then global.
pub fn effective_allowed_skills(
    session_profile: &SessionProfile,
    config: &MultiAgentScopeConfig,
    active_delegation: Option<&ActiveDelegation>,
) -> Vec<String> {
    let forwarded = active_delegation
        .map(|delegation| delegation.forward_skills.as_slice())
        .unwrap_or_default();
    dedupe_preserving_order(
        forwarded
            .iter()
            .chain(session_profile.allowed_skills.iter())
            .chain(config.global_allowed_skills.iter()),
    )
}

pub fn compute_capability_scope(
    session_profile: &SessionProfile,
    config: &MultiAgentScopeConfig,
    active_delegation: Option<&ActiveDelegation>,
    installed_extensions: &[ExtensionSnapshot],
    authority_states: &[ExtensionSnapshot],
) -> CapabilityScope {
    let mut allowed = BTreeMap::new();
    allowed.insert(
        SYSTEM_SCOPE_BUCKET.to_string(),
        SYSTEM_CAPABILITIES.iter().map(|id| id.to_string()).collect(),
    );

    let effective_skills = effective_allowed_skills(session_profile, config, active_delegation);
    let projection = project_authority(installed_extensions, authority_states);
    let mut rejected_skills = Vec::new();

    for skill_id in &effective_skills {
        if skill_id == SYSTEM_SCOPE_BUCKET {
            continue;
        }
        let rejection = match projection.get(skill_id) {
            None => Some((SkillRejectionReason::NotInstalled, None)),
            Some(snapshot) if snapshot.lifecycle_state != LifecycleState::Enabled => Some((
                SkillRejectionReason::NotEnabled,
                Some(snapshot.lifecycle_state),
            )),
            Some(snapshot) if snapshot.capability_ids.is_empty() => Some((
                SkillRejectionReason::NoCapabilities,
                Some(snapshot.lifecycle_state),
            )),
            Some(snapshot) => {
                allowed.insert(skill_id.clone(), snapshot.capability_ids.clone());
                None
            }
        };
        if let Some((reason, lifecycle_state)) = rejection {
            tracing::debug!(
                skill_id = %skill_id,
                reason = reason.as_str(),
                "skill excluded from capability scope"
            );
            rejected_skills.push(RejectedSkill {
                skill_id: skill_id.clone(),
                reason,
                lifecycle_state,
            });
        }
    }

    CapabilityScope {
        allowed,
        constraints: ScopeConstraints {
            delegated_agent_id: active_delegation.map(|delegation| delegation.agent_id.clone()),
            session_id: session_profile.session_id.clone(),
            effective_skills,
        },
        rejected_skills,
    }
}
