use std::collections::BTreeSet;

use polar_core::normalize_id_set;
use polar_governance_types::{
    ExtensionState, LifecycleOperation, LifecycleRequest, LifecycleResponse, LifecycleState,
    LifecycleStatus, PermissionDelta, TrustLevel,
};

pub const REASON_TYPE_IMMUTABLE: &str = "Extension type cannot change after install";
pub const REASON_BLOCKED_ENABLE: &str = "Blocked extensions cannot be enabled";
pub const REASON_NOT_INSTALLED: &str = "Extension is not installed";
pub const REASON_RISK_METADATA_REQUIRED: &str =
    "Extension capabilities require risk metadata before enable";

/// Outcome of evaluating the lifecycle transition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecyclePlan {
    /// `next` replaces the stored entry; `None` deletes it.
    Apply {
        next: Option<ExtensionState>,
        response: LifecycleResponse,
    },
    Reject {
        response: LifecycleResponse,
    },
}

impl LifecyclePlan {
    pub fn response(&self) -> &LifecycleResponse {
        match self {
            Self::Apply { response, .. } | Self::Reject { response } => response,
        }
    }

    pub fn into_response(self) -> LifecycleResponse {
        match self {
            Self::Apply { response, .. } | Self::Reject { response } => response,
        }
    }
}

/// Resolves the trust level a transition persists.
///
/// Blocked trust is sticky across every operation; only `remove` followed by
/// a fresh `install` clears it.
pub fn resolve_trust_level(request: &LifecycleRequest, current: Option<&ExtensionState>) -> TrustLevel {
    let stored = current.map(|state| state.trust_level);
    if stored == Some(TrustLevel::Blocked) {
        return TrustLevel::Blocked;
    }
    if request.operation.accepts_trust_level() {
        request.trust_level.or(stored).unwrap_or_default()
    } else {
        stored.or(request.trust_level).unwrap_or_default()
    }
}

/// Applies the lifecycle transition table to `current` without side effects.
pub fn plan_lifecycle(request: &LifecycleRequest, current: Option<&ExtensionState>) -> LifecyclePlan {
    if let Some(state) = current {
        if state.extension_type != request.extension_type {
            return reject(request, current, REASON_TYPE_IMMUTABLE);
        }
    }

    let trust_level = resolve_trust_level(request, current);
    let previous_permissions: BTreeSet<String> = current
        .map(|state| state.permissions.clone())
        .unwrap_or_default();
    let next_permissions = if request.operation.diffs_requested_permissions() {
        match request.requested_permissions.as_ref() {
            Some(requested) => normalize_id_set(requested),
            None => previous_permissions.clone(),
        }
    } else {
        previous_permissions.clone()
    };
    let permission_delta = PermissionDelta::compute(&previous_permissions, &next_permissions);
    let next_capabilities = match (request.operation.diffs_requested_permissions(), &request.capabilities) {
        (true, Some(capabilities)) => capabilities.clone(),
        _ => current
            .map(|state| state.capabilities.clone())
            .unwrap_or_default(),
    };

    let next_state = match request.operation {
        LifecycleOperation::Install => {
            if request.requests_pending_install() {
                LifecycleState::PendingInstall
            } else if trust_level == TrustLevel::Blocked {
                LifecycleState::Blocked
            } else {
                LifecycleState::Installed
            }
        }
        LifecycleOperation::Enable => {
            let Some(state) = current else {
                return reject(request, current, REASON_NOT_INSTALLED);
            };
            if trust_level == TrustLevel::Blocked || state.is_blocked() {
                return reject(request, current, REASON_BLOCKED_ENABLE);
            }
            if state
                .capabilities
                .iter()
                .any(|capability| !capability.has_complete_risk_metadata())
            {
                return reject(request, current, REASON_RISK_METADATA_REQUIRED);
            }
            LifecycleState::Enabled
        }
        LifecycleOperation::Disable => {
            if current.is_none() {
                return reject(request, current, REASON_NOT_INSTALLED);
            }
            LifecycleState::Disabled
        }
        LifecycleOperation::Upgrade | LifecycleOperation::Rollback | LifecycleOperation::Retrust => {
            let Some(state) = current else {
                return reject(request, current, REASON_NOT_INSTALLED);
            };
            if trust_level == TrustLevel::Blocked {
                LifecycleState::Blocked
            } else if state.lifecycle_state == LifecycleState::Blocked {
                LifecycleState::Disabled
            } else {
                state.lifecycle_state
            }
        }
        LifecycleOperation::Remove => {
            return LifecyclePlan::Apply {
                next: None,
                response: LifecycleResponse {
                    status: LifecycleStatus::Applied,
                    extension_id: request.extension_id.clone(),
                    extension_type: request.extension_type,
                    operation: request.operation,
                    trust_level,
                    lifecycle_state: LifecycleState::Removed,
                    permission_delta,
                    reason: None,
                },
            };
        }
    };

    let next = ExtensionState {
        extension_id: request.extension_id.clone(),
        extension_type: request.extension_type,
        trust_level,
        lifecycle_state: next_state,
        permissions: next_permissions,
        capabilities: next_capabilities,
    };
    LifecyclePlan::Apply {
        response: LifecycleResponse {
            status: LifecycleStatus::Applied,
            extension_id: next.extension_id.clone(),
            extension_type: next.extension_type,
            operation: request.operation,
            trust_level,
            lifecycle_state: next_state,
            permission_delta,
            reason: None,
        },
        next: Some(next),
    }
}

fn reject(
    request: &LifecycleRequest,
    current: Option<&ExtensionState>,
    reason: &str,
) -> LifecyclePlan {
    LifecyclePlan::Reject {
        response: LifecycleResponse::rejected(request, current, reason),
    }
}
