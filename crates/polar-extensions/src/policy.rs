use async_trait::async_trait;
use polar_governance_types::{
    Capability, ExecuteRequest, ExtensionState, ExtensionType, LifecycleOperation,
    LifecycleRequest, PermissionDelta, TrustLevel,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: Option<String> },
}

impl PolicyDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: Some(reason.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn denial_reason(&self, fallback: &str) -> Option<String> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } => Some(
                reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or(fallback)
                    .to_string(),
            ),
        }
    }
}

/// Install attempt summary presented to an external policy before approval gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEvaluation {
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub operation: LifecycleOperation,
    pub trust_level: TrustLevel,
    pub source_uri: String,
    pub permission_delta: PermissionDelta,
    pub capability_ids: Vec<String>,
}

/// External policy hooks consulted by the gateway and installers. Defaults allow.
#[async_trait]
pub trait ExtensionPolicy: Send + Sync {
    async fn evaluate_lifecycle(
        &self,
        _request: &LifecycleRequest,
        _current: Option<&ExtensionState>,
    ) -> PolicyDecision {
        PolicyDecision::Allow
    }

    async fn evaluate_execution(
        &self,
        _request: &ExecuteRequest,
        _state: &ExtensionState,
        _capability: Option<&Capability>,
    ) -> PolicyDecision {
        PolicyDecision::Allow
    }

    async fn evaluate_install(&self, _evaluation: &InstallEvaluation) -> PolicyDecision {
        PolicyDecision::Allow
    }
}
