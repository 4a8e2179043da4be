use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Capability, CapabilityScopeInput, ExtensionState, ExtensionType, LifecycleOperation,
    LifecycleState, PermissionDelta, TrustLevel,
};

/// Request accepted by the gateway's `extension.lifecycle.apply` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LifecycleRequest {
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub operation: LifecycleOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
}

impl LifecycleRequest {
    pub fn new(
        extension_id: impl Into<String>,
        extension_type: ExtensionType,
        operation: LifecycleOperation,
    ) -> Self {
        Self {
            extension_id: extension_id.into(),
            extension_type,
            operation,
            trust_level: None,
            source_uri: None,
            requested_permissions: None,
            approval_ticket: None,
            metadata: None,
            capabilities: None,
        }
    }

    pub fn with_trust_level(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = Some(trust_level);
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_permissions = Some(permissions.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// True when `metadata.pendingInstall` asks for a staged install.
    pub fn requests_pending_install(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get("pendingInstall"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Applied,
    Rejected,
}

/// Outcome of a lifecycle transition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    pub status: LifecycleStatus,
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub operation: LifecycleOperation,
    pub trust_level: TrustLevel,
    pub lifecycle_state: LifecycleState,
    pub permission_delta: PermissionDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LifecycleResponse {
    pub fn is_applied(&self) -> bool {
        self.status == LifecycleStatus::Applied
    }

    /// Rejection that reports the pre-attempt state with an all-retained delta.
    pub fn rejected(
        request: &LifecycleRequest,
        current: Option<&ExtensionState>,
        reason: impl Into<String>,
    ) -> Self {
        let permissions: BTreeSet<String> = current
            .map(|state| state.permissions.clone())
            .unwrap_or_default();
        Self {
            status: LifecycleStatus::Rejected,
            extension_id: request.extension_id.clone(),
            extension_type: current
                .map(|state| state.extension_type)
                .unwrap_or(request.extension_type),
            operation: request.operation,
            trust_level: current
                .map(|state| state.trust_level)
                .or(request.trust_level)
                .unwrap_or_default(),
            lifecycle_state: current
                .map(|state| state.lifecycle_state)
                .unwrap_or(LifecycleState::Removed),
            permission_delta: PermissionDelta::retained_only(permissions),
            reason: Some(reason.into()),
        }
    }
}

/// Request accepted by the gateway's `extension.execute` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteRequest {
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub capability_id: String,
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_scope: Option<CapabilityScopeInput>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Structured domain failure carried by a failed execute response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionFailure {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ExtensionFailure {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Result of an execute call; authorization outcomes are returned, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecuteResponse {
    Completed {
        #[serde(rename = "extensionId")]
        extension_id: String,
        #[serde(rename = "extensionType")]
        extension_type: ExtensionType,
        #[serde(rename = "capabilityId")]
        capability_id: String,
        #[serde(rename = "trustLevel")]
        trust_level: TrustLevel,
        output: Value,
    },
    Failed {
        #[serde(rename = "extensionId")]
        extension_id: String,
        #[serde(rename = "extensionType")]
        extension_type: ExtensionType,
        #[serde(rename = "capabilityId")]
        capability_id: String,
        error: ExtensionFailure,
    },
}

impl ExecuteResponse {
    pub fn failed(request: &ExecuteRequest, error: ExtensionFailure) -> Self {
        Self::Failed {
            extension_id: request.extension_id.clone(),
            extension_type: request.extension_type,
            capability_id: request.capability_id.clone(),
            error,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error, .. } => Some(error.code.as_str()),
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Completed { output, .. } => Some(output),
            Self::Failed { .. } => None,
        }
    }
}
