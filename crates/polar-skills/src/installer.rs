use std::collections::BTreeSet;
use std::sync::Arc;

use polar_extensions::{
    CapabilityAdapter, ExtensionGateway, ExtensionPolicy, GatewayError, InstallEvaluation,
};
use polar_governance_types::{
    Capability, ExtensionType, LifecycleOperation, LifecycleRequest, LifecycleResponse,
    LifecycleState, LifecycleStatus, MissingMetadata, PermissionDelta, TrustLevel,
};
use polar_pipeline::CONTRACT_VALIDATION_ERROR_CODE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::provenance::{verify_provenance, ProvenanceInput, ProvenancePolicy, ProvenanceReport};
use crate::registry::{collect_missing_metadata, RegistryError, SkillRegistry};
use crate::sources::{
    ContentHashField, HealthReport, InstallSource, McpCatalogSource, McpHealthProbe,
    ParsedManifest, PluginDescriptorSource, SkillManifestSource,
};

/// Request fields that would loosen installer policy per call.
const POLICY_OVERRIDE_FIELDS: [&str; 3] = [
    "approvalRequiredPermissions",
    "autoEnableTrusted",
    "provenancePolicy",
];

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("{} manifest validation failed: {message}", .extension_type.display_label())]
    ManifestValidation {
        extension_type: ExtensionType,
        message: String,
    },
    #[error("invalid install request: {0}")]
    InvalidRequest(String),
    #[error("install request may not override installer policy field '{field}'")]
    PolicyOverrideRejected { field: String },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl InstallerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Gateway(error) => error.code(),
            Self::ManifestValidation { .. }
            | Self::InvalidRequest(_)
            | Self::PolicyOverrideRejected { .. }
            | Self::Registry(_) => CONTRACT_VALIDATION_ERROR_CODE,
        }
    }
}

/// Install policy fixed at installer construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallerPolicy {
    pub approval_required_permissions: BTreeSet<String>,
    pub auto_enable_trusted: bool,
    pub provenance: ProvenancePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallRequest {
    pub source_uri: String,
    pub manifest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_trust_level: Option<TrustLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_ticket: Option<String>,
    #[serde(default)]
    pub enable_after_install: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl InstallRequest {
    pub fn new(source_uri: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            manifest: manifest.into(),
            expected_hash: None,
            pinned_revision: None,
            signature: None,
            signer_public_key: None,
            requested_trust_level: None,
            approval_ticket: None,
            enable_after_install: false,
            trace_id: None,
        }
    }

    fn approval_ticket(&self) -> Option<&str> {
        self.approval_ticket
            .as_deref()
            .map(str::trim)
            .filter(|ticket| !ticket.is_empty())
    }
}

/// Parses a raw install request. Per-call policy overrides are refused outright.
pub fn parse_install_request(raw: Value) -> Result<InstallRequest, InstallerError> {
    if let Some(object) = raw.as_object() {
        if let Some(field) = POLICY_OVERRIDE_FIELDS
            .iter()
            .find(|field| object.contains_key(**field))
        {
            return Err(InstallerError::PolicyOverrideRejected {
                field: (*field).to_string(),
            });
        }
    }
    serde_json::from_value(raw).map_err(|error| InstallerError::InvalidRequest(error.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub status: LifecycleStatus,
    pub extension_id: String,
    pub extension_type: ExtensionType,
    pub operation: LifecycleOperation,
    pub trust_level: TrustLevel,
    pub lifecycle_state: LifecycleState,
    pub permission_delta: PermissionDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub capability_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_hash: Option<String>,
    pub provenance: ProvenanceReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_metadata: Vec<MissingMetadata>,
}

impl InstallResponse {
    pub fn is_applied(&self) -> bool {
        self.status == LifecycleStatus::Applied
    }
}

/// Builds the capability adapter registered for a freshly installed extension.
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        extension_type: ExtensionType,
        manifest: &ParsedManifest,
    ) -> Option<Arc<dyn CapabilityAdapter>>;
}

/// Runs the shared install gate sequence for skills, MCP servers, and plugins.
pub struct ExtensionInstaller {
    gateway: Arc<ExtensionGateway>,
    registry: Arc<SkillRegistry>,
    policy: InstallerPolicy,
    install_policy: Option<Arc<dyn ExtensionPolicy>>,
    adapter_factory: Option<Arc<dyn AdapterFactory>>,
    health_probe: Option<Arc<dyn McpHealthProbe>>,
}

impl ExtensionInstaller {
    pub fn new(
        gateway: Arc<ExtensionGateway>,
        registry: Arc<SkillRegistry>,
        policy: InstallerPolicy,
    ) -> Self {
        Self {
            gateway,
            registry,
            policy,
            install_policy: None,
            adapter_factory: None,
            health_probe: None,
        }
    }

    pub fn with_install_policy(mut self, policy: Arc<dyn ExtensionPolicy>) -> Self {
        self.install_policy = Some(policy);
        self
    }

    pub fn with_adapter_factory(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.adapter_factory = Some(factory);
        self
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn McpHealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn policy(&self) -> &InstallerPolicy {
        &self.policy
    }

    pub async fn install_skill(&self, request: InstallRequest) -> Result<InstallResponse, InstallerError> {
        self.install_from(&SkillManifestSource, request).await
    }

    pub async fn install_mcp(&self, request: InstallRequest) -> Result<InstallResponse, InstallerError> {
        self.install_from(&McpCatalogSource, request).await
    }

    pub async fn install_plugin(&self, request: InstallRequest) -> Result<InstallResponse, InstallerError> {
        self.install_from(&PluginDescriptorSource, request).await
    }

    #[tracing::instrument(
        name = "installer.install",
        skip_all,
        fields(extension_type = %source.extension_type(), source_uri = %request.source_uri)
    )]
    pub async fn install_from<S: InstallSource + ?Sized>(
        &self,
        source: &S,
        request: InstallRequest,
    ) -> Result<InstallResponse, InstallerError> {
        let extension_type = source.extension_type();
        let label = extension_type.display_label();
        let manifest = source.parse(&request.manifest).map_err(|error| {
            InstallerError::ManifestValidation {
                extension_type,
                message: format!("{error:#}"),
            }
        })?;
        let extension_id = manifest.extension_id.clone();

        let provenance = verify_provenance(
            &self.policy.provenance,
            ProvenanceInput {
                source_uri: &request.source_uri,
                content: request.manifest.as_bytes(),
                expected_hash: request.expected_hash.as_deref(),
                pinned_revision: request.pinned_revision.as_deref(),
                signature: request.signature.as_deref(),
                signer_public_key: request.signer_public_key.as_deref(),
            },
        );
        let current = self.gateway.get_state(&extension_id).await;
        let current_permissions = current
            .as_ref()
            .map(|state| state.permissions.clone())
            .unwrap_or_default();
        let operation = match current.as_ref() {
            Some(state) if state.lifecycle_state != LifecycleState::Removed => {
                LifecycleOperation::Upgrade
            }
            _ => LifecycleOperation::Install,
        };
        let mut outcome = InstallOutcome {
            source_hash: (source.content_hash_field(), provenance.content_hash.clone()),
            extension_id: extension_id.clone(),
            extension_type,
            operation,
            capability_ids: manifest.capability_ids(),
            provenance,
            health: None,
        };

        if !outcome.provenance.verified {
            let failure = outcome.provenance.failure.clone().unwrap_or_default();
            return Ok(outcome.rejected(
                TrustLevel::Blocked,
                current.as_ref().map(|state| state.lifecycle_state),
                PermissionDelta::retained_only(&current_permissions),
                format!("{label} provenance verification failed: {failure}"),
                Vec::new(),
            ));
        }

        let trust_level = request
            .requested_trust_level
            .unwrap_or(outcome.provenance.recommended_trust_level);
        let current_state = current.as_ref().map(|state| state.lifecycle_state);
        let reported_trust = current
            .as_ref()
            .map(|state| state.trust_level)
            .unwrap_or(trust_level);

        if extension_type == ExtensionType::Mcp {
            if let Some(probe) = &self.health_probe {
                let report = probe.probe(&extension_id, &request.source_uri).await;
                let unreachable = report.is_unreachable();
                let detail = report.detail.clone().unwrap_or_default();
                outcome.health = Some(report);
                if unreachable {
                    return Ok(outcome.rejected(
                        reported_trust,
                        current_state,
                        PermissionDelta::retained_only(&current_permissions),
                        format!("{label} server '{extension_id}' is unreachable: {detail}"),
                        Vec::new(),
                    ));
                }
            }
        }

        let permission_delta = PermissionDelta::compute(&current_permissions, &manifest.permissions);

        if let Some(policy) = &self.install_policy {
            let decision = policy
                .evaluate_install(&InstallEvaluation {
                    extension_id: extension_id.clone(),
                    extension_type,
                    operation,
                    trust_level,
                    source_uri: request.source_uri.clone(),
                    permission_delta: permission_delta.clone(),
                    capability_ids: outcome.capability_ids.clone(),
                })
                .await;
            if let Some(reason) = decision.denial_reason(&format!("{label} {operation} denied by policy")) {
                return Ok(outcome.rejected(
                    reported_trust,
                    current_state,
                    permission_delta,
                    reason,
                    Vec::new(),
                ));
            }
        }

        let needs_approval = permission_delta
            .added
            .iter()
            .any(|permission| self.policy.approval_required_permissions.contains(permission));
        if needs_approval && request.approval_ticket().is_none() {
            return Ok(outcome.rejected(
                reported_trust,
                current_state,
                permission_delta,
                format!("{label} {operation} requires approval ticket for permission delta"),
                Vec::new(),
            ));
        }

        let capabilities: Vec<Capability> = self
            .registry
            .process_metadata(&extension_id, &manifest.capabilities)
            .await;
        let missing_metadata = collect_missing_metadata(&capabilities);
        if !missing_metadata.is_empty() {
            self.registry
                .mark_blocked(&extension_id, missing_metadata.clone())
                .await;
            return Ok(outcome.rejected(
                reported_trust,
                current_state,
                permission_delta,
                format!("{label} metadata required"),
                missing_metadata,
            ));
        }

        let lifecycle = LifecycleRequest {
            extension_id: extension_id.clone(),
            extension_type,
            operation,
            trust_level: Some(trust_level),
            source_uri: Some(request.source_uri.clone()),
            requested_permissions: Some(manifest.permissions.clone()),
            approval_ticket: request.approval_ticket().map(str::to_string),
            metadata: None,
            capabilities: Some(capabilities),
        };
        let adapter = self
            .adapter_factory
            .as_ref()
            .and_then(|factory| factory.build(extension_type, &manifest));
        let mut response = self
            .gateway
            .apply_lifecycle_with_adapter(lifecycle, request.trace_id.as_deref(), adapter)
            .await?;
        if !response.is_applied() {
            return Ok(outcome.from_lifecycle(response, Vec::new()));
        }
        self.registry.clear_install_state(&extension_id).await;
        let permission_delta = response.permission_delta.clone();

        let auto_enable = self.policy.auto_enable_trusted && response.trust_level == TrustLevel::Trusted;
        if request.enable_after_install || auto_enable {
            let enable = LifecycleRequest::new(&extension_id, extension_type, LifecycleOperation::Enable);
            let enabled = self
                .gateway
                .apply_lifecycle_traced(enable, request.trace_id.as_deref())
                .await?;
            response = LifecycleResponse {
                operation,
                permission_delta,
                ..enabled
            };
        }

        tracing::info!(
            extension_id = %extension_id,
            operation = %operation,
            lifecycle_state = %response.lifecycle_state,
            status = ?response.status,
            "extension install processed"
        );
        Ok(outcome.from_lifecycle(response, Vec::new()))
    }
}

struct InstallOutcome {
    source_hash: (ContentHashField, String),
    extension_id: String,
    extension_type: ExtensionType,
    operation: LifecycleOperation,
    capability_ids: Vec<String>,
    provenance: ProvenanceReport,
    health: Option<HealthReport>,
}

impl InstallOutcome {
    fn rejected(
        self,
        trust_level: TrustLevel,
        current_state: Option<LifecycleState>,
        permission_delta: PermissionDelta,
        reason: String,
        missing_metadata: Vec<MissingMetadata>,
    ) -> InstallResponse {
        tracing::info!(
            extension_id = %self.extension_id,
            operation = %self.operation,
            reason = %reason,
            "extension install rejected"
        );
        let response = LifecycleResponse {
            status: LifecycleStatus::Rejected,
            extension_id: self.extension_id.clone(),
            extension_type: self.extension_type,
            operation: self.operation,
            trust_level,
            lifecycle_state: current_state.unwrap_or(LifecycleState::Removed),
            permission_delta,
            reason: Some(reason),
        };
        self.from_lifecycle(response, missing_metadata)
    }

    fn from_lifecycle(
        self,
        response: LifecycleResponse,
        missing_metadata: Vec<MissingMetadata>,
    ) -> InstallResponse {
        let (field, hash) = self.source_hash;
        let hash_for = |wanted: ContentHashField| (field == wanted).then(|| hash.clone());
        InstallResponse {
            status: response.status,
            extension_id: response.extension_id,
            extension_type: response.extension_type,
            operation: response.operation,
            trust_level: response.trust_level,
            lifecycle_state: response.lifecycle_state,
            permission_delta: response.permission_delta,
            reason: response.reason,
            capability_ids: self.capability_ids,
            manifest_hash: hash_for(ContentHashField::Manifest),
            catalog_hash: hash_for(ContentHashField::Catalog),
            descriptor_hash: hash_for(ContentHashField::Descriptor),
            provenance: self.provenance,
            health: self.health,
            missing_metadata,
        }
    }
}
