use std::sync::Arc;

use anyhow::{Context, Result};
use polar_contract::ContractRegistry;
use polar_extensions::{ExtensionGateway, ExtensionPolicy};
use polar_lineage::{
    AuditSink, InMemoryLineageStore, JsonlAuditSink, LineageStore, TracingAuditSink,
};
use polar_orchestrator::{
    compute_capability_scope, validate_forward_skills, validate_model_override, ActiveDelegation,
    CapabilityScope, ForwardSkillValidation, ModelOverrideResolution, SessionProfile,
};
use polar_pipeline::{Middleware, MiddlewarePipeline, PipelineOptions};
use polar_skills::{AdapterFactory, ExtensionInstaller, McpHealthProbe, SkillRegistry};

use crate::GovernanceConfig;

/// Optional collaborators plugged in at construction. An unset audit sink
/// falls back to the configured JSONL log or [`TracingAuditSink`]; an unset
/// lineage store to [`InMemoryLineageStore`].
#[derive(Default)]
pub struct RuntimeComponents {
    pub audit_sink: Option<Arc<dyn AuditSink>>,
    pub lineage: Option<Arc<dyn LineageStore>>,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub extension_policy: Option<Arc<dyn ExtensionPolicy>>,
    pub adapter_factory: Option<Arc<dyn AdapterFactory>>,
    pub health_probe: Option<Arc<dyn McpHealthProbe>>,
}

/// Fully wired governance engine: contracts, pipeline, gateway, registry and installer.
pub struct GovernanceRuntime {
    config: GovernanceConfig,
    contracts: Arc<ContractRegistry>,
    lineage: Arc<dyn LineageStore>,
    gateway: Arc<ExtensionGateway>,
    registry: Arc<SkillRegistry>,
    installer: ExtensionInstaller,
}

impl GovernanceRuntime {
    pub fn new(config: GovernanceConfig) -> Result<Self> {
        Self::with_components(config, RuntimeComponents::default())
    }

    pub fn with_components(config: GovernanceConfig, components: RuntimeComponents) -> Result<Self> {
        let contracts = Arc::new(ContractRegistry::new());
        let audit_sink: Arc<dyn AuditSink> = match (components.audit_sink, &config.audit_log_path) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(JsonlAuditSink::open(path.clone())?),
            (None, None) => Arc::new(TracingAuditSink),
        };
        let lineage: Arc<dyn LineageStore> = match components.lineage {
            Some(lineage) => lineage,
            None => Arc::new(InMemoryLineageStore::new()),
        };

        let pipeline = components.middlewares.into_iter().fold(
            MiddlewarePipeline::new(contracts.clone(), audit_sink, lineage.clone()).with_options(
                PipelineOptions {
                    dev_mode: config.dev_mode,
                },
            ),
            MiddlewarePipeline::with_middleware,
        );

        let mut gateway = ExtensionGateway::new(Arc::new(pipeline))
            .context("failed to register extension gateway contracts")?
            .with_approval_required_permissions(config.approval_required_permissions.iter().cloned());
        if let Some(policy) = components.extension_policy.clone() {
            gateway = gateway.with_policy(policy);
        }
        let gateway = Arc::new(gateway);
        let registry = Arc::new(SkillRegistry::new());

        let mut installer =
            ExtensionInstaller::new(gateway.clone(), registry.clone(), config.installer_policy());
        if let Some(policy) = components.extension_policy {
            installer = installer.with_install_policy(policy);
        }
        if let Some(factory) = components.adapter_factory {
            installer = installer.with_adapter_factory(factory);
        }
        if let Some(probe) = components.health_probe {
            installer = installer.with_health_probe(probe);
        }

        tracing::info!(
            dev_mode = config.dev_mode,
            approval_required_permissions = config.approval_required_permissions.len(),
            auto_enable_trusted = config.auto_enable_trusted,
            "governance runtime initialized"
        );
        Ok(Self {
            config,
            contracts,
            lineage,
            gateway,
            registry,
            installer,
        })
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    pub fn lineage(&self) -> &Arc<dyn LineageStore> {
        &self.lineage
    }

    pub fn gateway(&self) -> &Arc<ExtensionGateway> {
        &self.gateway
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub fn installer(&self) -> &ExtensionInstaller {
        &self.installer
    }

    /// Projects the current gateway state plus registry overlays into a capability scope.
    pub async fn capability_scope(
        &self,
        session_profile: &SessionProfile,
        active_delegation: Option<&ActiveDelegation>,
    ) -> CapabilityScope {
        let installed = self.gateway.snapshots().await;
        let authority = self.registry.authority_states().await;
        compute_capability_scope(
            session_profile,
            &self.config.scope.to_scope_config(),
            active_delegation,
            &installed,
            &authority,
        )
    }

    pub fn validate_forward_skills(&self, requested: &[String]) -> ForwardSkillValidation {
        validate_forward_skills(
            requested,
            &self.config.scope.forward_skill_allowlist,
            self.config.scope.allow_empty_delegation,
        )
    }

    pub fn resolve_model_override(&self, requested: Option<&str>) -> ModelOverrideResolution {
        validate_model_override(
            requested,
            &self.config.models.allowlist,
            &self.config.models.default_model,
        )
    }

    /// Mirrors the gateway's view of `extension_id` into the registry's authority overlay.
    pub async fn sync_authority(&self, extension_id: &str) {
        let snapshot = self
            .gateway
            .get_state(extension_id)
            .await
            .map(|state| state.snapshot());
        self.registry.sync_authority(extension_id, snapshot).await;
    }
}
