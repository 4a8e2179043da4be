use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use polar_contract::{
    builtin_contracts, ContractRegistryError, EXTENSION_CONTRACT_VERSION,
    EXTENSION_EXECUTE_ACTION_ID, EXTENSION_LIFECYCLE_ACTION_ID,
};
use polar_governance_types::{
    codes, ExecuteRequest, ExecuteResponse, ExtensionFailure, ExtensionSnapshot, ExtensionState,
    LifecycleRequest, LifecycleResponse, LifecycleState,
};
use polar_pipeline::{
    MiddlewarePipeline, PipelineContext, PipelineError, PipelineRequest, CONTRACT_VALIDATION_ERROR_CODE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::adapter::{AdapterRegistry, CapabilityAdapter, CapabilityInvocation};
use crate::lifecycle::{plan_lifecycle, LifecyclePlan};
use crate::policy::ExtensionPolicy;

pub const GATEWAY_EXECUTION_TYPE: &str = "extension";
pub const CAPABILITY_SCOPE_WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to register extension contracts: {0}")]
    Contracts(#[from] ContractRegistryError),
    #[error("failed to encode {action} payload: {source}")]
    Encode {
        action: &'static str,
        source: serde_json::Error,
    },
    #[error("failed to decode {action} payload: {source}")]
    Decode {
        action: &'static str,
        source: serde_json::Error,
    },
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Pipeline(error) => error.code(),
            Self::Contracts(_) | Self::Encode { .. } | Self::Decode { .. } => {
                CONTRACT_VALIDATION_ERROR_CODE
            }
        }
    }

    pub fn pipeline_error(&self) -> Option<&PipelineError> {
        match self {
            Self::Pipeline(error) => Some(error),
            _ => None,
        }
    }
}

/// Owns extension states and routes lifecycle/execute calls through the pipeline.
pub struct ExtensionGateway {
    pipeline: Arc<MiddlewarePipeline>,
    states: RwLock<BTreeMap<String, ExtensionState>>,
    extension_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    adapters: Arc<AdapterRegistry>,
    policy: Option<Arc<dyn ExtensionPolicy>>,
    approval_required_permissions: BTreeSet<String>,
}

impl ExtensionGateway {
    /// Builds a gateway, registering the extension contracts when the
    /// pipeline's registry does not already hold them.
    pub fn new(pipeline: Arc<MiddlewarePipeline>) -> Result<Self, GatewayError> {
        let contracts = pipeline.contracts();
        for contract in builtin_contracts() {
            if !contracts.has(&contract.action_id, contract.version) {
                contracts.register(contract)?;
            }
        }
        Ok(Self {
            pipeline,
            states: RwLock::new(BTreeMap::new()),
            extension_locks: Mutex::new(HashMap::new()),
            adapters: Arc::new(AdapterRegistry::new()),
            policy: None,
            approval_required_permissions: BTreeSet::new(),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn ExtensionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Permissions whose addition needs an approval ticket on the request.
    pub fn with_approval_required_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approval_required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn approval_required_permissions(&self) -> &BTreeSet<String> {
        &self.approval_required_permissions
    }

    pub fn pipeline(&self) -> &Arc<MiddlewarePipeline> {
        &self.pipeline
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn register_adapter(&self, extension_id: &str, adapter: Arc<dyn CapabilityAdapter>) {
        self.adapters.register(extension_id, adapter);
    }

    pub async fn get_state(&self, extension_id: &str) -> Option<ExtensionState> {
        self.states.read().await.get(extension_id).cloned()
    }

    pub async fn list_states(&self) -> Vec<ExtensionState> {
        self.states.read().await.values().cloned().collect()
    }

    /// Lifecycle snapshots consumed by the capability scope projector.
    pub async fn snapshots(&self) -> Vec<ExtensionSnapshot> {
        self.states
            .read()
            .await
            .values()
            .map(ExtensionState::snapshot)
            .collect()
    }

    pub async fn apply_lifecycle(
        &self,
        request: LifecycleRequest,
    ) -> Result<LifecycleResponse, GatewayError> {
        self.apply_lifecycle_traced(request, None).await
    }

    pub async fn apply_lifecycle_traced(
        &self,
        request: LifecycleRequest,
        trace_id: Option<&str>,
    ) -> Result<LifecycleResponse, GatewayError> {
        self.apply_lifecycle_with_adapter(request, trace_id, None).await
    }

    /// Applies a lifecycle request and, when it lands on a live state, registers
    /// `adapter` while the extension's lock is still held.
    pub async fn apply_lifecycle_with_adapter(
        &self,
        request: LifecycleRequest,
        trace_id: Option<&str>,
        adapter: Option<Arc<dyn CapabilityAdapter>>,
    ) -> Result<LifecycleResponse, GatewayError> {
        let input = encode(EXTENSION_LIFECYCLE_ACTION_ID, &request)?;
        self.run_lifecycle(input, trace_id, adapter).await
    }

    /// Runs a raw lifecycle payload; shape violations fail contract validation.
    pub async fn apply_lifecycle_value(
        &self,
        input: Value,
        trace_id: Option<&str>,
    ) -> Result<LifecycleResponse, GatewayError> {
        self.run_lifecycle(input, trace_id, None).await
    }

    async fn run_lifecycle(
        &self,
        input: Value,
        trace_id: Option<&str>,
        adapter: Option<Arc<dyn CapabilityAdapter>>,
    ) -> Result<LifecycleResponse, GatewayError> {
        let output = self
            .pipeline
            .run(
                pipeline_request(EXTENSION_LIFECYCLE_ACTION_ID, input, trace_id),
                |context| self.lifecycle_action(context, adapter),
            )
            .await?;
        decode(EXTENSION_LIFECYCLE_ACTION_ID, output)
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, GatewayError> {
        self.execute_traced(request, None).await
    }

    pub async fn execute_traced(
        &self,
        request: ExecuteRequest,
        trace_id: Option<&str>,
    ) -> Result<ExecuteResponse, GatewayError> {
        let input = encode(EXTENSION_EXECUTE_ACTION_ID, &request)?;
        self.execute_value(input, trace_id).await
    }

    /// Runs a raw execute payload; authorization outcomes come back as `Failed`.
    pub async fn execute_value(
        &self,
        input: Value,
        trace_id: Option<&str>,
    ) -> Result<ExecuteResponse, GatewayError> {
        let output = self
            .pipeline
            .run(
                pipeline_request(EXTENSION_EXECUTE_ACTION_ID, input, trace_id),
                |context| self.execute_action(context),
            )
            .await?;
        decode(EXTENSION_EXECUTE_ACTION_ID, output)
    }

    async fn lifecycle_action(
        &self,
        context: PipelineContext,
        adapter: Option<Arc<dyn CapabilityAdapter>>,
    ) -> anyhow::Result<Option<Value>> {
        let request: LifecycleRequest = serde_json::from_value(context.input)?;
        let response = self.transition(request, adapter).await;
        Ok(Some(serde_json::to_value(response)?))
    }

    async fn execute_action(&self, context: PipelineContext) -> anyhow::Result<Option<Value>> {
        let request: ExecuteRequest = serde_json::from_value(context.input)?;
        let response = self.authorize_and_invoke(request).await;
        Ok(Some(serde_json::to_value(response)?))
    }

    fn extension_lock(&self, extension_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.extension_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(extension_id.to_string()).or_default().clone()
    }

    async fn transition(
        &self,
        request: LifecycleRequest,
        adapter: Option<Arc<dyn CapabilityAdapter>>,
    ) -> LifecycleResponse {
        let lock = self.extension_lock(&request.extension_id);
        let _guard = lock.lock().await;
        let current = self.get_state(&request.extension_id).await;

        if let Some(policy) = &self.policy {
            let decision = policy.evaluate_lifecycle(&request, current.as_ref()).await;
            if let Some(reason) = decision.denial_reason("Lifecycle transition denied by policy") {
                tracing::info!(
                    extension_id = %request.extension_id,
                    operation = %request.operation,
                    reason = %reason,
                    "lifecycle transition vetoed by policy"
                );
                return LifecycleResponse::rejected(&request, current.as_ref(), reason);
            }
        }

        match plan_lifecycle(&request, current.as_ref()) {
            LifecyclePlan::Apply { next, response } => {
                if let Some(rejected) = self.require_approval(&request, current.as_ref(), &response) {
                    return rejected;
                }
                let mut states = self.states.write().await;
                match next {
                    Some(state) => {
                        states.insert(request.extension_id.clone(), state);
                        if let Some(adapter) = adapter {
                            self.adapters.register(&request.extension_id, adapter);
                        }
                    }
                    None => {
                        states.remove(&request.extension_id);
                        self.adapters.unregister(&request.extension_id);
                    }
                }
                tracing::debug!(
                    extension_id = %response.extension_id,
                    operation = %response.operation,
                    lifecycle_state = %response.lifecycle_state,
                    trust_level = %response.trust_level,
                    "lifecycle transition applied"
                );
                response
            }
            LifecyclePlan::Reject { response } => {
                tracing::info!(
                    extension_id = %response.extension_id,
                    operation = %response.operation,
                    reason = response.reason.as_deref().unwrap_or_default(),
                    "lifecycle transition rejected"
                );
                response
            }
        }
    }

    /// Rejects a planned transition that adds an approval-required permission
    /// without a ticket. Runs under the extension lock against the planned delta.
    fn require_approval(
        &self,
        request: &LifecycleRequest,
        current: Option<&ExtensionState>,
        planned: &LifecycleResponse,
    ) -> Option<LifecycleResponse> {
        let gated: Vec<&String> = planned
            .permission_delta
            .added
            .iter()
            .filter(|permission| self.approval_required_permissions.contains(*permission))
            .collect();
        let has_ticket = request
            .approval_ticket
            .as_deref()
            .is_some_and(|ticket| !ticket.trim().is_empty());
        if gated.is_empty() || has_ticket {
            return None;
        }
        tracing::info!(
            extension_id = %request.extension_id,
            operation = %request.operation,
            permissions = ?gated,
            "lifecycle transition needs approval ticket"
        );
        let reason = format!(
            "{} {} requires approval ticket for permission delta",
            request.extension_type.display_label(),
            request.operation
        );
        Some(LifecycleResponse {
            permission_delta: planned.permission_delta.clone(),
            ..LifecycleResponse::rejected(request, current, reason)
        })
    }

    async fn authorize_and_invoke(&self, request: ExecuteRequest) -> ExecuteResponse {
        let (state, adapter) = match self.authorize(&request).await {
            Ok(authorized) => authorized,
            Err(failure) => {
                tracing::info!(
                    extension_id = %request.extension_id,
                    capability_id = %request.capability_id,
                    code = %failure.code,
                    "extension execution denied"
                );
                return ExecuteResponse::failed(&request, failure);
            }
        };

        let invocation = CapabilityInvocation {
            extension_id: state.extension_id.clone(),
            extension_type: state.extension_type,
            capability_id: request.capability_id.clone(),
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            trust_level: state.trust_level,
            capability: state.capability(&request.capability_id).cloned(),
            input: request.input.clone(),
            metadata: request.metadata.clone(),
        };
        match adapter.execute_capability(invocation).await {
            Ok(output) => ExecuteResponse::Completed {
                extension_id: state.extension_id,
                extension_type: state.extension_type,
                capability_id: request.capability_id,
                trust_level: state.trust_level,
                output,
            },
            Err(error) => {
                tracing::warn!(
                    extension_id = %request.extension_id,
                    capability_id = %request.capability_id,
                    error = %format!("{error:#}"),
                    "extension adapter failed"
                );
                ExecuteResponse::failed(
                    &request,
                    ExtensionFailure::new(
                        codes::RUNTIME_EXECUTION_ERROR,
                        format!(
                            "Capability '{}' of extension '{}' failed during execution",
                            request.capability_id, request.extension_id
                        ),
                    )
                    .with_cause(format!("{error:#}")),
                )
            }
        }
    }

    /// Ordered authorization chain; the first failing check wins.
    async fn authorize(
        &self,
        request: &ExecuteRequest,
    ) -> Result<(ExtensionState, Arc<dyn CapabilityAdapter>), ExtensionFailure> {
        let extension_id = request.extension_id.as_str();
        let state = {
            let lock = self.extension_lock(extension_id);
            let _guard = lock.lock().await;
            self.get_state(extension_id).await
        };
        let state = match state {
            Some(state) if state.lifecycle_state != LifecycleState::Removed => state,
            _ => {
                return Err(ExtensionFailure::new(
                    codes::EXTENSION_NOT_INSTALLED,
                    format!("Extension '{extension_id}' is not installed"),
                ))
            }
        };

        if state.extension_type != request.extension_type {
            return Err(ExtensionFailure::new(
                codes::EXTENSION_TYPE_MISMATCH,
                format!(
                    "Extension '{extension_id}' is installed as {}, not {}",
                    state.extension_type, request.extension_type
                ),
            ));
        }
        if let Some(requested) = request.trust_level {
            if requested != state.trust_level {
                return Err(ExtensionFailure::new(
                    codes::EXTENSION_TRUST_LEVEL_MISMATCH,
                    format!(
                        "Requested trust level {requested} does not match persisted trust level {}",
                        state.trust_level
                    ),
                ));
            }
        }
        if state.is_blocked() {
            return Err(ExtensionFailure::new(
                codes::EXTENSION_BLOCKED,
                format!("Extension '{extension_id}' is blocked"),
            ));
        }
        if state.lifecycle_state != LifecycleState::Enabled {
            return Err(ExtensionFailure::new(
                codes::EXTENSION_NOT_ENABLED,
                format!(
                    "Extension '{extension_id}' is not enabled (lifecycle state {})",
                    state.lifecycle_state
                ),
            ));
        }

        let Some(allowed) = request
            .capability_scope
            .as_ref()
            .and_then(|scope| scope.allowed.as_ref())
        else {
            return Err(ExtensionFailure::new(
                codes::EXTENSION_POLICY_DENIED,
                "Capability scope with an allowed map is required",
            ));
        };
        let in_scope = allowed.get(extension_id).is_some_and(|capabilities| {
            capabilities.iter().any(|capability| {
                capability == CAPABILITY_SCOPE_WILDCARD || *capability == request.capability_id
            })
        });
        if !in_scope {
            return Err(ExtensionFailure::new(
                codes::EXTENSION_POLICY_DENIED,
                format!(
                    "Capability '{}' is not in scope for extension '{extension_id}'",
                    request.capability_id
                ),
            ));
        }

        if let Some(policy) = &self.policy {
            let decision = policy
                .evaluate_execution(request, &state, state.capability(&request.capability_id))
                .await;
            if let Some(reason) = decision.denial_reason("Execution denied by policy") {
                return Err(ExtensionFailure::new(codes::EXTENSION_POLICY_DENIED, reason));
            }
        }

        let Some(adapter) = self.adapters.get(extension_id) else {
            return Err(ExtensionFailure::new(
                codes::EXTENSION_ADAPTER_MISSING,
                format!("No capability adapter registered for extension '{extension_id}'"),
            ));
        };
        Ok((state, adapter))
    }
}

fn pipeline_request(action_id: &str, input: Value, trace_id: Option<&str>) -> PipelineRequest {
    let request = PipelineRequest::new(
        GATEWAY_EXECUTION_TYPE,
        action_id,
        EXTENSION_CONTRACT_VERSION,
        input,
    );
    match trace_id {
        Some(trace_id) => request.with_trace_id(trace_id),
        None => request,
    }
}

fn encode<T: Serialize>(action: &'static str, payload: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(payload).map_err(|source| GatewayError::Encode { action, source })
}

fn decode<T: DeserializeOwned>(action: &'static str, output: Value) -> Result<T, GatewayError> {
    serde_json::from_value(output).map_err(|source| GatewayError::Decode { action, source })
}
