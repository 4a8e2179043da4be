//! Contract-validated middleware pipeline for governed Polar actions.
//!
//! Every run resolves its contract, validates input, folds `before` hooks,
//! invokes the action body, folds `after` hooks in reverse order, validates
//! output, and emits one audit event (plus one lineage record outside dev
//! mode) per checkpoint. Audit and lineage failures abort the run.

use std::future::Future;
use std::sync::Arc;

use polar_contract::{ContractRegistry, RegisteredContract, RiskClass, TrustClass};
use polar_core::{current_rfc3339_timestamp, current_unix_timestamp_ms};
use polar_lineage::{
    AuditEvent, AuditOutcome, AuditSink, AuditStage, LineageEntry, LineageStore,
};
use serde_json::Value;

mod context;
mod error;
mod middleware;

pub use context::*;
pub use error::*;
pub use middleware::*;

pub const CHECKPOINT_RUN_RECEIVED: &str = "run.received";
pub const CHECKPOINT_CONTRACT_RESOLVED: &str = "contract.resolved";
pub const CHECKPOINT_INPUT_VALIDATED: &str = "contract.input.validated";
pub const CHECKPOINT_MIDDLEWARE_BEFORE: &str = "middleware.before";
pub const CHECKPOINT_INPUT_REVALIDATED: &str = "contract.input.revalidated";
pub const CHECKPOINT_EXECUTION_COMPLETED: &str = "execution.completed";
pub const CHECKPOINT_EXECUTION_FAILED: &str = "execution.failed";
pub const CHECKPOINT_MIDDLEWARE_TRANSFORM: &str = "middleware.transform";
pub const CHECKPOINT_MIDDLEWARE_AFTER: &str = "middleware.after";
pub const CHECKPOINT_OUTPUT_VALIDATED: &str = "contract.output.validated";
pub const CHECKPOINT_RUN_COMPLETED: &str = "run.completed";

pub const LINEAGE_EVENT_CHECKPOINT: &str = "governance.checkpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineOptions {
    /// Skip lineage appends; audit events are still emitted.
    pub dev_mode: bool,
}

/// Executes governed actions through contracts, hooks, audit and lineage.
pub struct MiddlewarePipeline {
    contracts: Arc<ContractRegistry>,
    audit_sink: Arc<dyn AuditSink>,
    lineage: Arc<dyn LineageStore>,
    middlewares: Vec<Arc<dyn Middleware>>,
    options: PipelineOptions,
}

impl MiddlewarePipeline {
    pub fn new(
        contracts: Arc<ContractRegistry>,
        audit_sink: Arc<dyn AuditSink>,
        lineage: Arc<dyn LineageStore>,
    ) -> Self {
        Self {
            contracts,
            audit_sink,
            lineage,
            middlewares: Vec::new(),
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    pub fn lineage(&self) -> &Arc<dyn LineageStore> {
        &self.lineage
    }

    pub fn middleware_ids(&self) -> Vec<String> {
        self.middlewares
            .iter()
            .map(|middleware| middleware.id().to_string())
            .collect()
    }

    /// Runs one governed action. `action` receives the revalidated context and
    /// must return output or fail; `Ok(None)` is a fatal missing-output error.
    #[tracing::instrument(
        name = "pipeline.run",
        skip_all,
        fields(action_id = %request.action_id, version = request.version)
    )]
    pub async fn run<F, Fut>(&self, request: PipelineRequest, action: F) -> Result<Value, PipelineError>
    where
        F: FnOnce(PipelineContext) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send,
    {
        let trace_id = request
            .trace_id
            .as_deref()
            .map(str::trim)
            .filter(|trace_id| !trace_id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| generate_trace_id(&request.execution_type));
        let mut recorder = CheckpointRecorder {
            pipeline: self,
            trace_id: trace_id.clone(),
            execution_type: request.execution_type.clone(),
            action_id: request.action_id.clone(),
            version: request.version,
            workflow_id: request.workflow_id.clone(),
            run_id: request.run_id.clone(),
            risk_class: None,
            trust_class: None,
        };

        recorder
            .record(AuditStage::Before, CHECKPOINT_RUN_RECEIVED, None, None)
            .await?;

        let contract = match self.contracts.get(&request.action_id, request.version) {
            Ok(contract) => contract,
            Err(_) => {
                let error = PipelineError::ContractNotFound {
                    action_id: request.action_id.clone(),
                    version: request.version,
                };
                return recorder
                    .fail_early(CHECKPOINT_CONTRACT_RESOLVED, error)
                    .await;
            }
        };
        recorder.risk_class = Some(contract.risk_class());
        recorder.trust_class = Some(contract.trust_class());
        recorder
            .record(AuditStage::Before, CHECKPOINT_CONTRACT_RESOLVED, None, None)
            .await?;

        if let Err(violation) = contract.validate_input(&request.input) {
            let error = contract_validation_error(&contract, AuditStage::Before, violation.to_string());
            return recorder.fail_early(CHECKPOINT_INPUT_VALIDATED, error).await;
        }
        recorder
            .record(AuditStage::Before, CHECKPOINT_INPUT_VALIDATED, None, None)
            .await?;

        let mut context = PipelineContext {
            execution_type: request.execution_type,
            action_id: request.action_id,
            version: request.version,
            trace_id,
            input: request.input,
            output: None,
            error: None,
        };

        for middleware in &self.middlewares {
            if context.has_error() {
                break;
            }
            context = self
                .apply_hook(
                    &recorder,
                    middleware.as_ref(),
                    HookPhase::Before,
                    context,
                )
                .await?;
        }

        if context.has_error() {
            recorder
                .record_outcome(
                    AuditStage::Before,
                    CHECKPOINT_INPUT_REVALIDATED,
                    AuditOutcome::Skipped,
                    None,
                    None,
                )
                .await?;
        } else {
            match contract.validate_input(&context.input) {
                Ok(()) => {
                    recorder
                        .record(AuditStage::Before, CHECKPOINT_INPUT_REVALIDATED, None, None)
                        .await?;
                }
                Err(violation) => {
                    let error =
                        contract_validation_error(&contract, AuditStage::Before, violation.to_string());
                    recorder
                        .record(
                            AuditStage::Before,
                            CHECKPOINT_INPUT_REVALIDATED,
                            None,
                            Some(&error),
                        )
                        .await?;
                    context = context.with_error(error);
                }
            }
        }

        if context.has_error() {
            recorder
                .record_outcome(
                    AuditStage::Execution,
                    CHECKPOINT_EXECUTION_FAILED,
                    AuditOutcome::Skipped,
                    None,
                    context.error.as_ref(),
                )
                .await?;
        } else {
            match action(context.clone()).await {
                Ok(Some(output)) => {
                    context = context.with_output(output);
                    recorder
                        .record(AuditStage::Execution, CHECKPOINT_EXECUTION_COMPLETED, None, None)
                        .await?;
                }
                Ok(None) => {
                    let error = PipelineError::MissingOutput {
                        action_id: context.action_id.clone(),
                        version: context.version,
                    };
                    recorder
                        .record(AuditStage::Execution, CHECKPOINT_EXECUTION_FAILED, None, Some(&error))
                        .await?;
                    context = context.with_error(error);
                }
                Err(cause) => {
                    let error = PipelineError::RuntimeExecution {
                        action_id: context.action_id.clone(),
                        version: context.version,
                        trace_id: context.trace_id.clone(),
                        message: format!("{cause:#}"),
                    };
                    tracing::warn!(
                        trace_id = %context.trace_id,
                        error = %error,
                        "governed action body failed"
                    );
                    recorder
                        .record(AuditStage::Execution, CHECKPOINT_EXECUTION_FAILED, None, Some(&error))
                        .await?;
                    context = context.with_error(error);
                }
            }
        }

        if !context.has_error() && context.output_is_stream() {
            for middleware in &self.middlewares {
                if context.has_error() {
                    break;
                }
                context = self
                    .apply_hook(
                        &recorder,
                        middleware.as_ref(),
                        HookPhase::Transform,
                        context,
                    )
                    .await?;
            }
        }

        for middleware in self.middlewares.iter().rev() {
            context = self
                .apply_hook(&recorder, middleware.as_ref(), HookPhase::After, context)
                .await?;
        }

        if context.has_error() {
            recorder
                .record_outcome(
                    AuditStage::After,
                    CHECKPOINT_OUTPUT_VALIDATED,
                    AuditOutcome::Skipped,
                    None,
                    None,
                )
                .await?;
        } else {
            let validation = match context.output.as_ref() {
                None => Err(PipelineError::MissingOutput {
                    action_id: context.action_id.clone(),
                    version: context.version,
                }),
                Some(output) => contract.validate_output(output).map_err(|violation| {
                    contract_validation_error(&contract, AuditStage::After, violation.to_string())
                }),
            };
            match validation {
                Ok(()) => {
                    recorder
                        .record(AuditStage::After, CHECKPOINT_OUTPUT_VALIDATED, None, None)
                        .await?;
                }
                Err(error) => {
                    recorder
                        .record(AuditStage::After, CHECKPOINT_OUTPUT_VALIDATED, None, Some(&error))
                        .await?;
                    context = context.with_error(error);
                }
            }
        }

        recorder
            .record(
                AuditStage::After,
                CHECKPOINT_RUN_COMPLETED,
                None,
                context.error.as_ref(),
            )
            .await?;

        match (context.error, context.output) {
            (Some(error), _) => Err(error),
            (None, Some(output)) => Ok(output),
            (None, None) => Err(PipelineError::MissingOutput {
                action_id: context.action_id,
                version: context.version,
            }),
        }
    }

    async fn apply_hook(
        &self,
        recorder: &CheckpointRecorder<'_>,
        middleware: &dyn Middleware,
        phase: HookPhase,
        context: PipelineContext,
    ) -> Result<PipelineContext, PipelineError> {
        let (stage, checkpoint) = phase.checkpoint();
        let middleware_id = middleware.id().to_string();
        let previous_error = context.error.clone();
        let result = match phase {
            HookPhase::Before => middleware.before(context.clone()).await,
            HookPhase::Transform => middleware.transform(context.clone()).await,
            HookPhase::After => middleware.after(context.clone()).await,
        };

        match result {
            Ok(next) => {
                if previous_error.is_some() && next.error != previous_error {
                    let fatal = PipelineError::MiddlewareExecution {
                        middleware_id: middleware_id.clone(),
                        checkpoint: checkpoint.to_string(),
                        message: "hook attempted to clear or override an existing error"
                            .to_string(),
                    };
                    tracing::error!(
                        trace_id = %context.trace_id,
                        middleware_id = %middleware_id,
                        checkpoint,
                        "middleware attempted to rewrite a recorded error"
                    );
                    recorder
                        .record(stage, checkpoint, Some(&middleware_id), Some(&fatal))
                        .await?;
                    recorder
                        .record(AuditStage::After, CHECKPOINT_RUN_COMPLETED, None, Some(&fatal))
                        .await?;
                    return Err(fatal);
                }
                let introduced_error = if previous_error.is_none() {
                    next.error.as_ref()
                } else {
                    None
                };
                recorder
                    .record(stage, checkpoint, Some(&middleware_id), introduced_error)
                    .await?;
                Ok(next)
            }
            Err(cause) => {
                let hook_error = PipelineError::MiddlewareExecution {
                    middleware_id: middleware_id.clone(),
                    checkpoint: checkpoint.to_string(),
                    message: format!("{cause:#}"),
                };
                tracing::warn!(
                    trace_id = %context.trace_id,
                    middleware_id = %middleware_id,
                    checkpoint,
                    error = %hook_error,
                    "middleware hook failed"
                );
                recorder
                    .record(stage, checkpoint, Some(&middleware_id), Some(&hook_error))
                    .await?;
                if context.has_error() {
                    Ok(context)
                } else {
                    Ok(context.with_error(hook_error))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum HookPhase {
    Before,
    Transform,
    After,
}

impl HookPhase {
    fn checkpoint(self) -> (AuditStage, &'static str) {
        match self {
            Self::Before => (AuditStage::Before, CHECKPOINT_MIDDLEWARE_BEFORE),
            Self::Transform => (AuditStage::Transform, CHECKPOINT_MIDDLEWARE_TRANSFORM),
            Self::After => (AuditStage::After, CHECKPOINT_MIDDLEWARE_AFTER),
        }
    }
}

struct CheckpointRecorder<'a> {
    pipeline: &'a MiddlewarePipeline,
    trace_id: String,
    execution_type: String,
    action_id: String,
    version: u32,
    workflow_id: Option<String>,
    run_id: Option<String>,
    risk_class: Option<RiskClass>,
    trust_class: Option<TrustClass>,
}

impl CheckpointRecorder<'_> {
    async fn record(
        &self,
        stage: AuditStage,
        checkpoint: &str,
        middleware_id: Option<&str>,
        error: Option<&PipelineError>,
    ) -> Result<(), PipelineError> {
        let outcome = if error.is_some() {
            AuditOutcome::Failure
        } else {
            AuditOutcome::Success
        };
        self.record_outcome(stage, checkpoint, outcome, middleware_id, error)
            .await
    }

    async fn record_outcome(
        &self,
        stage: AuditStage,
        checkpoint: &str,
        outcome: AuditOutcome,
        middleware_id: Option<&str>,
        error: Option<&PipelineError>,
    ) -> Result<(), PipelineError> {
        let event = AuditEvent {
            audit_id: format!("audit-{:016x}", rand::random::<u64>()),
            timestamp: current_rfc3339_timestamp(),
            trace_id: self.trace_id.clone(),
            execution_type: self.execution_type.clone(),
            action_id: self.action_id.clone(),
            version: self.version,
            stage,
            checkpoint: checkpoint.to_string(),
            outcome,
            risk_class: self.risk_class,
            trust_class: self.trust_class,
            middleware_id: middleware_id.map(str::to_string),
            error: error.map(PipelineError::to_audit_error),
        };
        tracing::debug!(
            trace_id = %event.trace_id,
            checkpoint,
            outcome = outcome.as_str(),
            "pipeline checkpoint"
        );

        self.pipeline
            .audit_sink
            .emit(&event)
            .await
            .map_err(|error| PipelineError::AuditSink {
                checkpoint: checkpoint.to_string(),
                message: error.to_string(),
            })?;

        if self.pipeline.options.dev_mode {
            return Ok(());
        }
        let payload = serde_json::to_value(&event).map_err(|error| PipelineError::LineageAppend {
            checkpoint: checkpoint.to_string(),
            message: format!("failed to encode audit event: {error}"),
        })?;
        self.pipeline
            .lineage
            .append(LineageEntry {
                event_type: LINEAGE_EVENT_CHECKPOINT.to_string(),
                trace_id: Some(self.trace_id.clone()),
                action_id: Some(self.action_id.clone()),
                workflow_id: self.workflow_id.clone(),
                run_id: self.run_id.clone(),
                payload,
            })
            .await
            .map_err(|error| PipelineError::LineageAppend {
                checkpoint: checkpoint.to_string(),
                message: error.to_string(),
            })?;
        Ok(())
    }

    /// Records a before-stage failure followed by `run.completed` and returns the error.
    async fn fail_early(
        &self,
        checkpoint: &str,
        error: PipelineError,
    ) -> Result<Value, PipelineError> {
        tracing::info!(
            trace_id = %self.trace_id,
            action_id = %self.action_id,
            checkpoint,
            error = %error,
            "governed run rejected before execution"
        );
        self.record(AuditStage::Before, checkpoint, None, Some(&error))
            .await?;
        self.record(AuditStage::After, CHECKPOINT_RUN_COMPLETED, None, Some(&error))
            .await?;
        Err(error)
    }
}

fn contract_validation_error(
    contract: &RegisteredContract,
    stage: AuditStage,
    message: String,
) -> PipelineError {
    PipelineError::ContractValidation {
        action_id: contract.action_id().to_string(),
        version: contract.version(),
        stage,
        message,
    }
}

/// Builds `trace-{execution_type}-{unix_ms}-{random}`.
pub fn generate_trace_id(execution_type: &str) -> String {
    format!(
        "trace-{}-{}-{:08x}",
        execution_type,
        current_unix_timestamp_ms(),
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests;
