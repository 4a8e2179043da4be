use polar_lineage::{AuditError, AuditStage};
use thiserror::Error;

pub const CONTRACT_NOT_FOUND_CODE: &str = "POLAR_CONTRACT_NOT_FOUND";
pub const CONTRACT_VALIDATION_ERROR_CODE: &str = "POLAR_CONTRACT_VALIDATION_ERROR";
pub const RUNTIME_EXECUTION_ERROR_CODE: &str = "POLAR_RUNTIME_EXECUTION_ERROR";
pub const MIDDLEWARE_EXECUTION_ERROR_CODE: &str = "POLAR_MIDDLEWARE_EXECUTION_ERROR";

/// Failures that abort or fail a governed run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("contract not found: '{action_id}@{version}'")]
    ContractNotFound { action_id: String, version: u32 },
    #[error("contract validation failed for '{action_id}@{version}' ({}): {message}", .stage.as_str())]
    ContractValidation {
        action_id: String,
        version: u32,
        stage: AuditStage,
        message: String,
    },
    #[error("execution of '{action_id}@{version}' failed (trace {trace_id}): {message}")]
    RuntimeExecution {
        action_id: String,
        version: u32,
        trace_id: String,
        message: String,
    },
    #[error("middleware '{middleware_id}' failed at {checkpoint}: {message}")]
    MiddlewareExecution {
        middleware_id: String,
        checkpoint: String,
        message: String,
    },
    #[error("action '{action_id}@{version}' completed without output")]
    MissingOutput { action_id: String, version: u32 },
    #[error("audit sink failed at {checkpoint}: {message}")]
    AuditSink { checkpoint: String, message: String },
    #[error("lineage append failed at {checkpoint}: {message}")]
    LineageAppend { checkpoint: String, message: String },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContractNotFound { .. } => CONTRACT_NOT_FOUND_CODE,
            Self::ContractValidation { .. } => CONTRACT_VALIDATION_ERROR_CODE,
            Self::RuntimeExecution { .. } => RUNTIME_EXECUTION_ERROR_CODE,
            Self::MiddlewareExecution { .. }
            | Self::MissingOutput { .. }
            | Self::AuditSink { .. }
            | Self::LineageAppend { .. } => MIDDLEWARE_EXECUTION_ERROR_CODE,
        }
    }

    /// True for pipeline-infrastructure failures.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MiddlewareExecution { .. }
                | Self::MissingOutput { .. }
                | Self::AuditSink { .. }
                | Self::LineageAppend { .. }
        )
    }

    pub(crate) fn to_audit_error(&self) -> AuditError {
        AuditError {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
