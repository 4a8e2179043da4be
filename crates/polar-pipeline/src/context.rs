use serde_json::Value;

use crate::PipelineError;

/// Caller-supplied envelope for one governed run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub execution_type: String,
    pub action_id: String,
    pub version: u32,
    pub trace_id: Option<String>,
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
    pub input: Value,
}

impl PipelineRequest {
    pub fn new(
        execution_type: impl Into<String>,
        action_id: impl Into<String>,
        version: u32,
        input: Value,
    ) -> Self {
        Self {
            execution_type: execution_type.into(),
            action_id: action_id.into(),
            version,
            trace_id: None,
            workflow_id: None,
            run_id: None,
            input,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self.run_id = Some(run_id.into());
        self
    }
}

/// Immutable run context threaded through middleware hooks.
///
/// Hooks receive a context by value and return a new one; the pipeline
/// refuses any returned context that clears or replaces an error already set.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineContext {
    pub execution_type: String,
    pub action_id: String,
    pub version: u32,
    pub trace_id: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<PipelineError>,
}

impl PipelineContext {
    pub fn with_input(self, input: Value) -> Self {
        Self { input, ..self }
    }

    pub fn with_output(self, output: Value) -> Self {
        Self {
            output: Some(output),
            ..self
        }
    }

    pub fn with_error(self, error: PipelineError) -> Self {
        Self {
            error: Some(error),
            ..self
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// True when the output is a chunked stream envelope (`streaming: true` plus a `chunks` array).
    pub fn output_is_stream(&self) -> bool {
        self.output.as_ref().is_some_and(|output| {
            output.get("streaming").and_then(Value::as_bool) == Some(true)
                && output.get("chunks").is_some_and(Value::is_array)
        })
    }
}
