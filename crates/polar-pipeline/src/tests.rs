use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use polar_contract::{ActionContract, ContractRegistry, RiskClass, TrustClass};
use polar_lineage::{
    AuditEvent, AuditOutcome, AuditSink, AuditSinkError, InMemoryAuditSink, InMemoryLineageStore,
    LineageEntry, LineagePage, LineageQuery, LineageRecord, LineageResult, LineageStore,
    LineageStoreError,
};
use serde_json::{json, Value};

use super::*;

const ECHO_ACTION: &str = "test.echo";

fn echo_registry() -> Arc<ContractRegistry> {
    let registry = ContractRegistry::new();
    registry
        .register(ActionContract {
            action_id: ECHO_ACTION.to_string(),
            version: 1,
            input_schema: json!({
                "type": "object",
                "required": ["message"],
                "properties": { "message": { "type": "string" } }
            }),
            output_schema: json!({ "type": "object", "required": ["echo"] }),
            risk_class: RiskClass::Low,
            trust_class: TrustClass::Native,
        })
        .expect("register");
    Arc::new(registry)
}

struct Harness {
    audit: Arc<InMemoryAuditSink>,
    lineage: Arc<InMemoryLineageStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            audit: Arc::new(InMemoryAuditSink::new()),
            lineage: Arc::new(InMemoryLineageStore::new()),
        }
    }

    fn pipeline(&self) -> MiddlewarePipeline {
        MiddlewarePipeline::new(echo_registry(), self.audit.clone(), self.lineage.clone())
    }
}

fn echo_request(message: &str) -> PipelineRequest {
    PipelineRequest::new("test", ECHO_ACTION, 1, json!({ "message": message }))
}

async fn echo_action(context: PipelineContext) -> anyhow::Result<Option<Value>> {
    Ok(Some(json!({ "echo": context.input["message"] })))
}

struct RecordingMiddleware {
    id: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for RecordingMiddleware {
    fn id(&self) -> &str {
        &self.id
    }

    async fn before(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("before:{}", self.id));
        Ok(context)
    }

    async fn after(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("after:{}", self.id));
        Ok(context)
    }
}

struct FailingBeforeMiddleware;

#[async_trait]
impl Middleware for FailingBeforeMiddleware {
    fn id(&self) -> &str {
        "failing-before"
    }

    async fn before(&self, _context: PipelineContext) -> anyhow::Result<PipelineContext> {
        Err(anyhow!("rate limiter unavailable"))
    }
}

struct ErrorClearingMiddleware;

#[async_trait]
impl Middleware for ErrorClearingMiddleware {
    fn id(&self) -> &str {
        "error-clearing"
    }

    async fn after(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        Ok(PipelineContext {
            error: None,
            ..context.with_output(json!({ "echo": "recovered" }))
        })
    }
}

struct InputRewritingMiddleware;

#[async_trait]
impl Middleware for InputRewritingMiddleware {
    fn id(&self) -> &str {
        "input-rewriting"
    }

    async fn before(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        Ok(context.with_input(json!({ "message": 42 })))
    }
}

struct StreamUppercaseMiddleware;

#[async_trait]
impl Middleware for StreamUppercaseMiddleware {
    fn id(&self) -> &str {
        "stream-uppercase"
    }

    async fn transform(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        let Some(mut output) = context.output.clone() else {
            return Ok(context);
        };
        if let Some(chunks) = output.get_mut("chunks").and_then(Value::as_array_mut) {
            for chunk in chunks.iter_mut() {
                if let Some(text) = chunk.as_str() {
                    *chunk = Value::String(text.to_uppercase());
                }
            }
        }
        Ok(context.with_output(output))
    }
}

struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        if event.checkpoint == CHECKPOINT_EXECUTION_COMPLETED {
            return Err(AuditSinkError("disk full".to_string()));
        }
        Ok(())
    }
}

struct FailingLineageStore;

#[async_trait]
impl LineageStore for FailingLineageStore {
    async fn append(&self, _entry: LineageEntry) -> LineageResult<LineageRecord> {
        Err(LineageStoreError::Unavailable("store offline".to_string()))
    }

    async fn query(&self, _query: LineageQuery) -> LineageResult<LineagePage> {
        Err(LineageStoreError::Unavailable("store offline".to_string()))
    }
}

#[tokio::test]
async fn functional_successful_run_emits_every_checkpoint_in_order() {
    let harness = Harness::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = harness
        .pipeline()
        .with_middleware(Arc::new(RecordingMiddleware {
            id: "first".to_string(),
            log: log.clone(),
        }))
        .with_middleware(Arc::new(RecordingMiddleware {
            id: "second".to_string(),
            log: log.clone(),
        }));

    let output = pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect("run");
    assert_eq!(output, json!({ "echo": "hello" }));

    assert_eq!(
        harness.audit.checkpoints().await,
        vec![
            CHECKPOINT_RUN_RECEIVED,
            CHECKPOINT_CONTRACT_RESOLVED,
            CHECKPOINT_INPUT_VALIDATED,
            CHECKPOINT_MIDDLEWARE_BEFORE,
            CHECKPOINT_MIDDLEWARE_BEFORE,
            CHECKPOINT_INPUT_REVALIDATED,
            CHECKPOINT_EXECUTION_COMPLETED,
            CHECKPOINT_MIDDLEWARE_AFTER,
            CHECKPOINT_MIDDLEWARE_AFTER,
            CHECKPOINT_OUTPUT_VALIDATED,
            CHECKPOINT_RUN_COMPLETED,
        ]
    );
    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["before:first", "before:second", "after:second", "after:first"]
    );
    assert_eq!(harness.lineage.len().await, 11);
}

#[tokio::test]
async fn unit_pipeline_generates_trace_id_when_absent_and_keeps_supplied_one() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    pipeline
        .run(echo_request("a"), echo_action)
        .await
        .expect("run");
    pipeline
        .run(echo_request("b").with_trace_id("trace-fixed"), echo_action)
        .await
        .expect("run");

    let events = harness.audit.events().await;
    assert!(events[0].trace_id.starts_with("trace-test-"));
    assert_eq!(events.last().expect("event").trace_id, "trace-fixed");
    assert!(events
        .iter()
        .all(|event| event.risk_class.is_some() || event.checkpoint == CHECKPOINT_RUN_RECEIVED));
}

#[tokio::test]
async fn regression_missing_contract_is_a_before_stage_error() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let error = pipeline
        .run(
            PipelineRequest::new("test", "test.unknown", 1, json!({})),
            echo_action,
        )
        .await
        .expect_err("missing contract");
    assert_eq!(error.code(), CONTRACT_NOT_FOUND_CODE);
    let events = harness.audit.events().await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].checkpoint, CHECKPOINT_CONTRACT_RESOLVED);
    assert_eq!(events[1].outcome, AuditOutcome::Failure);
    assert_eq!(events[2].checkpoint, CHECKPOINT_RUN_COMPLETED);
}

#[tokio::test]
async fn functional_invalid_input_fails_contract_validation_without_running_action() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let ran = Arc::new(Mutex::new(false));
    let ran_flag = ran.clone();
    let error = pipeline
        .run(
            PipelineRequest::new("test", ECHO_ACTION, 1, json!({ "message": 1 })),
            move |_context| async move {
                *ran_flag.lock().expect("flag") = true;
                Ok(Some(json!({ "echo": "never" })))
            },
        )
        .await
        .expect_err("invalid input");
    assert!(matches!(error, PipelineError::ContractValidation { .. }));
    assert!(!*ran.lock().expect("flag"));
}

#[tokio::test]
async fn functional_hook_exception_is_normalized_and_after_hooks_still_drain() {
    let harness = Harness::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = harness
        .pipeline()
        .with_middleware(Arc::new(RecordingMiddleware {
            id: "outer".to_string(),
            log: log.clone(),
        }))
        .with_middleware(Arc::new(FailingBeforeMiddleware));

    let error = pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect_err("hook failure");
    match &error {
        PipelineError::MiddlewareExecution {
            middleware_id,
            message,
            ..
        } => {
            assert_eq!(middleware_id, "failing-before");
            assert!(message.contains("rate limiter unavailable"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["before:outer", "after:outer"]
    );

    let events = harness.audit.events().await;
    let execution = events
        .iter()
        .find(|event| event.checkpoint == CHECKPOINT_EXECUTION_FAILED)
        .expect("execution checkpoint");
    assert_eq!(execution.outcome, AuditOutcome::Skipped);
    assert_eq!(
        events.last().expect("last").outcome,
        AuditOutcome::Failure
    );
}

#[tokio::test]
async fn regression_hook_clearing_recorded_error_is_fatal() {
    let harness = Harness::new();
    let pipeline = harness
        .pipeline()
        .with_middleware(Arc::new(ErrorClearingMiddleware));

    let error = pipeline
        .run(echo_request("hello"), |_context| async {
            Err(anyhow!("adapter exploded"))
        })
        .await
        .expect_err("fatal");
    assert!(error.is_fatal());
    assert!(error.to_string().contains("clear or override"));
}

#[tokio::test]
async fn functional_action_error_becomes_runtime_execution_error() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let error = pipeline
        .run(echo_request("hello").with_trace_id("trace-x"), |_context| async {
            Err(anyhow!("adapter exploded"))
        })
        .await
        .expect_err("runtime error");
    assert_eq!(
        error,
        PipelineError::RuntimeExecution {
            action_id: ECHO_ACTION.to_string(),
            version: 1,
            trace_id: "trace-x".to_string(),
            message: "adapter exploded".to_string(),
        }
    );
    assert_eq!(error.code(), RUNTIME_EXECUTION_ERROR_CODE);
}

#[tokio::test]
async fn regression_action_without_output_is_fatal_missing_output() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let error = pipeline
        .run(echo_request("hello"), |_context| async { Ok(None) })
        .await
        .expect_err("missing output");
    assert!(matches!(error, PipelineError::MissingOutput { .. }));
    assert!(error.is_fatal());
}

#[tokio::test]
async fn functional_before_hook_input_is_revalidated() {
    let harness = Harness::new();
    let pipeline = harness
        .pipeline()
        .with_middleware(Arc::new(InputRewritingMiddleware));
    let error = pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect_err("revalidation");
    assert!(matches!(error, PipelineError::ContractValidation { .. }));
    let checkpoints = harness.audit.checkpoints().await;
    assert!(checkpoints.contains(&CHECKPOINT_INPUT_REVALIDATED.to_string()));
    assert!(!checkpoints.contains(&CHECKPOINT_EXECUTION_COMPLETED.to_string()));
}

#[tokio::test]
async fn functional_output_schema_violation_fails_run() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    let error = pipeline
        .run(echo_request("hello"), |_context| async {
            Ok(Some(json!({ "unexpected": true })))
        })
        .await
        .expect_err("output violation");
    match error {
        PipelineError::ContractValidation { stage, .. } => {
            assert_eq!(stage, polar_lineage::AuditStage::After)
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn functional_stream_output_passes_through_transform_hooks() {
    let harness = Harness::new();
    let pipeline = harness
        .pipeline()
        .with_middleware(Arc::new(StreamUppercaseMiddleware));
    let output = pipeline
        .run(echo_request("hello"), |_context| async {
            Ok(Some(json!({ "echo": "x", "streaming": true, "chunks": ["ab", "cd"] })))
        })
        .await
        .expect("run");
    assert_eq!(output["chunks"], json!(["AB", "CD"]));
    assert!(harness
        .audit
        .checkpoints()
        .await
        .contains(&CHECKPOINT_MIDDLEWARE_TRANSFORM.to_string()));
}

#[tokio::test]
async fn unit_non_stream_output_skips_transform_hooks() {
    let harness = Harness::new();
    let pipeline = harness
        .pipeline()
        .with_middleware(Arc::new(StreamUppercaseMiddleware));
    pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect("run");
    assert!(!harness
        .audit
        .checkpoints()
        .await
        .contains(&CHECKPOINT_MIDDLEWARE_TRANSFORM.to_string()));
}

#[tokio::test]
async fn regression_audit_sink_failure_aborts_run() {
    let lineage = Arc::new(InMemoryLineageStore::new());
    let pipeline = MiddlewarePipeline::new(echo_registry(), Arc::new(FailingAuditSink), lineage);
    let error = pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect_err("audit failure");
    assert_eq!(
        error,
        PipelineError::AuditSink {
            checkpoint: CHECKPOINT_EXECUTION_COMPLETED.to_string(),
            message: "audit sink failed: disk full".to_string(),
        }
    );
}

#[tokio::test]
async fn regression_lineage_failure_aborts_run_unless_dev_mode() {
    let audit = Arc::new(InMemoryAuditSink::new());
    let pipeline = MiddlewarePipeline::new(
        echo_registry(),
        audit.clone(),
        Arc::new(FailingLineageStore),
    );
    let error = pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect_err("lineage failure");
    assert!(matches!(error, PipelineError::LineageAppend { .. }));
    assert_eq!(audit.events().await.len(), 1);

    let dev_pipeline = MiddlewarePipeline::new(
        echo_registry(),
        Arc::new(InMemoryAuditSink::new()),
        Arc::new(FailingLineageStore),
    )
    .with_options(PipelineOptions { dev_mode: true });
    dev_pipeline
        .run(echo_request("hello"), echo_action)
        .await
        .expect("dev mode skips lineage");
}

#[tokio::test]
async fn functional_lineage_records_carry_workflow_identifiers() {
    let harness = Harness::new();
    let pipeline = harness.pipeline();
    pipeline
        .run(
            echo_request("hello").with_workflow("wf-1", "run-1"),
            echo_action,
        )
        .await
        .expect("run");
    let page = harness
        .lineage
        .query(LineageQuery {
            run_id: Some("run-1".to_string()),
            ..LineageQuery::default()
        })
        .await
        .expect("query");
    assert_eq!(page.total_count, 7);
    assert!(page
        .items
        .iter()
        .all(|record| record.entry.event_type == LINEAGE_EVENT_CHECKPOINT));
}

#[test]
fn unit_generate_trace_id_uses_execution_type_prefix() {
    let trace_id = generate_trace_id("extension");
    let parts = trace_id.split('-').collect::<Vec<_>>();
    assert_eq!(parts[0], "trace");
    assert_eq!(parts[1], "extension");
    assert!(parts[2].parse::<u64>().is_ok());
    assert_eq!(parts[3].len(), 8);
}
