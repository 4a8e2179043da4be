use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use async_trait::async_trait;
use polar_contract::{RiskClass, TrustClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Before,
    Execution,
    Transform,
    After,
}

impl AuditStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::Execution => "execution",
            Self::Transform => "transform",
            Self::After => "after",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Skipped,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditError {
    pub code: String,
    pub message: String,
}

/// Audit envelope emitted for every pipeline checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub audit_id: String,
    pub timestamp: String,
    pub trace_id: String,
    pub execution_type: String,
    pub action_id: String,
    pub version: u32,
    pub stage: AuditStage,
    pub checkpoint: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_class: Option<RiskClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_class: Option<TrustClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuditError>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("audit sink failed: {0}")]
pub struct AuditSinkError(pub String);

/// Destination for audit envelopes. Emission is awaited; failures abort the governed run.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditSinkError>;
}

/// Keeps every emitted event in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn checkpoints(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|event| event.checkpoint.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Writes each envelope as a structured `tracing` event under the `polar::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        tracing::info!(
            target: "polar::audit",
            audit_id = %event.audit_id,
            trace_id = %event.trace_id,
            action_id = %event.action_id,
            version = event.version,
            stage = event.stage.as_str(),
            checkpoint = %event.checkpoint,
            outcome = event.outcome.as_str(),
            middleware_id = event.middleware_id.as_deref().unwrap_or(""),
            error = event.error.as_ref().map(|error| error.code.as_str()).unwrap_or(""),
            "governance checkpoint"
        );
        Ok(())
    }
}

/// Appends envelopes as JSON lines to a local file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: StdMutex<std::fs::File>,
}

impl JsonlAuditSink {
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create audit log directory {}", parent.display())
                })?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
        Ok(Self {
            path,
            file: StdMutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<(), AuditSinkError> {
        let line = serde_json::to_string(event)
            .map_err(|error| AuditSinkError(format!("failed to encode audit event: {error}")))?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| AuditSinkError("audit log file lock is poisoned".to_string()))?;
        writeln!(file, "{line}").map_err(|error| {
            AuditSinkError(format!(
                "failed to write audit log {}: {error}",
                self.path.display()
            ))
        })?;
        file.flush().map_err(|error| {
            AuditSinkError(format!(
                "failed to flush audit log {}: {error}",
                self.path.display()
            ))
        })
    }
}
