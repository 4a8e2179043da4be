use async_trait::async_trait;

use crate::PipelineContext;

/// Ordered hook wrapping every governed action.
///
/// `before` hooks run in registration order, `after` hooks in reverse order,
/// and `transform` hooks only when the action produced a stream envelope.
/// Returning `Err` is normalized into a middleware execution error.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn id(&self) -> &str;

    async fn before(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        Ok(context)
    }

    async fn transform(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        Ok(context)
    }

    async fn after(&self, context: PipelineContext) -> anyhow::Result<PipelineContext> {
        Ok(context)
    }
}
