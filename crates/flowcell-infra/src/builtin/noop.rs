use flowcell_core::handler::{HandlerContext, HandlerError, NodeHandler};
use serde_json::{Map, Value};

/// Passes its input items through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl NodeHandler for NoopHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        _parameters: &Map<String, Value>,
    ) -> Result<Vec<Value>, HandlerError> {
        Ok(ctx.input_items().to_vec())
    }
}
