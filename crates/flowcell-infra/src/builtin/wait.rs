use std::time::Duration;

use flowcell_core::handler::{HandlerContext, HandlerError, NodeHandler};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParameters {
    #[serde(default)]
    amount_ms: u64,
}

/// Sleeps for `amountMs`, then passes its input through.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitHandler;

impl NodeHandler for WaitHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<Value>, HandlerError> {
        let params: WaitParameters = serde_json::from_value(Value::Object(parameters.clone()))
            .map_err(|err| HandlerError::InvalidParameters(err.to_string()))?;
        tokio::time::sleep(Duration::from_millis(params.amount_ms)).await;
        Ok(ctx.input_items().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sleeps_then_passes_through() {
        let ctx = HandlerContext::new("s", "c", vec![json!({"k": "v"})], 10);
        let params = json!({"amountMs": 50}).as_object().cloned().unwrap();
        let started = std::time::Instant::now();
        let out = WaitHandler.execute(&ctx, &params).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(out, vec![json!({"k": "v"})]);
    }

    #[tokio::test]
    async fn negative_amount_is_invalid() {
        let ctx = HandlerContext::new("s", "c", Vec::new(), 10);
        let params = json!({"amountMs": -1}).as_object().cloned().unwrap();
        let err = WaitHandler.execute(&ctx, &params).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
    }
}
