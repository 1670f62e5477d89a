//! `set` node: merge fixed values into every item.

use flowcell_core::handler::{HandlerContext, HandlerError, NodeHandler};
use flowcell_types::result::LogLevel;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetParameters {
    #[serde(default)]
    values: Map<String, Value>,
    #[serde(default)]
    keep_only_set: bool,
}

/// Sets `values` on each input item.
///
/// With `keepOnlySet` the item's own fields are dropped. An empty input is
/// treated as a single empty item so the node always produces output.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetHandler;

impl NodeHandler for SetHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<Value>, HandlerError> {
        let params: SetParameters = serde_json::from_value(Value::Object(parameters.clone()))
            .map_err(|err| HandlerError::InvalidParameters(err.to_string()))?;

        let empty = [Value::Object(Map::new())];
        let input = match ctx.input_items() {
            [] => &empty[..],
            items => items,
        };

        let mut output = Vec::with_capacity(input.len());
        for item in input {
            let mut fields = match item {
                _ if params.keep_only_set => Map::new(),
                Value::Object(fields) => fields.clone(),
                other => {
                    return Err(HandlerError::InvalidParameters(format!(
                        "input item must be an object, got {other}"
                    )));
                }
            };
            fields.extend(params.values.iter().map(|(k, v)| (k.clone(), v.clone())));
            output.push(Value::Object(fields));
        }

        ctx.log(
            LogLevel::Debug,
            format!("set {} field(s) on {} item(s)", params.values.len(), output.len()),
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn merges_values_into_items() {
        let ctx = HandlerContext::new("s", "c", vec![json!({"name": "ada"})], 10);
        let out = SetHandler
            .execute(&ctx, &params(json!({"values": {"greeting": "hi"}})))
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"name": "ada", "greeting": "hi"})]);
    }

    #[tokio::test]
    async fn set_values_override_existing_fields() {
        let ctx = HandlerContext::new("s", "c", vec![json!({"greeting": "yo"})], 10);
        let out = SetHandler
            .execute(&ctx, &params(json!({"values": {"greeting": "hi"}})))
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"greeting": "hi"})]);
    }

    #[tokio::test]
    async fn keep_only_set_drops_item_fields() {
        let ctx = HandlerContext::new("s", "c", vec![json!({"a": 1}), json!({"b": 2})], 10);
        let out = SetHandler
            .execute(
                &ctx,
                &params(json!({"values": {"x": true}, "keepOnlySet": true})),
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"x": true}), json!({"x": true})]);
    }

    #[tokio::test]
    async fn empty_input_yields_one_item() {
        let ctx = HandlerContext::new("s", "c", Vec::new(), 10);
        let out = SetHandler
            .execute(&ctx, &params(json!({"values": {"greeting": "hi"}})))
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"greeting": "hi"})]);
    }

    #[tokio::test]
    async fn rejects_malformed_parameters() {
        let ctx = HandlerContext::new("s", "c", vec![json!({})], 10);
        let err = SetHandler
            .execute(&ctx, &params(json!({"values": [1, 2]})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn rejects_non_object_items() {
        let ctx = HandlerContext::new("s", "c", vec![json!(3)], 10);
        let err = SetHandler
            .execute(&ctx, &params(json!({"values": {"a": 1}})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }
}
