//! Tool dispatch: the seam between the harness/runner and the primary
//! operations.

use std::collections::HashMap;
use std::pin::Pin;

use serde_json::Value;

use crate::config::Config;
use crate::error::Result;
use crate::error::RyeErr;
use crate::executor::PrimitiveExecutor;
use crate::items;
use crate::spaces::ItemType;

/// One primary-tool invocation: `execute`, `search`, `load`, or `sign`.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub primary: String,
    pub item_type: String,
    pub item_id: String,
    pub params: Value,
}

impl DispatchRequest {
    pub fn execute_tool(item_id: impl Into<String>, params: Value) -> Self {
        Self {
            primary: "execute".to_string(),
            item_type: "tool".to_string(),
            item_id: item_id.into(),
            params,
        }
    }
}

/// Dispatches primary-tool calls. Hooks and the runner both route through
/// this trait so tests can substitute recording fakes.
pub trait ToolDispatcher: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        request: DispatchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;
}

/// The production dispatcher: routes `execute tool` through the primitive
/// executor and the other primaries through the item operations.
pub struct RyeDispatcher {
    executor: PrimitiveExecutor,
}

impl RyeDispatcher {
    pub fn new(executor: PrimitiveExecutor) -> Self {
        Self { executor }
    }

    pub fn config(&self) -> &Config {
        self.executor.config()
    }

    pub fn executor(&self) -> &PrimitiveExecutor {
        &self.executor
    }

    async fn dispatch_inner(&self, request: DispatchRequest) -> Result<Value> {
        let config = self.executor.config();
        let item_type = ItemType::parse(&request.item_type).ok_or_else(|| RyeErr::Validation {
            issues: vec![format!("unknown item type '{}'", request.item_type)],
        })?;

        match request.primary.as_str() {
            "execute" => match item_type {
                ItemType::Tool => {
                    let result = self.executor.execute(&request.item_id, &request.params).await?;
                    Ok(result.to_json(&request.item_id))
                }
                ItemType::Directive => {
                    let params: HashMap<String, Value> = request
                        .params
                        .as_object()
                        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                        .unwrap_or_default();
                    items::execute_directive_inline(config, &request.item_id, &params)
                }
                ItemType::Knowledge => items::load_item(config, item_type, &request.item_id),
            },
            "load" => items::load_item(config, item_type, &request.item_id),
            "search" => {
                let query = request
                    .params
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or("*");
                let hits = items::search(config, item_type, query);
                Ok(serde_json::json!({
                    "status": "success",
                    "count": hits.len(),
                    "results": hits,
                }))
            }
            "sign" => items::sign_item(config, self.executor.keypair(), item_type, &request.item_id),
            other => Err(RyeErr::Validation {
                issues: vec![format!("unknown primary '{other}'")],
            }),
        }
    }
}

impl ToolDispatcher for RyeDispatcher {
    fn dispatch<'a>(
        &'a self,
        request: DispatchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(self.dispatch_inner(request))
    }
}
