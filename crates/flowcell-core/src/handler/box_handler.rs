//! BoxNodeHandler -- object-safe dynamic dispatch wrapper for NodeHandler.
//!
//! 1. Define an object-safe `NodeHandlerDyn` trait with boxed futures
//! 2. Blanket-impl `NodeHandlerDyn` for all `T: NodeHandler`
//! 3. `BoxNodeHandler` wraps `Box<dyn NodeHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use super::{HandlerContext, HandlerError, NodeHandler};

/// Object-safe version of [`NodeHandler`] with boxed futures.
pub trait NodeHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        parameters: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>, HandlerError>> + Send + 'a>>;
}

impl<T: NodeHandler> NodeHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        parameters: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Value>, HandlerError>> + Send + 'a>> {
        Box::pin(self.execute(ctx, parameters))
    }
}

/// Type-erased built-in handler, as stored in the handler registry.
pub struct BoxNodeHandler {
    inner: Box<dyn NodeHandlerDyn + Send + Sync>,
}

impl BoxNodeHandler {
    pub fn new<T: NodeHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn execute(
        &self,
        ctx: &HandlerContext,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<Value>, HandlerError> {
        self.inner.execute_boxed(ctx, parameters).await
    }
}

impl std::fmt::Debug for BoxNodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNodeHandler").finish_non_exhaustive()
    }
}
