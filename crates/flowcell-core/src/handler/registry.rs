//! Trusted handler registry.
//!
//! A name-indexed registry of built-in node handlers. It is populated once
//! by the bootstrap and then shared read-only by the executor; duplicate
//! registration is an initialization-time fatal error.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::box_handler::BoxNodeHandler;
use super::{HandlerContext, HandlerError, NodeHandler};

/// Errors raised while populating the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node type '{0}' is already registered")]
    Duplicate(String),

    #[error("node type name must not be empty")]
    EmptyNodeType,
}

/// Errors raised by [`HandlerRegistry::dispatch`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown node type '{0}'")]
    UnknownNodeType(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Registry of built-in node handlers, indexed by node type.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxNodeHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `node_type`.
    ///
    /// Fails if the node type is already registered; callers at startup
    /// should treat that as fatal.
    pub fn register(
        &mut self,
        node_type: impl Into<String>,
        handler: impl NodeHandler + 'static,
    ) -> Result<(), RegistryError> {
        let node_type = node_type.into();
        if node_type.is_empty() {
            return Err(RegistryError::EmptyNodeType);
        }
        if self.handlers.contains_key(&node_type) {
            return Err(RegistryError::Duplicate(node_type));
        }
        tracing::debug!(node_type = %node_type, "registered built-in handler");
        self.handlers.insert(node_type, BoxNodeHandler::new(handler));
        Ok(())
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn node_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered for `node_type`.
    pub async fn dispatch(
        &self,
        node_type: &str,
        ctx: &HandlerContext,
        parameters: &Map<String, Value>,
    ) -> Result<Vec<Value>, DispatchError> {
        let handler = self
            .handlers
            .get(node_type)
            .ok_or_else(|| DispatchError::UnknownNodeType(node_type.to_string()))?;
        Ok(handler.execute(ctx, parameters).await?)
    }
}
