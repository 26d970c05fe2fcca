//! Execution dispatcher - invokes the registered handler for an
//! approved request
//!
//! Handlers are registered once per operation type at startup by the
//! external modules that own the privileged wrappers (user management,
//! cron management, ...). Registration is expected in lockstep with the
//! policy registry: every gated operation type gets a handler here. A
//! policy left without one is caught at dispatch time, not at request
//! creation, and lands as a terminal execution failure.
//!
//! The engine invokes a handler exactly once per approved request; a
//! failed execution is terminal and is never retried automatically.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors a handler may surface
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

/// Errors from the dispatcher itself
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No handler registered for operation type: {0}")]
    HandlerMissing(String),

    #[error("Handler already registered for operation type: {0}")]
    DuplicateHandler(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// A capability that executes one operation type's privileged action
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Handler name for logging/debugging
    fn name(&self) -> &str;

    /// Run the privileged action for the given opaque payload
    ///
    /// Returns a structured result on success; any error becomes the
    /// terminal `execution_failed` outcome of the request.
    async fn execute(&self, payload: &Value) -> Result<Value, HandlerError>;
}

/// Typed map from operation type to its handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an operation type (startup only)
    pub fn register(
        &mut self,
        operation_type: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<(), DispatchError> {
        let operation_type = operation_type.into();
        if self.handlers.contains_key(&operation_type) {
            return Err(DispatchError::DuplicateHandler(operation_type));
        }

        tracing::debug!(
            operation_type = %operation_type,
            handler = handler.name(),
            "Registered operation handler"
        );
        self.handlers.insert(operation_type, handler);
        Ok(())
    }

    /// Look up the handler for an operation type
    pub fn lookup(&self, operation_type: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation_type).cloned()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Invokes handlers for approved requests
pub struct ExecutionDispatcher {
    registry: HandlerRegistry,
}

impl ExecutionDispatcher {
    /// Create a dispatcher over a populated handler registry
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Invoke the handler for the given operation type exactly once
    pub async fn dispatch(
        &self,
        operation_type: &str,
        payload: &Value,
    ) -> Result<Value, DispatchError> {
        let handler = self
            .registry
            .lookup(operation_type)
            .ok_or_else(|| DispatchError::HandlerMissing(operation_type.to_string()))?;

        tracing::info!(
            operation_type = %operation_type,
            handler = handler.name(),
            "Dispatching approved request"
        );

        match handler.execute(payload).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::error!(
                    operation_type = %operation_type,
                    handler = handler.name(),
                    error = %e,
                    "Handler execution failed"
                );
                Err(e.into())
            }
        }
    }
}

/// A handler that does nothing and reports success (for testing)
pub struct NoOpHandler;

#[async_trait]
impl OperationHandler for NoOpHandler {
    fn name(&self) -> &str {
        "NoOpHandler"
    }

    async fn execute(&self, _payload: &Value) -> Result<Value, HandlerError> {
        Ok(serde_json::json!({"status": "ok"}))
    }
}
