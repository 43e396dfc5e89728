//! Server-side dispatch of named operations.
//!
//! The delivery loop hands every inbound Request to a [`Dispatch`]
//! implementation. [`OperationRegistry`] is the stock implementation: a table
//! from operation name to handler, with a typed JSON convenience layer.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Error raised by a dispatched operation. Its text travels back to the
/// caller inside an Exception message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

/// Resolves an operation name to behavior on the receiving agent.
///
/// Called synchronously on the agent's delivery loop, so implementations must
/// not block indefinitely; long-running work should be handed off internally.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, operation: &str, payload: Bytes) -> Result<Bytes, DispatchError>;
}

impl<F> Dispatch for F
where
    F: Fn(&str, Bytes) -> Result<Bytes, DispatchError> + Send + Sync + 'static,
{
    fn dispatch(&self, operation: &str, payload: Bytes) -> Result<Bytes, DispatchError> {
        self(operation, payload)
    }
}

type Handler = Arc<dyn Fn(Bytes) -> Result<Bytes, DispatchError> + Send + Sync>;

/// Name → handler table.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("OperationRegistry")
            .field("operations", &names)
            .finish()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler, replacing any previous one with the same name.
    pub fn register<F>(&mut self, operation: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Bytes) -> Result<Bytes, DispatchError> + Send + Sync + 'static,
    {
        self.handlers.insert(operation.into(), Arc::new(handler));
        self
    }

    /// Register a handler whose payloads are JSON documents.
    pub fn register_json<Req, Resp, F>(&mut self, operation: impl Into<String>, handler: F) -> &mut Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req) -> Result<Resp, DispatchError> + Send + Sync + 'static,
    {
        self.register(operation, move |payload: Bytes| {
            let request: Req = serde_json::from_slice(&payload)
                .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
            let response = handler(request)?;
            serde_json::to_vec(&response)
                .map(Bytes::from)
                .map_err(|e| DispatchError::Failed(format!("failed to encode reply: {}", e)))
        })
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Dispatch for OperationRegistry {
    fn dispatch(&self, operation: &str, payload: Bytes) -> Result<Bytes, DispatchError> {
        match self.handlers.get(operation) {
            Some(handler) => handler(payload),
            None => Err(DispatchError::UnknownOperation(operation.to_string())),
        }
    }
}
