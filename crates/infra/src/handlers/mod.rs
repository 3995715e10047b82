//! Job handlers and their registry.
//!
//! A handler executes one kind of job. The worker pool looks the handler
//! up by the job's kind string; a job whose kind has no handler fails
//! like any other handler error and consumes a retry attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use jobflow_core::Job;

mod builtin;

pub use builtin::{EmailConfirmationHandler, PaymentProcessHandler};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for job kind {0}")]
    UnknownKind(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Business logic for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The kind string this handler serves.
    fn kind(&self) -> &str;

    async fn execute(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Kind-to-handler dispatch table, fixed at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in handlers.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PaymentProcessHandler::new()));
        registry.register(Arc::new(EmailConfirmationHandler::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Dispatch the job to its handler.
    pub async fn dispatch(&self, job: &Job) -> Result<(), HandlerError> {
        match self.get(job.kind.as_str()) {
            Some(handler) => handler.execute(job).await,
            None => Err(HandlerError::UnknownKind(job.kind.as_str().to_string())),
        }
    }

    pub fn registered_kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
