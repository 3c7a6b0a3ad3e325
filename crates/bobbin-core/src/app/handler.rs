//! Handler trait: executes one claimed record.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Record;

/// Failure reported by a handler. The message becomes the record's
/// `failure_message`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Handler runs the business logic for one record.
///
/// The worker may abort the returned future at any `.await` point when the
/// store says the record is no longer ours, so handlers should not rely on
/// running to completion.
///
/// # Example
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Handler<JobRecord<String>> for Echo {
///     async fn handle(&self, record: JobRecord<String>) -> Result<(), HandlerError> {
///         println!("{}", record.payload);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<R: Record>: Send + Sync + 'static {
    async fn handle(&self, record: R) -> Result<(), HandlerError>;
}
