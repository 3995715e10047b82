//! Built-in handlers for the two stock job kinds.
//!
//! Both simulate their downstream call with a configurable delay so the
//! pipeline can be exercised end to end without external systems. Tests
//! set the delay to zero.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use jobflow_core::{Job, JobKind};

use super::{HandlerError, JobHandler};

const DEFAULT_PAYMENT_LATENCY: Duration = Duration::from_secs(2);
const DEFAULT_EMAIL_LATENCY: Duration = Duration::from_secs(1);

pub struct PaymentProcessHandler {
    latency: Duration,
}

impl Default for PaymentProcessHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentProcessHandler {
    pub fn new() -> Self {
        Self {
            latency: DEFAULT_PAYMENT_LATENCY,
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl JobHandler for PaymentProcessHandler {
    fn kind(&self) -> &str {
        JobKind::PaymentProcess.as_str()
    }

    async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        info!(job_id = %job.id, client_id = %job.client_id, "processing payment");
        tokio::time::sleep(self.latency).await;
        info!(job_id = %job.id, "payment processed");
        Ok(())
    }
}

pub struct EmailConfirmationHandler {
    latency: Duration,
}

impl Default for EmailConfirmationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailConfirmationHandler {
    pub fn new() -> Self {
        Self {
            latency: DEFAULT_EMAIL_LATENCY,
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl JobHandler for EmailConfirmationHandler {
    fn kind(&self) -> &str {
        JobKind::EmailConfirmation.as_str()
    }

    async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        info!(job_id = %job.id, client_id = %job.client_id, "sending confirmation email");
        tokio::time::sleep(self.latency).await;
        info!(job_id = %job.id, "confirmation email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::ClientId;

    #[tokio::test]
    async fn builtin_handlers_succeed() {
        let payment = PaymentProcessHandler::with_latency(Duration::ZERO);
        let email = EmailConfirmationHandler::with_latency(Duration::ZERO);

        let job = Job::new(ClientId::from("c1"), JobKind::PaymentProcess, "{}");
        assert!(payment.execute(&job).await.is_ok());

        let job = Job::new(ClientId::from("c1"), JobKind::EmailConfirmation, "{}");
        assert!(email.execute(&job).await.is_ok());
    }
}
