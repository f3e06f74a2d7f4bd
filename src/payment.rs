use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::model::CloseReason;

#[derive(Debug, Clone)]
pub enum GatewayError {
    Declined(String),
    Timeout,
    Unavailable(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Declined(reason) => write!(f, "declined: {reason}"),
            GatewayError::Timeout => write!(f, "gateway timeout"),
            GatewayError::Unavailable(msg) => write!(f, "gateway unavailable: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Outbound side of the deposit payment provider.
///
/// Every call is keyed by deposit id so the provider can deduplicate retries.
/// Inbound success/failure events arrive through
/// `Engine::on_payment_succeeded` / `Engine::on_payment_failed`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open a payment session; returns the reference the client pays against.
    async fn create_intent(&self, deposit_id: Ulid, amount_cents: u64) -> Result<String, GatewayError>;

    async fn capture(&self, deposit_id: Ulid, amount_cents: u64) -> Result<(), GatewayError>;

    async fn refund(&self, deposit_id: Ulid, amount_cents: u64, reason: CloseReason) -> Result<(), GatewayError>;
}

/// Gateway that records calls in the log and always succeeds.
#[derive(Debug, Clone, Default)]
pub struct LoggingGateway;

#[async_trait]
impl PaymentGateway for LoggingGateway {
    async fn create_intent(&self, deposit_id: Ulid, amount_cents: u64) -> Result<String, GatewayError> {
        info!(%deposit_id, amount_cents, "deposit intent created");
        Ok(format!("dep_{deposit_id}"))
    }

    async fn capture(&self, deposit_id: Ulid, amount_cents: u64) -> Result<(), GatewayError> {
        info!(%deposit_id, amount_cents, "deposit captured");
        Ok(())
    }

    async fn refund(&self, deposit_id: Ulid, amount_cents: u64, reason: CloseReason) -> Result<(), GatewayError> {
        info!(%deposit_id, amount_cents, reason = reason.as_str(), "deposit refunded");
        Ok(())
    }
}
