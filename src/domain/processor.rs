use crate::domain::callback::{CallbackRejection, VerifiedEvent};
use crate::domain::money::{Currency, Money};
use crate::domain::order::OrderId;
use crate::domain::payment::{Payment, ProcessorKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    /// Synchronous authorization, captured immediately by the engine.
    Card,
    /// Buyer is sent to the gateway; the outcome arrives by callback.
    Redirect,
}

impl fmt::Display for PaymentMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentMethodKind::Card => "card",
            PaymentMethodKind::Redirect => "redirect",
        })
    }
}

/// Order data a gateway needs to start a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderContext {
    pub order_id: OrderId,
    pub total: Money,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayHandle {
    Authorized { reference: String },
    Captured { reference: String },
    Redirect { reference: String, url: String },
    Declined { reference: Option<String>, reason: String },
}

impl GatewayHandle {
    pub fn reference(&self) -> Option<&str> {
        match self {
            GatewayHandle::Authorized { reference }
            | GatewayHandle::Captured { reference }
            | GatewayHandle::Redirect { reference, .. } => Some(reference),
            GatewayHandle::Declined { reference, .. } => reference.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured,
    Pending,
    Declined { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Succeeded { refund_id: String },
    Pending { refund_id: String },
    Declined { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Unknown,
    Pending,
    Authorized,
    Captured,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRefund {
    pub refund_id: String,
    pub amount: Money,
}

/// Authoritative gateway view of a payment, used for re-verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatus {
    pub reference: Option<String>,
    pub state: RemoteState,
    pub refunds: Vec<RemoteRefund>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Transient network or 5xx failure; safe to retry.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// No answer in time; the call may or may not have taken effect.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Capabilities every gateway integration provides.
///
/// Implementations pass the payment id (or refund key) to the gateway as its
/// idempotency token wherever the gateway supports one.
#[async_trait]
pub trait Processor: Send + Sync {
    fn key(&self) -> &ProcessorKey;

    fn method(&self) -> PaymentMethodKind;

    fn supports(&self, currency: Currency) -> bool;

    async fn initiate(
        &self,
        payment: &Payment,
        order: &OrderContext,
    ) -> Result<GatewayHandle, GatewayError>;

    async fn capture(&self, payment: &Payment) -> Result<CaptureOutcome, GatewayError>;

    async fn refund(
        &self,
        payment: &Payment,
        amount: Money,
        refund_key: &str,
    ) -> Result<RefundOutcome, GatewayError>;

    async fn status(&self, payment: &Payment) -> Result<GatewayStatus, GatewayError>;

    /// Checks authenticity and parses the gateway-specific payload.
    fn verify_callback(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<VerifiedEvent, CallbackRejection>;
}

pub type ProcessorRef = Arc<dyn Processor>;
