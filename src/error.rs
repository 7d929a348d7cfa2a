use crate::domain::money::{Currency, Money};
use crate::domain::order::{OrderId, OrderState};
use crate::domain::payment::{GatewayOperation, PaymentId, PaymentState};
use crate::domain::receipt::EventRef;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("processor `{0}` is not registered")]
    InvalidProcessor(String),
    #[error("order {order}: requested {requested} exceeds remaining collectible {remaining}")]
    AmountExceeded {
        order: OrderId,
        requested: Money,
        remaining: Money,
    },
    #[error("callback from `{gateway}` references unknown payment `{reference}`")]
    OrphanCallback { gateway: String, reference: String },
    #[error("callback from `{gateway}` rejected: {reason}")]
    RejectedCallback { gateway: String, reason: String },
    #[error("{operation} on payment {payment} timed out; outcome unknown")]
    AmbiguousGatewayOutcome {
        payment: PaymentId,
        operation: GatewayOperation,
    },
    #[error("receipt for {event} does not reconcile: expected {expected}, line items sum to {actual}")]
    ReconciliationError {
        event: EventRef,
        expected: Money,
        actual: String,
    },
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("gateway declined: {0}")]
    GatewayDeclined(String),
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
    #[error("order {0} already exists")]
    OrderExists(OrderId),
    #[error("payment {0} not found")]
    PaymentNotFound(PaymentId),
    #[error("order {order} is {state} and cannot {action}")]
    InvalidOrderState {
        order: OrderId,
        state: OrderState,
        action: &'static str,
    },
    #[error("payment {payment} is {state} and cannot {action}")]
    InvalidPaymentState {
        payment: PaymentId,
        state: PaymentState,
        action: &'static str,
    },
    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },
    #[error("processor `{processor}` does not support {currency}")]
    UnsupportedCurrency {
        processor: String,
        currency: Currency,
    },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("concurrent update conflict on {0}")]
    Conflict(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(err: rocksdb::Error) -> Self {
        PaymentError::InternalError(Box::new(err))
    }
}

impl PaymentError {
    /// Storage-level failures; everything else is a business outcome.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            PaymentError::InternalError(_)
                | PaymentError::IoError(_)
                | PaymentError::JsonError(_)
                | PaymentError::Conflict(_)
        )
    }
}

pub type Result<T, E = PaymentError> = std::result::Result<T, E>;
