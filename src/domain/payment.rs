use crate::domain::money::Money;
use crate::domain::order::OrderId;
use crate::error::PaymentError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub u64);

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable registry key of the processor that owns a payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessorKey(String);

impl ProcessorKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProcessorKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ProcessorKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied token; one payment per key per order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LEN: usize = 128;

    pub fn new(key: impl Into<String>) -> Result<Self, PaymentError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if key.len() > Self::MAX_LEN || key.chars().any(char::is_control) {
            return Err(PaymentError::ValidationError(format!(
                "idempotency key must be at most {} printable characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Authorized,
    Captured,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentState {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Authorized => "authorized",
            PaymentState::Captured => "captured",
            PaymentState::Failed => "failed",
            PaymentState::Refunded => "refunded",
            PaymentState::PartiallyRefunded => "partially_refunded",
        }
    }

    /// Funds reached the merchant at some point.
    pub fn has_collected(self) -> bool {
        matches!(
            self,
            PaymentState::Captured | PaymentState::PartiallyRefunded | PaymentState::Refunded
        )
    }

    /// Still waiting for the gateway to settle the collection.
    pub fn is_open(self) -> bool {
        matches!(self, PaymentState::Pending | PaymentState::Authorized)
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOperation {
    Initiate,
    Capture,
    Refund,
}

impl fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayOperation::Initiate => "initiate",
            GatewayOperation::Capture => "capture",
            GatewayOperation::Refund => "refund",
        })
    }
}

/// Marker for a gateway call that is in flight or whose outcome is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub operation: GatewayOperation,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialEventKind {
    Capture,
    Refund,
}

/// A completed movement of money on a payment; receipts are issued per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialEvent {
    /// `capture`, or `refund:<gateway refund id>`.
    pub id: String,
    pub kind: FinancialEventKind,
    pub amount: Money,
    pub occurred_at: DateTime<Utc>,
}

impl FinancialEvent {
    pub const CAPTURE_ID: &'static str = "capture";

    pub fn refund_id(refund_id: &str) -> String {
        format!("refund:{refund_id}")
    }
}

/// Requested change to a payment, from a callback or a synchronous gateway reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentTransition {
    Authorize,
    Capture,
    Fail { reason: String },
    Refund { refund_id: String, amount: Money },
}

impl PaymentTransition {
    pub fn name(&self) -> &'static str {
        match self {
            PaymentTransition::Authorize => "authorize",
            PaymentTransition::Capture => "capture",
            PaymentTransition::Fail { .. } => "fail",
            PaymentTransition::Refund { .. } => "refund",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEffect {
    Applied {
        from: PaymentState,
        to: PaymentState,
        event: Option<FinancialEvent>,
    },
    /// The payment already reflects this transition.
    AlreadyApplied { state: PaymentState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejected {
    #[error("cannot {attempted} a {from} payment")]
    Stale {
        from: PaymentState,
        attempted: &'static str,
    },
    #[error("refund of {requested} exceeds refundable {refundable}")]
    RefundExceeds { requested: Money, refundable: Money },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// One attempt to collect (and possibly refund) money for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub processor: ProcessorKey,
    pub state: PaymentState,
    pub amount: Money,
    pub external_reference: Option<String>,
    pub redirect_url: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub events: Vec<FinancialEvent>,
    pub pending_call: Option<PendingCall>,
    pub failure_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        id: PaymentId,
        order_id: OrderId,
        processor: ProcessorKey,
        amount: Money,
        idempotency_key: IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            order_id,
            processor,
            state: PaymentState::Pending,
            amount,
            external_reference: None,
            redirect_url: None,
            idempotency_key,
            events: Vec::new(),
            pending_call: None,
            failure_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn captured_amount(&self) -> Money {
        self.events
            .iter()
            .find(|e| e.kind == FinancialEventKind::Capture)
            .map(|e| e.amount)
            .unwrap_or_else(|| Money::zero(self.amount.currency()))
    }

    pub fn refunded_total(&self) -> Result<Money, PaymentError> {
        Money::sum(
            self.events
                .iter()
                .filter(|e| e.kind == FinancialEventKind::Refund)
                .map(|e| e.amount),
            self.amount.currency(),
        )
    }

    pub fn refundable(&self) -> Result<Money, PaymentError> {
        self.captured_amount().checked_sub(self.refunded_total()?)
    }

    pub fn event(&self, id: &str) -> Option<&FinancialEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Claims the payment for a gateway call; false when another call is
    /// already in flight or unresolved.
    pub fn begin_call(&mut self, operation: GatewayOperation, now: DateTime<Utc>) -> bool {
        if self.pending_call.is_some() {
            return false;
        }
        self.pending_call = Some(PendingCall {
            operation,
            started_at: now,
            timed_out: false,
        });
        true
    }

    pub fn finish_call(&mut self) {
        self.pending_call = None;
    }

    pub fn mark_call_timed_out(&mut self) {
        if let Some(call) = self.pending_call.as_mut() {
            call.timed_out = true;
        }
    }

    pub fn call_timed_out(&self) -> bool {
        self.pending_call
            .as_ref()
            .is_some_and(|call| call.timed_out)
    }

    /// Needs re-verification: a call timed out, or was left in flight longer
    /// than `grace` (e.g. the process died mid-call).
    pub fn is_ambiguous(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.pending_call
            .as_ref()
            .is_some_and(|call| call.timed_out || now - call.started_at > grace)
    }

    /// Applies a transition according to the payment lifecycle.
    pub fn apply(
        &mut self,
        transition: PaymentTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionEffect, TransitionRejected> {
        use PaymentState::*;
        let from = self.state;
        let attempted = transition.name();
        let stale = || TransitionRejected::Stale { from, attempted };

        let (to, event) = match transition {
            PaymentTransition::Authorize => match from {
                Pending => (Authorized, None),
                Authorized | Captured | PartiallyRefunded | Refunded => {
                    return Ok(TransitionEffect::AlreadyApplied { state: from });
                }
                Failed => return Err(stale()),
            },
            PaymentTransition::Capture => match from {
                Pending | Authorized => (
                    Captured,
                    Some(FinancialEvent {
                        id: FinancialEvent::CAPTURE_ID.to_string(),
                        kind: FinancialEventKind::Capture,
                        amount: self.amount,
                        occurred_at: now,
                    }),
                ),
                Captured | PartiallyRefunded | Refunded => {
                    return Ok(TransitionEffect::AlreadyApplied { state: from });
                }
                Failed => return Err(stale()),
            },
            PaymentTransition::Fail { reason } => match from {
                Pending | Authorized => {
                    self.failure_reason = Some(reason);
                    (Failed, None)
                }
                Failed => return Ok(TransitionEffect::AlreadyApplied { state: from }),
                Captured | PartiallyRefunded | Refunded => return Err(stale()),
            },
            PaymentTransition::Refund { refund_id, amount } => {
                let event_id = FinancialEvent::refund_id(&refund_id);
                if self.event(&event_id).is_some() {
                    return Ok(TransitionEffect::AlreadyApplied { state: from });
                }
                if !from.has_collected() {
                    return Err(stale());
                }
                if amount.currency() != self.amount.currency() || !amount.is_positive() {
                    return Err(TransitionRejected::InvalidAmount(amount.to_string()));
                }
                let refundable = self
                    .refundable()
                    .map_err(|e| TransitionRejected::InvalidAmount(e.to_string()))?;
                if amount > refundable {
                    return Err(TransitionRejected::RefundExceeds {
                        requested: amount,
                        refundable,
                    });
                }
                let to = if amount == refundable {
                    Refunded
                } else {
                    PartiallyRefunded
                };
                (
                    to,
                    Some(FinancialEvent {
                        id: event_id,
                        kind: FinancialEventKind::Refund,
                        amount,
                        occurred_at: now,
                    }),
                )
            }
        };

        // A definitive answer resolves the matching in-flight call.
        let resolves_call = match self.pending_call.as_ref().map(|c| c.operation) {
            Some(GatewayOperation::Refund) => to == Refunded || to == PartiallyRefunded,
            Some(_) => to != Refunded && to != PartiallyRefunded,
            None => false,
        };
        if resolves_call {
            self.pending_call = None;
        }

        if let Some(event) = event.clone() {
            self.events.push(event);
        }
        self.state = to;
        self.updated_at = now;
        Ok(TransitionEffect::Applied { from, to, event })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Currency;

    fn eur(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Eur)
    }

    fn pending(amount: i64) -> Payment {
        Payment::new(
            PaymentId(1),
            OrderId(1),
            ProcessorKey::from("gateway_a"),
            eur(amount),
            IdempotencyKey::new("attempt-1").unwrap(),
            Utc::now(),
        )
    }

    fn refund(id: &str, amount: i64) -> PaymentTransition {
        PaymentTransition::Refund {
            refund_id: id.to_string(),
            amount: eur(amount),
        }
    }

    #[test]
    fn test_idempotency_key_validation() {
        assert!(IdempotencyKey::new("abc").is_ok());
        assert!(IdempotencyKey::new("  ").is_err());
        assert!(IdempotencyKey::new("a".repeat(129)).is_err());
        assert!(IdempotencyKey::new("a\nb").is_err());
    }

    #[test]
    fn test_capture_records_event_once() {
        let mut payment = pending(10000);
        let effect = payment
            .apply(PaymentTransition::Capture, Utc::now())
            .unwrap();
        assert!(matches!(
            effect,
            TransitionEffect::Applied {
                from: PaymentState::Pending,
                to: PaymentState::Captured,
                event: Some(_)
            }
        ));

        let again = payment
            .apply(PaymentTransition::Capture, Utc::now())
            .unwrap();
        assert_eq!(
            again,
            TransitionEffect::AlreadyApplied {
                state: PaymentState::Captured
            }
        );
        assert_eq!(payment.events.len(), 1);
        assert_eq!(payment.captured_amount(), eur(10000));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut payment = pending(10000);
        payment
            .apply(PaymentTransition::Fail { reason: "declined".into() }, Utc::now())
            .unwrap();
        assert_eq!(payment.failure_reason.as_deref(), Some("declined"));
        assert!(matches!(
            payment.apply(PaymentTransition::Capture, Utc::now()),
            Err(TransitionRejected::Stale { .. })
        ));
    }

    #[test]
    fn test_late_authorization_after_capture_is_ignored() {
        let mut payment = pending(10000);
        payment
            .apply(PaymentTransition::Capture, Utc::now())
            .unwrap();
        assert!(matches!(
            payment.apply(PaymentTransition::Authorize, Utc::now()),
            Ok(TransitionEffect::AlreadyApplied { .. })
        ));
    }

    #[test]
    fn test_partial_then_full_refund() {
        let mut payment = pending(10000);
        payment
            .apply(PaymentTransition::Capture, Utc::now())
            .unwrap();

        payment.apply(refund("r1", 4000), Utc::now()).unwrap();
        assert_eq!(payment.state, PaymentState::PartiallyRefunded);
        assert_eq!(payment.refundable().unwrap(), eur(6000));

        // Same refund redelivered.
        assert!(matches!(
            payment.apply(refund("r1", 4000), Utc::now()),
            Ok(TransitionEffect::AlreadyApplied { .. })
        ));

        payment.apply(refund("r2", 6000), Utc::now()).unwrap();
        assert_eq!(payment.state, PaymentState::Refunded);
        assert_eq!(payment.refunded_total().unwrap(), eur(10000));
    }

    #[test]
    fn test_refund_guards() {
        let mut payment = pending(10000);
        assert!(matches!(
            payment.apply(refund("r1", 100), Utc::now()),
            Err(TransitionRejected::Stale { .. })
        ));

        payment
            .apply(PaymentTransition::Capture, Utc::now())
            .unwrap();
        assert!(matches!(
            payment.apply(refund("r1", 10001), Utc::now()),
            Err(TransitionRejected::RefundExceeds { .. })
        ));
        assert_eq!(payment.state, PaymentState::Captured);
    }

    #[test]
    fn test_pending_call_lifecycle() {
        let mut payment = pending(10000);
        let now = Utc::now();
        assert!(payment.begin_call(GatewayOperation::Initiate, now));
        assert!(!payment.begin_call(GatewayOperation::Capture, now));
        assert!(!payment.is_ambiguous(now, Duration::minutes(5)));

        payment.mark_call_timed_out();
        assert!(payment.is_ambiguous(now, Duration::minutes(5)));

        payment.apply(PaymentTransition::Capture, now).unwrap();
        assert!(payment.pending_call.is_none());
    }

    #[test]
    fn test_refund_resolves_refund_call() {
        let mut payment = pending(10000);
        let now = Utc::now();
        payment.apply(PaymentTransition::Capture, now).unwrap();
        payment.begin_call(GatewayOperation::Refund, now);
        payment.apply(refund("r1", 100), now).unwrap();
        assert!(payment.pending_call.is_none());
    }
}
