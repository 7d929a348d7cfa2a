use crate::domain::money::{Currency, Money};
use crate::domain::payment::{Payment, PaymentState};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Draft,
    Created,
    AwaitingPayment,
    Paid,
    PartiallyRefunded,
    Refunded,
    Failed,
    Cancelled,
}

impl OrderState {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::Draft => "draft",
            OrderState::Created => "created",
            OrderState::AwaitingPayment => "awaiting_payment",
            OrderState::Paid => "paid",
            OrderState::PartiallyRefunded => "partially_refunded",
            OrderState::Refunded => "refunded",
            OrderState::Failed => "failed",
            OrderState::Cancelled => "cancelled",
        }
    }

    /// Only created orders (or ones already awaiting a retry) may acquire payments.
    pub fn accepts_payments(self) -> bool {
        matches!(self, OrderState::Created | OrderState::AwaitingPayment)
    }

    pub fn accepts_refunds(self) -> bool {
        matches!(self, OrderState::Paid | OrderState::PartiallyRefunded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Refunded | OrderState::Failed | OrderState::Cancelled
        )
    }

    /// Forward reachability of the order lifecycle. Staying put is allowed.
    pub fn can_advance_to(self, next: OrderState) -> bool {
        use OrderState::*;
        if self == next {
            return true;
        }
        match self {
            Draft => next == Created,
            Created => matches!(
                next,
                AwaitingPayment | Paid | PartiallyRefunded | Refunded | Failed | Cancelled
            ),
            AwaitingPayment => matches!(
                next,
                Paid | PartiallyRefunded | Refunded | Failed | Cancelled
            ),
            Paid => matches!(next, PartiallyRefunded | Refunded),
            PartiallyRefunded => next == Refunded,
            Refunded | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One itemization line fixed when the order is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDescriptor {
    pub product: String,
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl LineDescriptor {
    pub fn line_total(&self) -> Result<Money> {
        self.unit_price.times(self.quantity)
    }
}

/// An unsaved order used for previews before it is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub id: OrderId,
    pub currency: Currency,
    pub lines: Vec<LineDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewLine {
    pub description: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub line_total: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderPreview {
    pub order: OrderId,
    pub lines: Vec<PreviewLine>,
    pub total: Money,
}

impl OrderDraft {
    /// Validates the draft and computes its totals without side effects.
    pub fn preview(&self) -> Result<OrderPreview> {
        if self.lines.is_empty() {
            return Err(PaymentError::ValidationError(format!(
                "order {} has no lines",
                self.id
            )));
        }

        let mut lines = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            if line.unit_price.currency() != self.currency {
                return Err(PaymentError::CurrencyMismatch {
                    expected: self.currency,
                    actual: line.unit_price.currency(),
                });
            }
            if line.quantity == 0 {
                return Err(PaymentError::ValidationError(format!(
                    "line `{}` has zero quantity",
                    line.product
                )));
            }
            if line.unit_price.amount().is_sign_negative() {
                return Err(PaymentError::ValidationError(format!(
                    "line `{}` has a negative unit price",
                    line.product
                )));
            }
            lines.push(PreviewLine {
                description: line.description.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
                line_total: line.line_total()?,
            });
        }

        let total = Money::sum(lines.iter().map(|l| l.line_total), self.currency)?;
        if !total.is_positive() {
            return Err(PaymentError::ValidationError(format!(
                "order {} total must be positive",
                self.id
            )));
        }

        Ok(OrderPreview {
            order: self.id,
            lines,
            total,
        })
    }

    /// Commits the draft into a created order.
    pub fn into_order(self, now: DateTime<Utc>) -> Result<Order> {
        let preview = self.preview()?;
        Ok(Order {
            id: self.id,
            state: OrderState::Created,
            total: preview.total,
            lines: self.lines,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Aggregate root of a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub state: OrderState,
    pub total: Money,
    pub lines: Vec<LineDescriptor>,
    /// Bumped by the store on every successful compare-and-swap.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn currency(&self) -> Currency {
        self.total.currency()
    }

    pub fn lines_total(&self) -> Result<Money> {
        self.lines
            .iter()
            .try_fold(Money::zero(self.currency()), |acc, line| {
                acc.checked_add(line.line_total()?)
            })
    }

    /// Whether the stored total still matches the line descriptors.
    pub fn is_consistent(&self) -> bool {
        self.lines_total().is_ok_and(|sum| sum == self.total)
    }

    /// Amount not yet claimed by a live (non-failed) payment.
    pub fn remaining_collectible(&self, payments: &[Payment]) -> Result<Money> {
        let totals = PaymentTotals::of(self.currency(), payments)?;
        let remaining = self.total.checked_sub(totals.reserved)?;
        if remaining.amount().is_sign_negative() {
            Ok(Money::zero(self.currency()))
        } else {
            Ok(remaining)
        }
    }

    /// Cancel is allowed before anything was authorized or collected, and
    /// while no payment has a gateway call in flight.
    pub fn can_cancel(&self, payments: &[Payment]) -> bool {
        self.state.accepts_payments()
            && payments.iter().all(|p| {
                !p.state.has_collected()
                    && p.state != PaymentState::Authorized
                    && p.pending_call.is_none()
            })
    }
}

/// Aggregated amounts over an order's payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentTotals {
    /// Sum of amounts of every payment that has not failed.
    pub reserved: Money,
    pub captured: Money,
    pub refunded: Money,
    pub open: usize,
    pub failed: usize,
}

impl PaymentTotals {
    pub fn of(currency: Currency, payments: &[Payment]) -> Result<Self> {
        let mut totals = PaymentTotals {
            reserved: Money::zero(currency),
            captured: Money::zero(currency),
            refunded: Money::zero(currency),
            open: 0,
            failed: 0,
        };
        for payment in payments {
            if payment.state == PaymentState::Failed {
                totals.failed += 1;
                continue;
            }
            totals.reserved = totals.reserved.checked_add(payment.amount)?;
            if payment.state.is_open() {
                totals.open += 1;
            }
            totals.captured = totals.captured.checked_add(payment.captured_amount())?;
            totals.refunded = totals.refunded.checked_add(payment.refunded_total()?)?;
        }
        Ok(totals)
    }
}

/// Derives the order state from its payments alone.
///
/// Pure: the same order state and payments always give the same answer, so
/// a retried recomputation converges.
pub fn derive_state(order: &Order, payments: &[Payment]) -> Result<OrderState> {
    if matches!(order.state, OrderState::Draft | OrderState::Cancelled) {
        return Ok(order.state);
    }

    let totals = PaymentTotals::of(order.currency(), payments)?;
    let derived = if totals.captured.is_positive() && totals.captured >= order.total {
        if totals.refunded.is_zero() {
            OrderState::Paid
        } else if totals.refunded >= totals.captured {
            OrderState::Refunded
        } else {
            OrderState::PartiallyRefunded
        }
    } else if payments.is_empty() {
        OrderState::Created
    } else if totals.captured.is_positive() || totals.open > 0 {
        OrderState::AwaitingPayment
    } else {
        OrderState::Failed
    };
    Ok(derived)
}
