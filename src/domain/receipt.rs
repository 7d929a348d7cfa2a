use crate::domain::money::Money;
use crate::domain::order::OrderId;
use crate::domain::payment::{FinancialEventKind, PaymentId};
use crate::error::PaymentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptId(pub u64);

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable link from a payment's financial event to its receipt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub payment_id: PaymentId,
    pub event_id: String,
}

impl EventRef {
    pub fn new(payment_id: PaymentId, event_id: impl Into<String>) -> Self {
        Self {
            payment_id,
            event_id: event_id.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{:020}:{}", self.payment_id.0, self.event_id)
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payment {} event {}", self.payment_id, self.event_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Sale,
    Refund,
}

impl From<FinancialEventKind> for ReceiptKind {
    fn from(kind: FinancialEventKind) -> Self {
        match kind {
            FinancialEventKind::Capture => ReceiptKind::Sale,
            FinancialEventKind::Refund => ReceiptKind::Refund,
        }
    }
}

impl fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReceiptKind::Sale => "sale",
            ReceiptKind::Refund => "refund",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemV2 {
    pub description: String,
    pub unit_amount: Money,
    pub quantity: u32,
    pub total: Money,
}

impl LineItemV2 {
    pub fn new(
        description: impl Into<String>,
        unit_amount: Money,
        quantity: u32,
    ) -> Result<Self, PaymentError> {
        Ok(Self {
            description: description.into(),
            unit_amount,
            quantity,
            total: unit_amount.times(quantity)?,
        })
    }

    pub fn is_consistent(&self) -> bool {
        self.unit_amount
            .times(self.quantity)
            .is_ok_and(|total| total == self.total)
    }
}

/// A receipt before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDraft {
    pub event: EventRef,
    pub order_id: OrderId,
    pub kind: ReceiptKind,
    pub total: Money,
    pub line_items: Vec<LineItemV2>,
    pub issued_at: DateTime<Utc>,
}

impl ReceiptDraft {
    pub fn with_id(self, id: ReceiptId) -> Receipt {
        Receipt {
            id,
            event: self.event,
            order_id: self.order_id,
            kind: self.kind,
            total: self.total,
            line_items: self.line_items,
            issued_at: self.issued_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub event: EventRef,
    pub order_id: OrderId,
    pub kind: ReceiptKind,
    pub total: Money,
    pub line_items: Vec<LineItemV2>,
    pub issued_at: DateTime<Utc>,
}

impl Receipt {
    pub fn line_items_total(&self) -> Option<Money> {
        Money::sum(
            self.line_items.iter().map(|item| item.total),
            self.total.currency(),
        )
        .ok()
    }
}
