use super::callback::{CallbackRecord, DedupKey};
use super::money::Money;
use super::order::{Order, OrderId};
use super::payment::{IdempotencyKey, Payment, PaymentId, ProcessorKey};
use super::receipt::{EventRef, Receipt, ReceiptDraft};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Fails with `OrderExists` when the id is taken.
    async fn insert(&self, order: Order) -> Result<()>;
    async fn get(&self, id: OrderId) -> Result<Option<Order>>;
    /// Writes `order` with its version bumped if the stored version still
    /// equals `order.version`. Returns the stored order, or `None` on conflict.
    async fn compare_and_swap(&self, order: Order) -> Result<Option<Order>>;
    async fn all(&self) -> Result<Vec<Order>>;
}

/// Everything needed to create a payment; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: OrderId,
    pub processor: ProcessorKey,
    pub amount: Money,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Created(Payment),
    /// A payment with the same idempotency key already existed.
    Existing(Payment),
}

impl Reservation {
    pub fn payment(&self) -> &Payment {
        match self {
            Reservation::Created(p) | Reservation::Existing(p) => p,
        }
    }

    pub fn into_payment(self) -> Payment {
        match self {
            Reservation::Created(p) | Reservation::Existing(p) => p,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackCommit {
    Committed(Option<Payment>),
    /// An applied record for the same dedup key exists; nothing was written.
    Duplicate,
    /// The payment changed since it was read; nothing was written.
    Conflict,
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Atomically returns the payment already holding `idempotency_key` for
    /// the order, or creates one if the order's live payments plus the new
    /// amount stay within `order_total` (else `AmountExceeded`).
    async fn reserve(&self, payment: NewPayment, order_total: Money) -> Result<Reservation>;
    async fn get(&self, id: PaymentId) -> Result<Option<Payment>>;
    async fn find_by_reference(
        &self,
        processor: &ProcessorKey,
        reference: &str,
    ) -> Result<Option<Payment>>;
    async fn for_order(&self, order_id: OrderId) -> Result<Vec<Payment>>;
    /// Same contract as `OrderStore::compare_and_swap`; also indexes the
    /// external reference once assigned.
    async fn compare_and_swap(&self, payment: Payment) -> Result<Option<Payment>>;
    async fn all(&self) -> Result<Vec<Payment>>;

    async fn applied_callback(&self, key: &DedupKey) -> Result<Option<CallbackRecord>>;
    /// Appends `record` and, when given, swaps in the updated payment, as one
    /// atomic unit. Applied records are refused if their dedup key already
    /// has an applied record. A parked record stays pending until a later
    /// record with the same dedup key settles it.
    async fn commit_callback(
        &self,
        record: CallbackRecord,
        payment: Option<Payment>,
    ) -> Result<CallbackCommit>;
    async fn callbacks(&self) -> Result<Vec<CallbackRecord>>;
    /// Pending parked records, oldest first, one per dedup key.
    async fn parked_callbacks(&self) -> Result<Vec<CallbackRecord>>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Stores the receipt unless one exists for the same event. Returns the
    /// stored receipt and whether it was created by this call.
    async fn insert_if_absent(&self, receipt: ReceiptDraft) -> Result<(Receipt, bool)>;
    async fn find_by_event(&self, event: &EventRef) -> Result<Option<Receipt>>;
    async fn for_payment(&self, payment_id: PaymentId) -> Result<Vec<Receipt>>;
    async fn all(&self) -> Result<Vec<Receipt>>;
}

pub type OrderStoreRef = Arc<dyn OrderStore>;
pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type ReceiptStoreRef = Arc<dyn ReceiptStore>;
