use crate::domain::callback::{CallbackRecord, DedupKey};
use crate::domain::money::Money;
use crate::domain::order::{Order, OrderId};
use crate::domain::payment::{Payment, PaymentId, PaymentState, ProcessorKey};
use crate::domain::ports::{
    CallbackCommit, NewPayment, OrderStore, PaymentStore, ReceiptStore, Reservation,
};
use crate::domain::receipt::{EventRef, Receipt, ReceiptDraft, ReceiptId};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for orders.
///
/// Ideal for testing or single-run replays where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<BTreeMap<OrderId, Order>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(PaymentError::OrderExists(order.id));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.get(&id).cloned())
    }

    async fn compare_and_swap(&self, mut order: Order) -> Result<Option<Order>> {
        let mut orders = self.orders.write().await;
        match orders.get(&order.id) {
            Some(current) if current.version == order.version => {
                order.version += 1;
                orders.insert(order.id, order.clone());
                Ok(Some(order))
            }
            Some(_) => Ok(None),
            None => Err(PaymentError::OrderNotFound(order.id)),
        }
    }

    async fn all(&self) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.values().cloned().collect())
    }
}

#[derive(Default)]
struct PaymentLedger {
    next_id: u64,
    payments: BTreeMap<PaymentId, Payment>,
    by_key: HashMap<(OrderId, String), PaymentId>,
    by_reference: HashMap<(ProcessorKey, String), PaymentId>,
    callbacks: Vec<CallbackRecord>,
    applied: HashMap<String, usize>,
    parked: HashMap<String, usize>,
}

impl PaymentLedger {
    fn swap(&mut self, mut payment: Payment) -> Result<Option<Payment>> {
        let current = self
            .payments
            .get(&payment.id)
            .ok_or(PaymentError::PaymentNotFound(payment.id))?;
        if current.version != payment.version {
            return Ok(None);
        }
        payment.version += 1;
        if let Some(reference) = &payment.external_reference {
            self.by_reference
                .insert((payment.processor.clone(), reference.clone()), payment.id);
        }
        self.payments.insert(payment.id, payment.clone());
        Ok(Some(payment))
    }
}

/// A thread-safe in-memory store for payments and their callback journal.
///
/// Payments and callback records live behind one lock so a payment update
/// and its applied record become visible together.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    ledger: Arc<RwLock<PaymentLedger>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn reserve(&self, new: NewPayment, order_total: Money) -> Result<Reservation> {
        let mut ledger = self.ledger.write().await;
        let key = (new.order_id, new.idempotency_key.as_str().to_string());
        if let Some(id) = ledger.by_key.get(&key)
            && let Some(existing) = ledger.payments.get(id)
        {
            return Ok(Reservation::Existing(existing.clone()));
        }

        let reserved = Money::sum(
            ledger
                .payments
                .values()
                .filter(|p| p.order_id == new.order_id && p.state != PaymentState::Failed)
                .map(|p| p.amount),
            order_total.currency(),
        )?;
        let remaining = order_total.checked_sub(reserved)?;
        if new.amount > remaining {
            return Err(PaymentError::AmountExceeded {
                order: new.order_id,
                requested: new.amount,
                remaining,
            });
        }

        ledger.next_id += 1;
        let id = PaymentId(ledger.next_id);
        let payment = Payment::new(
            id,
            new.order_id,
            new.processor,
            new.amount,
            new.idempotency_key,
            new.created_at,
        );
        ledger.by_key.insert(key, id);
        ledger.payments.insert(id, payment.clone());
        Ok(Reservation::Created(payment))
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.payments.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        processor: &ProcessorKey,
        reference: &str,
    ) -> Result<Option<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .by_reference
            .get(&(processor.clone(), reference.to_string()))
            .and_then(|id| ledger.payments.get(id))
            .cloned())
    }

    async fn for_order(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn compare_and_swap(&self, payment: Payment) -> Result<Option<Payment>> {
        let mut ledger = self.ledger.write().await;
        ledger.swap(payment)
    }

    async fn all(&self) -> Result<Vec<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.payments.values().cloned().collect())
    }

    async fn applied_callback(&self, key: &DedupKey) -> Result<Option<CallbackRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .applied
            .get(&key.storage_key())
            .and_then(|index| ledger.callbacks.get(*index))
            .cloned())
    }

    async fn commit_callback(
        &self,
        record: CallbackRecord,
        payment: Option<Payment>,
    ) -> Result<CallbackCommit> {
        let mut ledger = self.ledger.write().await;
        let applied_key = match (&record.dedup_key, record.is_applied()) {
            (Some(key), true) => {
                let key = key.storage_key();
                if ledger.applied.contains_key(&key) {
                    return Ok(CallbackCommit::Duplicate);
                }
                Some(key)
            }
            _ => None,
        };

        let stored = match payment {
            Some(payment) => match ledger.swap(payment)? {
                Some(stored) => Some(stored),
                None => return Ok(CallbackCommit::Conflict),
            },
            None => None,
        };

        let index = ledger.callbacks.len();
        if let Some(key) = &record.dedup_key {
            let key = key.storage_key();
            if record.is_parked() {
                ledger.parked.entry(key).or_insert(index);
            } else {
                ledger.parked.remove(&key);
            }
        }
        ledger.callbacks.push(record);
        if let Some(key) = applied_key {
            ledger.applied.insert(key, index);
        }
        Ok(CallbackCommit::Committed(stored))
    }

    async fn callbacks(&self) -> Result<Vec<CallbackRecord>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.callbacks.clone())
    }

    async fn parked_callbacks(&self) -> Result<Vec<CallbackRecord>> {
        let ledger = self.ledger.read().await;
        let mut indexes: Vec<usize> = ledger.parked.values().copied().collect();
        indexes.sort_unstable();
        Ok(indexes
            .into_iter()
            .filter_map(|index| ledger.callbacks.get(index).cloned())
            .collect())
    }
}

#[derive(Default)]
struct ReceiptBook {
    next_id: u64,
    receipts: BTreeMap<String, Receipt>,
}

/// A thread-safe in-memory store for receipts, keyed by financial event.
#[derive(Default, Clone)]
pub struct InMemoryReceiptStore {
    book: Arc<RwLock<ReceiptBook>>,
}

impl InMemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReceiptStore for InMemoryReceiptStore {
    async fn insert_if_absent(&self, draft: ReceiptDraft) -> Result<(Receipt, bool)> {
        let mut book = self.book.write().await;
        let key = draft.event.storage_key();
        if let Some(existing) = book.receipts.get(&key) {
            return Ok((existing.clone(), false));
        }
        book.next_id += 1;
        let receipt = draft.with_id(ReceiptId(book.next_id));
        book.receipts.insert(key, receipt.clone());
        Ok((receipt, true))
    }

    async fn find_by_event(&self, event: &EventRef) -> Result<Option<Receipt>> {
        let book = self.book.read().await;
        Ok(book.receipts.get(&event.storage_key()).cloned())
    }

    async fn for_payment(&self, payment_id: PaymentId) -> Result<Vec<Receipt>> {
        let book = self.book.read().await;
        Ok(book
            .receipts
            .values()
            .filter(|r| r.event.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<Receipt>> {
        let book = self.book.read().await;
        let mut receipts: Vec<Receipt> = book.receipts.values().cloned().collect();
        receipts.sort_by_key(|r| r.id);
        Ok(receipts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::callback::{CallbackOutcome, GatewayEventKind, VerifiedEvent};
    use crate::domain::money::Currency;
    use crate::domain::order::{LineDescriptor, OrderDraft};
    use crate::domain::payment::{IdempotencyKey, PaymentTransition};
    use crate::domain::receipt::{LineItemV2, ReceiptKind};
    use chrono::Utc;

    fn eur(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Eur)
    }

    fn new_payment(key: &str, amount: i64) -> NewPayment {
        NewPayment {
            order_id: OrderId(1),
            processor: ProcessorKey::from("gateway_a"),
            amount: eur(amount),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
            created_at: Utc::now(),
        }
    }

    fn order() -> Order {
        OrderDraft {
            id: OrderId(1),
            currency: Currency::Eur,
            lines: vec![LineDescriptor {
                product: "sku-1".into(),
                description: "Tea".into(),
                quantity: 1,
                unit_price: eur(10000),
            }],
        }
        .into_order(Utc::now())
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_order_store_cas() {
        let store = InMemoryOrderStore::new();
        store.insert(order()).await.unwrap();
        assert!(matches!(
            store.insert(order()).await,
            Err(PaymentError::OrderExists(_))
        ));

        let current = store.get(OrderId(1)).await.unwrap().unwrap();
        let stored = store
            .compare_and_swap(current.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);

        // Stale version loses.
        assert!(store.compare_and_swap(current).await.unwrap().is_none());
        assert!(store.get(OrderId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_and_bounded() {
        let store = InMemoryPaymentStore::new();
        let first = store
            .reserve(new_payment("k1", 6000), eur(10000))
            .await
            .unwrap();
        assert!(matches!(first, Reservation::Created(_)));

        let again = store
            .reserve(new_payment("k1", 6000), eur(10000))
            .await
            .unwrap();
        assert_eq!(again, Reservation::Existing(first.payment().clone()));

        let too_much = store.reserve(new_payment("k2", 5000), eur(10000)).await;
        assert!(matches!(too_much, Err(PaymentError::AmountExceeded { .. })));

        let fits = store
            .reserve(new_payment("k3", 4000), eur(10000))
            .await
            .unwrap();
        assert_eq!(fits.payment().id, PaymentId(2));
    }

    #[tokio::test]
    async fn test_reference_index_follows_cas() {
        let store = InMemoryPaymentStore::new();
        let mut payment = store
            .reserve(new_payment("k1", 10000), eur(10000))
            .await
            .unwrap()
            .into_payment();
        let key = ProcessorKey::from("gateway_a");
        assert!(
            store
                .find_by_reference(&key, "ref-1")
                .await
                .unwrap()
                .is_none()
        );

        payment.external_reference = Some("ref-1".into());
        store.compare_and_swap(payment).await.unwrap().unwrap();
        let found = store
            .find_by_reference(&key, "ref-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn test_commit_callback_refuses_second_applied_record() {
        let store = InMemoryPaymentStore::new();
        let payment = store
            .reserve(new_payment("k1", 10000), eur(10000))
            .await
            .unwrap()
            .into_payment();
        let event = VerifiedEvent {
            kind: GatewayEventKind::CaptureSucceeded,
            external_reference: "ref-1".into(),
            amount: None,
            refund_id: None,
            reason: None,
        };
        let record = CallbackRecord::verified(
            "gateway_a",
            b"{}",
            &event,
            Some(payment.id),
            CallbackOutcome::Applied,
            Utc::now(),
        );

        let mut first = payment.clone();
        first.apply(PaymentTransition::Capture, Utc::now()).unwrap();
        let committed = store
            .commit_callback(record.clone(), Some(first))
            .await
            .unwrap();
        assert!(matches!(committed, CallbackCommit::Committed(Some(_))));

        let mut second = payment;
        second
            .apply(PaymentTransition::Capture, Utc::now())
            .unwrap();
        let duplicate = store.commit_callback(record, Some(second)).await.unwrap();
        assert_eq!(duplicate, CallbackCommit::Duplicate);

        assert_eq!(store.callbacks().await.unwrap().len(), 1);
        let key = event.dedup_key("gateway_a");
        assert!(store.applied_callback(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_parked_callback_pending_until_settled() {
        let store = InMemoryPaymentStore::new();
        let refund = VerifiedEvent {
            kind: GatewayEventKind::RefundSucceeded,
            external_reference: "ref-1".into(),
            amount: Some(eur(2500)),
            refund_id: Some("rf-1".into()),
            reason: None,
        };
        let parked = CallbackRecord::verified(
            "gateway_a",
            b"{}",
            &refund,
            Some(PaymentId(1)),
            CallbackOutcome::Parked {
                detail: "not collected".into(),
            },
            Utc::now(),
        );
        store.commit_callback(parked.clone(), None).await.unwrap();
        store.commit_callback(parked, None).await.unwrap();
        assert_eq!(store.parked_callbacks().await.unwrap().len(), 1);

        let applied = CallbackRecord::verified(
            "gateway_a",
            b"{}",
            &refund,
            Some(PaymentId(1)),
            CallbackOutcome::Applied,
            Utc::now(),
        );
        store.commit_callback(applied, None).await.unwrap();
        assert!(store.parked_callbacks().await.unwrap().is_empty());
        assert_eq!(store.callbacks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_receipt_store_is_keyed_by_event() {
        let store = InMemoryReceiptStore::new();
        let draft = ReceiptDraft {
            event: EventRef::new(PaymentId(1), "capture"),
            order_id: OrderId(1),
            kind: ReceiptKind::Sale,
            total: eur(100),
            line_items: vec![LineItemV2::new("Tea", eur(100), 1).unwrap()],
            issued_at: Utc::now(),
        };
        let (first, created) = store.insert_if_absent(draft.clone()).await.unwrap();
        assert!(created);
        let (second, created) = store.insert_if_absent(draft).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.for_payment(PaymentId(1)).await.unwrap().len(), 1);
    }
}
