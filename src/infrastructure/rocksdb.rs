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
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for orders, keyed by big-endian order id.
pub const CF_ORDERS: &str = "orders";
/// Column Family for payments, keyed by big-endian payment id.
pub const CF_PAYMENTS: &str = "payments";
/// `<order>:<idempotency key>` to payment id.
pub const CF_PAYMENT_KEYS: &str = "payment_keys";
/// `<processor>\x1f<external reference>` to payment id.
pub const CF_PAYMENT_REFS: &str = "payment_refs";
/// Callback journal, keyed by big-endian sequence number.
pub const CF_CALLBACKS: &str = "callbacks";
/// Dedup key of every applied callback to its journal sequence.
pub const CF_CALLBACK_APPLIED: &str = "callback_applied";
/// Dedup key of every pending parked callback to its journal sequence.
pub const CF_CALLBACK_PARKED: &str = "callback_parked";
/// Receipts, keyed by `EventRef::storage_key`.
pub const CF_RECEIPTS: &str = "receipts";
/// Id counters.
pub const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_ORDERS,
    CF_PAYMENTS,
    CF_PAYMENT_KEYS,
    CF_PAYMENT_REFS,
    CF_CALLBACKS,
    CF_CALLBACK_APPLIED,
    CF_CALLBACK_PARKED,
    CF_RECEIPTS,
    CF_META,
];

const NEXT_PAYMENT_ID: &[u8] = b"next_payment_id";
const NEXT_RECEIPT_ID: &[u8] = b"next_receipt_id";
const NEXT_CALLBACK_SEQ: &[u8] = b"next_callback_seq";

fn internal(message: impl Into<String>) -> PaymentError {
    PaymentError::InternalError(Box::new(std::io::Error::other(message.into())))
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| internal(format!("expected 8-byte id, found {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

fn payment_key(order: OrderId, idempotency_key: &str) -> Vec<u8> {
    format!("{:020}:{idempotency_key}", order.0).into_bytes()
}

fn reference_key(processor: &ProcessorKey, reference: &str) -> Vec<u8> {
    format!("{processor}\u{1f}{reference}").into_bytes()
}

/// A persistent store implementation using RocksDB.
///
/// Implements the order, payment and receipt ports over one database with a
/// Column Family per record kind and per index. Reads go straight to RocksDB;
/// every read-check-write sequence runs under a single writer lock and lands
/// as one `WriteBatch`, so a payment update and its callback record (or a
/// payment and its indexes) become visible together.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every required column family exists.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| internal(format!("column family `{name}` not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_id(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<u64>> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<()> {
        batch.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?);
        Ok(())
    }

    /// Reserves the next value of a counter. Only call with the writer lock held.
    fn next_id(&self, batch: &mut WriteBatch, counter: &[u8]) -> Result<u64> {
        let next = self.read_id(CF_META, counter)?.unwrap_or(0) + 1;
        batch.put_cf(self.cf(CF_META)?, counter, next.to_be_bytes());
        Ok(next)
    }

    /// Stages a compare-and-swap of `payment`. Only call with the writer lock held.
    fn stage_payment_swap(
        &self,
        batch: &mut WriteBatch,
        mut payment: Payment,
    ) -> Result<Option<Payment>> {
        let key = payment.id.0.to_be_bytes();
        let current: Payment = self
            .read(CF_PAYMENTS, key)?
            .ok_or(PaymentError::PaymentNotFound(payment.id))?;
        if current.version != payment.version {
            return Ok(None);
        }
        payment.version += 1;
        if let Some(reference) = &payment.external_reference {
            batch.put_cf(
                self.cf(CF_PAYMENT_REFS)?,
                reference_key(&payment.processor, reference),
                key,
            );
        }
        self.put_json(batch, CF_PAYMENTS, key, &payment)?;
        Ok(Some(payment))
    }
}

#[async_trait]
impl OrderStore for RocksDBStore {
    async fn insert(&self, order: Order) -> Result<()> {
        let _guard = self.writer.lock().await;
        let key = order.id.0.to_be_bytes();
        if self.db.get_pinned_cf(self.cf(CF_ORDERS)?, key)?.is_some() {
            return Err(PaymentError::OrderExists(order.id));
        }
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_ORDERS, key, &order)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        self.read(CF_ORDERS, id.0.to_be_bytes())
    }

    async fn compare_and_swap(&self, mut order: Order) -> Result<Option<Order>> {
        let _guard = self.writer.lock().await;
        let key = order.id.0.to_be_bytes();
        let current: Order = self
            .read(CF_ORDERS, key)?
            .ok_or(PaymentError::OrderNotFound(order.id))?;
        if current.version != order.version {
            return Ok(None);
        }
        order.version += 1;
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_ORDERS, key, &order)?;
        self.db.write(batch)?;
        Ok(Some(order))
    }

    async fn all(&self) -> Result<Vec<Order>> {
        self.scan(CF_ORDERS)
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn reserve(&self, new: NewPayment, order_total: Money) -> Result<Reservation> {
        let _guard = self.writer.lock().await;
        let index_key = payment_key(new.order_id, new.idempotency_key.as_str());
        if let Some(id) = self.read_id(CF_PAYMENT_KEYS, &index_key)?
            && let Some(existing) = self.read::<Payment>(CF_PAYMENTS, id.to_be_bytes())?
        {
            return Ok(Reservation::Existing(existing));
        }

        let live = self
            .for_order(new.order_id)
            .await?
            .into_iter()
            .filter(|p| p.state != PaymentState::Failed)
            .map(|p| p.amount);
        let reserved = Money::sum(live, order_total.currency())?;
        let remaining = order_total.checked_sub(reserved)?;
        if new.amount > remaining {
            return Err(PaymentError::AmountExceeded {
                order: new.order_id,
                requested: new.amount,
                remaining,
            });
        }

        let mut batch = WriteBatch::default();
        let id = PaymentId(self.next_id(&mut batch, NEXT_PAYMENT_ID)?);
        let payment = Payment::new(
            id,
            new.order_id,
            new.processor,
            new.amount,
            new.idempotency_key,
            new.created_at,
        );
        batch.put_cf(self.cf(CF_PAYMENT_KEYS)?, index_key, id.0.to_be_bytes());
        self.put_json(&mut batch, CF_PAYMENTS, id.0.to_be_bytes(), &payment)?;
        self.db.write(batch)?;
        Ok(Reservation::Created(payment))
    }

    async fn get(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.read(CF_PAYMENTS, id.0.to_be_bytes())
    }

    async fn find_by_reference(
        &self,
        processor: &ProcessorKey,
        reference: &str,
    ) -> Result<Option<Payment>> {
        match self.read_id(CF_PAYMENT_REFS, reference_key(processor, reference))? {
            Some(id) => self.read(CF_PAYMENTS, id.to_be_bytes()),
            None => Ok(None),
        }
    }

    async fn for_order(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        Ok(self
            .scan::<Payment>(CF_PAYMENTS)?
            .into_iter()
            .filter(|p| p.order_id == order_id)
            .collect())
    }

    async fn compare_and_swap(&self, payment: Payment) -> Result<Option<Payment>> {
        let _guard = self.writer.lock().await;
        let mut batch = WriteBatch::default();
        let stored = self.stage_payment_swap(&mut batch, payment)?;
        if stored.is_some() {
            self.db.write(batch)?;
        }
        Ok(stored)
    }

    async fn all(&self) -> Result<Vec<Payment>> {
        self.scan(CF_PAYMENTS)
    }

    async fn applied_callback(&self, key: &DedupKey) -> Result<Option<CallbackRecord>> {
        match self.read_id(CF_CALLBACK_APPLIED, key.storage_key())? {
            Some(seq) => self.read(CF_CALLBACKS, seq.to_be_bytes()),
            None => Ok(None),
        }
    }

    async fn commit_callback(
        &self,
        record: CallbackRecord,
        payment: Option<Payment>,
    ) -> Result<CallbackCommit> {
        let _guard = self.writer.lock().await;
        let applied_key = match (&record.dedup_key, record.is_applied()) {
            (Some(key), true) => {
                let key = key.storage_key();
                if self
                    .db
                    .get_pinned_cf(self.cf(CF_CALLBACK_APPLIED)?, &key)?
                    .is_some()
                {
                    return Ok(CallbackCommit::Duplicate);
                }
                Some(key)
            }
            _ => None,
        };

        let mut batch = WriteBatch::default();
        let stored = match payment {
            Some(payment) => match self.stage_payment_swap(&mut batch, payment)? {
                Some(stored) => Some(stored),
                None => return Ok(CallbackCommit::Conflict),
            },
            None => None,
        };

        let seq = self.next_id(&mut batch, NEXT_CALLBACK_SEQ)?.to_be_bytes();
        self.put_json(&mut batch, CF_CALLBACKS, seq, &record)?;
        if let Some(key) = &record.dedup_key {
            let key = key.storage_key();
            let parked = self.cf(CF_CALLBACK_PARKED)?;
            if !record.is_parked() {
                batch.delete_cf(parked, key);
            } else if self.db.get_pinned_cf(parked, &key)?.is_none() {
                batch.put_cf(parked, key, seq);
            }
        }
        if let Some(key) = applied_key {
            batch.put_cf(self.cf(CF_CALLBACK_APPLIED)?, key, seq);
        }
        self.db.write(batch)?;
        Ok(CallbackCommit::Committed(stored))
    }

    async fn callbacks(&self) -> Result<Vec<CallbackRecord>> {
        self.scan(CF_CALLBACKS)
    }

    async fn parked_callbacks(&self) -> Result<Vec<CallbackRecord>> {
        let mut seqs = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_CALLBACK_PARKED)?, IteratorMode::Start)
        {
            let (_key, value) = item?;
            seqs.push(decode_u64(&value)?);
        }
        seqs.sort_unstable();
        let mut records = Vec::new();
        for seq in seqs {
            if let Some(record) = self.read(CF_CALLBACKS, seq.to_be_bytes())? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ReceiptStore for RocksDBStore {
    async fn insert_if_absent(&self, draft: ReceiptDraft) -> Result<(Receipt, bool)> {
        let _guard = self.writer.lock().await;
        let key = draft.event.storage_key();
        if let Some(existing) = self.read::<Receipt>(CF_RECEIPTS, &key)? {
            return Ok((existing, false));
        }
        let mut batch = WriteBatch::default();
        let receipt = draft.with_id(ReceiptId(self.next_id(&mut batch, NEXT_RECEIPT_ID)?));
        self.put_json(&mut batch, CF_RECEIPTS, key, &receipt)?;
        self.db.write(batch)?;
        Ok((receipt, true))
    }

    async fn find_by_event(&self, event: &EventRef) -> Result<Option<Receipt>> {
        self.read(CF_RECEIPTS, event.storage_key())
    }

    async fn for_payment(&self, payment_id: PaymentId) -> Result<Vec<Receipt>> {
        let prefix = format!("{:020}:", payment_id.0);
        let mut receipts = Vec::new();
        let mode = IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        for item in self.db.iterator_cf(self.cf(CF_RECEIPTS)?, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            receipts.push(serde_json::from_slice(&value)?);
        }
        Ok(receipts)
    }

    async fn all(&self) -> Result<Vec<Receipt>> {
        let mut receipts: Vec<Receipt> = self.scan(CF_RECEIPTS)?;
        receipts.sort_by_key(|r| r.id);
        Ok(receipts)
    }
}
