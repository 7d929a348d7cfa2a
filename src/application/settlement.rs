use crate::application::order_sync::OrderSynchronizer;
use crate::application::receipts::ReceiptBuilder;
use crate::domain::order::Order;
use crate::domain::payment::{FinancialEvent, Payment};
use crate::domain::receipt::Receipt;
use crate::error::Result;

/// What followed a committed payment transition.
#[derive(Debug, Clone)]
pub struct Settled {
    pub order: Order,
    pub receipts: Vec<Receipt>,
    /// Receipts that could not be issued; the transition itself stands.
    pub receipt_errors: Vec<String>,
}

/// Follow-up work after a payment transition: recompute the order, then
/// issue receipts for new financial events.
///
/// Both steps are idempotent, so running them again after a crash is safe.
pub struct Settlement {
    orders: OrderSynchronizer,
    receipts: ReceiptBuilder,
}

impl Settlement {
    pub fn new(orders: OrderSynchronizer, receipts: ReceiptBuilder) -> Self {
        Self { orders, receipts }
    }

    pub fn orders(&self) -> &OrderSynchronizer {
        &self.orders
    }

    pub fn receipts(&self) -> &ReceiptBuilder {
        &self.receipts
    }

    pub async fn settle(&self, payment: &Payment, events: &[FinancialEvent]) -> Result<Settled> {
        let order = self.orders.recompute(payment.order_id).await?;
        let mut settled = Settled {
            order,
            receipts: Vec::with_capacity(events.len()),
            receipt_errors: Vec::new(),
        };
        for event in events {
            match self.receipts.issue(payment, event).await {
                Ok(receipt) => settled.receipts.push(receipt),
                Err(e) if e.is_internal() => return Err(e),
                Err(e) => settled.receipt_errors.push(e.to_string()),
            }
        }
        Ok(settled)
    }
}
