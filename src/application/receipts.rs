use crate::domain::money::Money;
use crate::domain::order::{LineDescriptor, Order};
use crate::domain::payment::{FinancialEvent, Payment};
use crate::domain::ports::{OrderStoreRef, ReceiptStoreRef};
use crate::domain::receipt::{EventRef, LineItemV2, Receipt, ReceiptDraft, ReceiptKind};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use tracing::{error, info};

/// Itemizes `amount` against the order's line descriptors.
///
/// A full-amount event copies the lines verbatim. Anything else is split
/// proportionally to the line totals, one unit per line, dropping lines whose
/// share rounds to zero.
pub fn compose_line_items(order: &Order, amount: Money) -> Result<Vec<LineItemV2>> {
    if amount == order.total && order.is_consistent() {
        return order
            .lines
            .iter()
            .map(|line| LineItemV2::new(line.description.clone(), line.unit_price, line.quantity))
            .collect();
    }

    let weights = order
        .lines
        .iter()
        .map(LineDescriptor::line_total)
        .collect::<Result<Vec<_>>>()?;
    let shares = amount.allocate(&weights)?;
    order
        .lines
        .iter()
        .zip(shares)
        .filter(|(_, share)| !share.is_zero())
        .map(|(line, share)| LineItemV2::new(line.description.clone(), share, 1))
        .collect()
}

/// Checks every line is internally consistent and that the lines add up to
/// exactly `expected`, in its currency.
pub fn reconcile(event: &EventRef, expected: Money, items: &[LineItemV2]) -> Result<()> {
    let mismatch = |actual: String| PaymentError::ReconciliationError {
        event: event.clone(),
        expected,
        actual,
    };

    if let Some(item) = items.iter().find(|item| !item.is_consistent()) {
        return Err(mismatch(format!(
            "line `{}` totalling {} instead of {} x {}",
            item.description, item.total, item.unit_amount, item.quantity
        )));
    }
    let sum = Money::sum(items.iter().map(|item| item.total), expected.currency())
        .map_err(|e| mismatch(e.to_string()))?;
    if sum != expected {
        return Err(mismatch(sum.to_string()));
    }
    Ok(())
}

/// Issues one receipt per payment financial event.
pub struct ReceiptBuilder {
    orders: OrderStoreRef,
    receipts: ReceiptStoreRef,
}

impl ReceiptBuilder {
    pub fn new(orders: OrderStoreRef, receipts: ReceiptStoreRef) -> Self {
        Self { orders, receipts }
    }

    /// Returns the receipt for `event`, creating it on first call.
    ///
    /// Nothing is persisted when the line items fail to reconcile.
    pub async fn issue(&self, payment: &Payment, event: &FinancialEvent) -> Result<Receipt> {
        let event_ref = EventRef::new(payment.id, event.id.clone());
        if let Some(existing) = self.receipts.find_by_event(&event_ref).await? {
            return Ok(existing);
        }

        let order = self
            .orders
            .get(payment.order_id)
            .await?
            .ok_or(PaymentError::OrderNotFound(payment.order_id))?;

        let line_items = compose_line_items(&order, event.amount)?;
        if let Err(e) = reconcile(&event_ref, event.amount, &line_items) {
            error!(
                order = %order.id,
                payment = %payment.id,
                event = %event.id,
                error = %e,
                "Receipt reconciliation failed"
            );
            return Err(e);
        }

        let draft = ReceiptDraft {
            event: event_ref,
            order_id: order.id,
            kind: ReceiptKind::from(event.kind),
            total: event.amount,
            line_items,
            issued_at: Utc::now(),
        };
        let (receipt, created) = self.receipts.insert_if_absent(draft).await?;
        if created {
            info!(
                order = %order.id,
                payment = %payment.id,
                receipt = %receipt.id,
                kind = %receipt.kind,
                total = %receipt.total,
                "Receipt issued"
            );
        }
        Ok(receipt)
    }
}
