use crate::domain::money::Currency;
use crate::domain::order::OrderId;
use crate::domain::payment::PaymentId;
use crate::domain::receipt::{Receipt, ReceiptId, ReceiptKind};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

/// One line item, flattened with its receipt's identity.
#[derive(Serialize)]
struct ReceiptLineRow<'a> {
    receipt: ReceiptId,
    order: OrderId,
    payment: PaymentId,
    event: &'a str,
    kind: ReceiptKind,
    currency: Currency,
    description: &'a str,
    quantity: u32,
    unit_amount: Decimal,
    line_total: Decimal,
    receipt_total: Decimal,
}

/// Writes every receipt line item as CSV.
pub struct ReceiptWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ReceiptWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_receipts(&mut self, receipts: &[Receipt]) -> Result<()> {
        for receipt in receipts {
            for item in &receipt.line_items {
                self.writer.serialize(ReceiptLineRow {
                    receipt: receipt.id,
                    order: receipt.order_id,
                    payment: receipt.event.payment_id,
                    event: &receipt.event.event_id,
                    kind: receipt.kind,
                    currency: receipt.total.currency(),
                    description: &item.description,
                    quantity: item.quantity,
                    unit_amount: item.unit_amount.amount(),
                    line_total: item.total.amount(),
                    receipt_total: receipt.total.amount(),
                })?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }
}
