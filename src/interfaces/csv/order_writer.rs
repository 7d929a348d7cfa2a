use crate::application::engine::OrderSummary;
use crate::domain::money::Currency;
use crate::domain::order::{OrderId, OrderState};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct OrderRow {
    order: OrderId,
    state: OrderState,
    currency: Currency,
    total: Decimal,
    captured: Decimal,
    refunded: Decimal,
    receipts: usize,
}

impl From<&OrderSummary> for OrderRow {
    fn from(summary: &OrderSummary) -> Self {
        Self {
            order: summary.order,
            state: summary.state,
            currency: summary.currency,
            total: summary.total.amount(),
            captured: summary.captured.amount(),
            refunded: summary.refunded.amount(),
            receipts: summary.receipts,
        }
    }
}

/// Writes the per-order report as CSV with a header row.
pub struct OrderWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OrderWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_orders(&mut self, summaries: &[OrderSummary]) -> Result<()> {
        for summary in summaries {
            self.writer.serialize(OrderRow::from(summary))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Money;

    #[test]
    fn test_writes_header_and_amounts_at_currency_scale() {
        let summary = OrderSummary {
            order: OrderId(1),
            state: OrderState::PartiallyRefunded,
            currency: Currency::Eur,
            total: Money::from_minor(10000, Currency::Eur),
            captured: Money::from_minor(10000, Currency::Eur),
            refunded: Money::from_minor(4000, Currency::Eur),
            receipts: 2,
        };
        let mut out = Vec::new();
        OrderWriter::new(&mut out).write_orders(&[summary]).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "order,state,currency,total,captured,refunded,receipts\n\
             1,partially_refunded,EUR,100.00,100.00,40.00,2\n"
        );
    }
}
