use crate::application::builder::PaymentRequest;
use crate::application::engine::PaymentEngine;
use crate::domain::money::{Currency, Money};
use crate::domain::order::{LineDescriptor, OrderDraft, OrderId};
use crate::domain::payment::{IdempotencyKey, PaymentId, ProcessorKey};
use crate::error::{PaymentError, Result};
use crate::interfaces::webhook::WebhookEndpoint;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandLine {
    pub product: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
}

/// One instruction of the command feed, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    CreateOrder {
        order: u64,
        currency: Currency,
        lines: Vec<CommandLine>,
    },
    Pay {
        order: u64,
        processor: String,
        key: String,
        /// Defaults to what remains collectible on the order.
        #[serde(default)]
        amount: Option<Decimal>,
    },
    /// A raw gateway notification, delivered through the webhook endpoint.
    Callback {
        gateway: String,
        payload: String,
        signature: String,
    },
    Refund {
        payment: u64,
        amount: Decimal,
        key: String,
    },
    Cancel {
        order: u64,
    },
    Reverify {
        payment: u64,
    },
}

impl Command {
    /// Runs the command against the engine.
    pub async fn apply(self, engine: &PaymentEngine, webhook: &WebhookEndpoint) -> Result<()> {
        match self {
            Command::CreateOrder {
                order,
                currency,
                lines,
            } => {
                let lines = lines
                    .into_iter()
                    .map(|line| {
                        Ok(LineDescriptor {
                            description: line.description.unwrap_or_else(|| line.product.clone()),
                            product: line.product,
                            quantity: line.quantity,
                            unit_price: Money::new(line.unit_price, currency)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                engine
                    .create_order(OrderDraft {
                        id: OrderId(order),
                        currency,
                        lines,
                    })
                    .await?;
            }
            Command::Pay {
                order,
                processor,
                key,
                amount,
            } => {
                let order_id = OrderId(order);
                let amount = match amount {
                    Some(amount) => {
                        let order = engine
                            .order(order_id)
                            .await?
                            .ok_or(PaymentError::OrderNotFound(order_id))?;
                        Some(Money::new(amount, order.currency())?)
                    }
                    None => None,
                };
                let start = engine
                    .start_payment(PaymentRequest {
                        order_id,
                        processor: ProcessorKey::from(processor),
                        idempotency_key: IdempotencyKey::new(key)?,
                        amount,
                    })
                    .await?;
                info!(
                    payment = %start.payment.id,
                    order = %order_id,
                    next_action = ?start.next_action,
                    "Payment started"
                );
            }
            Command::Callback {
                gateway,
                payload,
                signature,
            } => {
                let ack = webhook
                    .receive(&gateway, payload.as_bytes(), &signature)
                    .await;
                if ack.is_success() {
                    info!(
                        gateway = %gateway,
                        status = ack.status,
                        body = %ack.body,
                        "Callback acknowledged"
                    );
                } else {
                    warn!(
                        gateway = %gateway,
                        status = ack.status,
                        body = %ack.body,
                        "Callback refused"
                    );
                }
            }
            Command::Refund {
                payment,
                amount,
                key,
            } => {
                let payment_id = PaymentId(payment);
                let current = engine
                    .payment(payment_id)
                    .await?
                    .ok_or(PaymentError::PaymentNotFound(payment_id))?;
                let amount = Money::new(amount, current.amount.currency())?;
                engine.request_refund(payment_id, amount, &key).await?;
            }
            Command::Cancel { order } => {
                engine.cancel_order(OrderId(order)).await?;
            }
            Command::Reverify { payment } => {
                engine.reverify_payment(PaymentId(payment)).await?;
            }
        }
        Ok(())
    }
}

/// Reads commands from a JSON-lines source.
///
/// Blank lines are skipped. A line that fails to parse yields an error for
/// that line only; the following lines are still read.
pub struct CommandReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        Self {
            reader: BufReader::new(source),
        }
    }

    /// Returns an iterator that lazily reads and deserializes commands.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader.lines().enumerate().filter_map(|(index, line)| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(PaymentError::from(e))),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(serde_json::from_str(trimmed).map_err(|e| {
                PaymentError::ValidationError(format!("line {}: {e}", index + 1))
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reader_valid_stream() {
        let data = r#"{"type":"create_order","order":1,"currency":"EUR","lines":[{"product":"tea","quantity":2,"unit_price":"50.00"}]}

{"type":"pay","order":1,"processor":"gateway_a","key":"k1"}
{"type":"refund","payment":1,"amount":"40.00","key":"r1"}"#;
        let reader = CommandReader::new(data.as_bytes());
        let results: Vec<Result<Command>> = reader.commands().collect();

        assert_eq!(results.len(), 3);
        let Command::CreateOrder { lines, .. } = results[0].as_ref().unwrap() else {
            panic!("expected create_order");
        };
        assert_eq!(lines[0].unit_price, dec!(50.00));
        assert!(matches!(
            results[1].as_ref().unwrap(),
            Command::Pay { amount: None, .. }
        ));
        assert!(matches!(
            results[2].as_ref().unwrap(),
            Command::Refund { amount, .. } if *amount == dec!(40.00)
        ));
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "{\"type\":\"teleport\",\"order\":1}\n{\"type\":\"cancel\",\"order\":1}";
        let reader = CommandReader::new(data.as_bytes());
        let results: Vec<Result<Command>> = reader.commands().collect();

        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), &Command::Cancel { order: 1 });
    }
}
