use crate::application::registry::ProcessorRegistry;
use crate::domain::money::Money;
use crate::domain::order::OrderId;
use crate::domain::payment::{IdempotencyKey, ProcessorKey};
use crate::domain::ports::{NewPayment, OrderStoreRef, PaymentStoreRef, Reservation};
use crate::domain::processor::ProcessorRef;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Caller's request to pay (part of) an order through one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: OrderId,
    pub processor: ProcessorKey,
    pub idempotency_key: IdempotencyKey,
    /// Defaults to whatever is still collectible on the order.
    pub amount: Option<Money>,
}

/// Creates payments for orders, at most one per (order, idempotency key).
pub struct PaymentBuilder {
    registry: Arc<ProcessorRegistry>,
    orders: OrderStoreRef,
    payments: PaymentStoreRef,
}

impl PaymentBuilder {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        orders: OrderStoreRef,
        payments: PaymentStoreRef,
    ) -> Self {
        Self {
            registry,
            orders,
            payments,
        }
    }

    pub async fn build(
        &self,
        request: PaymentRequest,
        now: DateTime<Utc>,
    ) -> Result<(Reservation, ProcessorRef)> {
        let processor = self.registry.resolve(request.processor.as_str())?;
        let order = self
            .orders
            .get(request.order_id)
            .await?
            .ok_or(PaymentError::OrderNotFound(request.order_id))?;

        let existing = self.payments.for_order(order.id).await?;
        if let Some(payment) = existing
            .iter()
            .find(|p| p.idempotency_key == request.idempotency_key)
        {
            return Ok((Reservation::Existing(payment.clone()), processor));
        }

        if !order.state.accepts_payments() {
            return Err(PaymentError::InvalidOrderState {
                order: order.id,
                state: order.state,
                action: "accept payments",
            });
        }
        if !processor.supports(order.currency()) {
            return Err(PaymentError::UnsupportedCurrency {
                processor: processor.key().to_string(),
                currency: order.currency(),
            });
        }

        let remaining = order.remaining_collectible(&existing)?;
        let amount = request.amount.unwrap_or(remaining);
        if amount.currency() != order.currency() {
            return Err(PaymentError::CurrencyMismatch {
                expected: order.currency(),
                actual: amount.currency(),
            });
        }
        if !amount.is_positive() {
            return Err(PaymentError::ValidationError(format!(
                "payment amount for order {} must be positive, got {amount}",
                order.id
            )));
        }

        let reservation = self
            .payments
            .reserve(
                NewPayment {
                    order_id: order.id,
                    processor: processor.key().clone(),
                    amount,
                    idempotency_key: request.idempotency_key,
                    created_at: now,
                },
                order.total,
            )
            .await?;

        if let Reservation::Created(payment) = &reservation {
            info!(
                order = %order.id,
                payment = %payment.id,
                gateway = %payment.processor,
                amount = %payment.amount,
                "Payment created"
            );
        }
        Ok((reservation, processor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Currency;
    use crate::domain::order::{LineDescriptor, OrderDraft, OrderState};
    use crate::infrastructure::gateways::card::CardGateway;
    use crate::infrastructure::gateways::transport::SimulatedGateway;
    use crate::infrastructure::in_memory::{InMemoryOrderStore, InMemoryPaymentStore};

    fn eur(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Eur)
    }

    async fn setup() -> (PaymentBuilder, OrderStoreRef) {
        let registry = ProcessorRegistry::builder()
            .register(Arc::new(CardGateway::new(
                "gateway_a",
                "secret",
                vec![Currency::Eur],
                Arc::new(SimulatedGateway::new("gateway_a")),
            )))
            .unwrap()
            .build();
        let orders: OrderStoreRef = Arc::new(InMemoryOrderStore::new());
        let payments: PaymentStoreRef = Arc::new(InMemoryPaymentStore::new());
        let order = OrderDraft {
            id: OrderId(1),
            currency: Currency::Eur,
            lines: vec![LineDescriptor {
                product: "sku".into(),
                description: "Tea".into(),
                quantity: 1,
                unit_price: eur(10000),
            }],
        }
        .into_order(Utc::now())
        .unwrap();
        orders.insert(order).await.unwrap();
        (
            PaymentBuilder::new(Arc::new(registry), orders.clone(), payments),
            orders,
        )
    }

    fn request(key: &str, processor: &str, amount: Option<i64>) -> PaymentRequest {
        PaymentRequest {
            order_id: OrderId(1),
            processor: ProcessorKey::from(processor),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
            amount: amount.map(eur),
        }
    }

    #[tokio::test]
    async fn test_build_defaults_to_remaining_amount() {
        let (builder, _) = setup().await;
        let (reservation, _) = builder
            .build(request("k1", "gateway_a", None), Utc::now())
            .await
            .unwrap();
        assert!(matches!(reservation, Reservation::Created(_)));
        assert_eq!(reservation.payment().amount, eur(10000));
    }

    #[tokio::test]
    async fn test_same_key_returns_existing_payment() {
        let (builder, _) = setup().await;
        let (first, _) = builder
            .build(request("k1", "gateway_a", Some(4000)), Utc::now())
            .await
            .unwrap();
        let (second, _) = builder
            .build(request("k1", "gateway_a", Some(4000)), Utc::now())
            .await
            .unwrap();
        assert!(matches!(second, Reservation::Existing(_)));
        assert_eq!(first.payment().id, second.payment().id);
    }

    #[tokio::test]
    async fn test_build_errors() {
        let (builder, orders) = setup().await;
        assert!(matches!(
            builder
                .build(request("k1", "unknown", None), Utc::now())
                .await,
            Err(PaymentError::InvalidProcessor(_))
        ));
        assert!(matches!(
            builder
                .build(request("k1", "gateway_a", Some(10001)), Utc::now())
                .await,
            Err(PaymentError::AmountExceeded { .. })
        ));
        assert!(matches!(
            builder
                .build(request("k1", "gateway_a", Some(0)), Utc::now())
                .await,
            Err(PaymentError::ValidationError(_))
        ));

        let mut order = orders.get(OrderId(1)).await.unwrap().unwrap();
        order.state = OrderState::Cancelled;
        orders.compare_and_swap(order).await.unwrap();
        assert!(matches!(
            builder
                .build(request("k2", "gateway_a", None), Utc::now())
                .await,
            Err(PaymentError::InvalidOrderState { .. })
        ));
    }
}
