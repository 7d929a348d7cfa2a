mod common;

use common::*;
use orderpay::application::receipts::{compose_line_items, reconcile};
use orderpay::domain::money::{Currency, Money};
use orderpay::domain::order::{LineDescriptor, OrderDraft, OrderId, OrderState, derive_state};
use orderpay::domain::payment::PaymentId;
use orderpay::domain::receipt::EventRef;
use orderpay::infrastructure::gateways::transport::Fault;
use proptest::prelude::*;
use rust_decimal::Decimal;

fn lines_strategy() -> impl Strategy<Value = Vec<(u32, i64)>> {
    prop::collection::vec((1u32..5, 1i64..50_000), 1..6)
}

fn order_from(lines: &[(u32, i64)]) -> orderpay::domain::order::Order {
    OrderDraft {
        id: OrderId(1),
        currency: Currency::Eur,
        lines: lines
            .iter()
            .enumerate()
            .map(|(i, (quantity, unit))| LineDescriptor {
                product: format!("sku-{i}"),
                description: format!("item {i}"),
                quantity: *quantity,
                unit_price: eur(*unit),
            })
            .collect(),
    }
    .into_order(chrono::Utc::now())
    .unwrap()
}

#[derive(Debug, Clone)]
enum Delivery {
    Capture,
    Fail,
    Refund { id: u8, minor: i64 },
}

fn delivery_strategy() -> impl Strategy<Value = Delivery> {
    prop_oneof![
        Just(Delivery::Capture),
        Just(Delivery::Fail),
        (0u8..4, 1i64..6_000).prop_map(|(id, minor)| Delivery::Refund { id, minor }),
    ]
}

proptest! {
    #[test]
    fn allocation_is_exact(
        minor in 0i64..1_000_000_000,
        weights in prop::collection::vec(0i64..10_000_000, 1..8),
    ) {
        prop_assume!(weights.iter().any(|w| *w > 0));
        let weights: Vec<Money> = weights.into_iter().map(eur).collect();
        let parts = eur(minor).allocate(&weights).unwrap();
        prop_assert_eq!(parts.len(), weights.len());
        prop_assert_eq!(Money::sum(parts.iter().copied(), Currency::Eur).unwrap(), eur(minor));
        for (part, weight) in parts.iter().zip(&weights) {
            prop_assert!(!weight.is_zero() || part.is_zero());
        }
    }

    #[test]
    fn receipt_lines_reconcile_for_any_amount(lines in lines_strategy(), fraction in 1u32..=100) {
        let order = order_from(&lines);
        let amount = Money::rounded(
            order.total.amount() * Decimal::from(fraction) / Decimal::from(100),
            Currency::Eur,
        )
        .unwrap();
        prop_assume!(amount.is_positive());
        let items = compose_line_items(&order, amount).unwrap();
        prop_assert!(reconcile(&EventRef::new(PaymentId(1), "capture"), amount, &items).is_ok());
        prop_assert!(items.iter().all(|item| item.is_consistent()));
    }

    #[test]
    fn derived_state_ignores_stored_state(lines in lines_strategy()) {
        let mut order = order_from(&lines);
        let fresh = derive_state(&order, &[]).unwrap();
        order.state = OrderState::AwaitingPayment;
        prop_assert_eq!(derive_state(&order, &[]).unwrap(), fresh);
    }

    #[test]
    fn order_state_only_moves_forward(
        deliveries in prop::collection::vec(delivery_strategy(), 1..12),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let h = harness();
            h.engine.create_order(draft(1)).await.unwrap();
            h.card.script([Fault::Pass, Fault::Deferred]).await;
            let start = h.engine.start_payment(pay(1, CARD, "k1")).await.unwrap();
            let reference = start.payment.external_reference.unwrap();

            let mut previous = h.engine.order(OrderId(1)).await.unwrap().unwrap().state;
            for delivery in &deliveries {
                let (payload, signature) = match delivery {
                    Delivery::Capture => {
                        card_callback("capture.succeeded", &reference, Some(10000), None)
                    }
                    Delivery::Fail => card_callback("capture.failed", &reference, None, None),
                    Delivery::Refund { id, minor } => card_callback(
                        "refund.succeeded",
                        &reference,
                        Some(*minor),
                        Some(&format!("rf-{id}")),
                    ),
                };
                h.engine.ingest_callback(CARD, &payload, &signature).await.unwrap();
                let current = h.engine.order(OrderId(1)).await.unwrap().unwrap().state;
                assert!(
                    previous.can_advance_to(current),
                    "order moved backwards from {previous} to {current}"
                );
                previous = current;
            }

            let payment = h.engine.payment(start.payment.id).await.unwrap().unwrap();
            assert!(payment.refunded_total().unwrap() <= payment.captured_amount());
            for receipt in h.engine.receipts().await.unwrap() {
                assert_eq!(receipt.line_items_total(), Some(receipt.total));
            }

            let once = h.engine.recompute_order(OrderId(1)).await.unwrap();
            let twice = h.engine.recompute_order(OrderId(1)).await.unwrap();
            assert_eq!(once.state, twice.state);
            assert_eq!(once.state, previous);
        });
    }
}
