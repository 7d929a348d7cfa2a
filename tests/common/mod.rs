#![allow(dead_code)]

use chrono::Utc;
use orderpay::application::builder::PaymentRequest;
use orderpay::application::engine::{PaymentEngine, Stores};
use orderpay::config::{EngineSettings, Settings};
use orderpay::domain::money::{Currency, Money};
use orderpay::domain::order::{LineDescriptor, OrderDraft, OrderId};
use orderpay::domain::payment::{IdempotencyKey, ProcessorKey};
use orderpay::infrastructure::gateways::build_registry_with;
use orderpay::infrastructure::gateways::signature;
use orderpay::infrastructure::gateways::transport::{GatewayTransport, SimulatedGateway};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const CARD: &str = "gateway_a";
pub const REDIRECT: &str = "gateway_b";
pub const CARD_SECRET: &[u8] = b"sandbox-gateway-a-secret";
pub const REDIRECT_SECRET: &[u8] = b"sandbox-gateway-b-secret";

/// An engine over in-memory stores with one simulated transport per gateway.
pub struct Harness {
    pub engine: Arc<PaymentEngine>,
    pub card: Arc<SimulatedGateway>,
    pub redirect: Arc<SimulatedGateway>,
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        gateway_timeout: Duration::from_millis(100),
        retry_min_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        ..EngineSettings::default()
    }
}

pub fn harness() -> Harness {
    harness_with(Stores::in_memory())
}

pub fn harness_with(stores: Stores) -> Harness {
    let card = Arc::new(SimulatedGateway::new(CARD));
    let redirect = Arc::new(SimulatedGateway::new(REDIRECT));
    let settings = Settings::default();
    let registry = build_registry_with(&settings.processors, |processor| {
        let transport: Arc<dyn GatewayTransport> = if processor.key == CARD {
            card.clone()
        } else {
            redirect.clone()
        };
        transport
    })
    .unwrap();
    Harness {
        engine: Arc::new(PaymentEngine::new(registry, stores, &fast_settings())),
        card,
        redirect,
    }
}

pub fn eur(minor: i64) -> Money {
    Money::from_minor(minor, Currency::Eur)
}

pub fn line(product: &str, quantity: u32, unit_minor: i64) -> LineDescriptor {
    LineDescriptor {
        product: product.to_string(),
        description: product.to_string(),
        quantity,
        unit_price: eur(unit_minor),
    }
}

/// A EUR order of 100.00: two teas at 30.00 and one pot at 40.00.
pub fn draft(id: u64) -> OrderDraft {
    OrderDraft {
        id: OrderId(id),
        currency: Currency::Eur,
        lines: vec![line("tea", 2, 3000), line("pot", 1, 4000)],
    }
}

pub fn pay(order: u64, processor: &str, key: &str) -> PaymentRequest {
    PaymentRequest {
        order_id: OrderId(order),
        processor: ProcessorKey::from(processor),
        idempotency_key: IdempotencyKey::new(key).unwrap(),
        amount: None,
    }
}

/// A signed card gateway notification.
pub fn card_callback(
    event: &str,
    reference: &str,
    amount_minor: Option<i64>,
    refund_id: Option<&str>,
) -> (Vec<u8>, String) {
    let mut body = json!({ "event": event, "reference": reference });
    if let Some(minor) = amount_minor {
        body["amount"] = json!(eur(minor).amount().to_string());
        body["currency"] = json!("EUR");
    }
    if let Some(refund_id) = refund_id {
        body["refund_id"] = json!(refund_id);
    }
    let payload = serde_json::to_vec(&body).unwrap();
    let signature = signature::sign(CARD_SECRET, &payload).unwrap();
    (payload, signature)
}

/// A signed redirect gateway notification, stamped now.
pub fn redirect_callback(
    kind: &str,
    reference: &str,
    amount_minor: i64,
    refund: Option<(&str, i64)>,
) -> (Vec<u8>, String) {
    let mut body = json!({
        "type": kind,
        "object": { "id": reference, "amount_minor": amount_minor, "currency": "EUR" },
    });
    if let Some((id, minor)) = refund {
        body["refund"] = json!({ "id": id, "amount_minor": minor });
    }
    let payload = serde_json::to_vec(&body).unwrap();
    let header =
        signature::sign_timestamped(REDIRECT_SECRET, Utc::now().timestamp(), &payload).unwrap();
    (payload, header)
}

/// A `callback` line for the CLI command feed.
pub fn callback_command(gateway: &str, payload: &[u8], signature: &str) -> String {
    json!({
        "type": "callback",
        "gateway": gateway,
        "payload": String::from_utf8_lossy(payload),
        "signature": signature,
    })
    .to_string()
}
