use crate::application::engine::PaymentEngine;
use crate::error::PaymentError;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

/// HTTP-style answer returned to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub status: u16,
    pub body: String,
}

impl Acknowledgement {
    fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }

    /// The gateway should stop redelivering this notification.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Receives raw gateway notifications and answers them.
///
/// Every processed notification is acknowledged with 200, whatever its
/// business outcome. Only a failed signature (401), an unknown gateway (404)
/// or a storage failure (500) is refused, the latter so the gateway retries.
#[derive(Clone)]
pub struct WebhookEndpoint {
    engine: Arc<PaymentEngine>,
}

impl WebhookEndpoint {
    pub fn new(engine: Arc<PaymentEngine>) -> Self {
        Self { engine }
    }

    pub async fn receive(&self, gateway: &str, payload: &[u8], signature: &str) -> Acknowledgement {
        match self
            .engine
            .ingest_callback(gateway, payload, signature)
            .await
        {
            Ok(report) => Acknowledgement::new(
                200,
                serde_json::to_value(&report).unwrap_or_else(|_| json!({ "status": "processed" })),
            ),
            Err(PaymentError::OrphanCallback { reference, .. }) => Acknowledgement::new(
                200,
                json!({ "outcome": "rejected", "reason": "orphan", "reference": reference }),
            ),
            Err(PaymentError::RejectedCallback { reason, .. }) => {
                Acknowledgement::new(401, json!({ "error": reason }))
            }
            Err(PaymentError::InvalidProcessor(key)) => {
                warn!(gateway = %key, "Callback for unknown gateway");
                Acknowledgement::new(404, json!({ "error": format!("unknown gateway `{key}`") }))
            }
            Err(e) if e.is_internal() => {
                error!(gateway, error = %e, "Callback could not be stored");
                Acknowledgement::new(500, json!({ "error": "internal error" }))
            }
            Err(e) => {
                warn!(gateway, error = %e, "Callback processed with error");
                Acknowledgement::new(200, json!({ "outcome": "rejected", "reason": e.to_string() }))
            }
        }
    }
}
