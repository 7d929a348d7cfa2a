use super::signature::{self, SignatureError};
use super::transport::{ChargeMode, GatewayTransport};
use crate::domain::callback::{CallbackRejection, GatewayEventKind, VerifiedEvent};
use crate::domain::money::{Currency, Money};
use crate::domain::payment::{Payment, ProcessorKey};
use crate::domain::processor::{
    CaptureOutcome, GatewayError, GatewayHandle, GatewayStatus, OrderContext, PaymentMethodKind,
    Processor, RefundOutcome, RemoteState,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct RedirectObject {
    id: String,
    amount_minor: i64,
    currency: Currency,
}

#[derive(Debug, Serialize, Deserialize)]
struct RedirectRefund {
    id: String,
    amount_minor: i64,
}

/// Notification body posted by the redirect gateway. The signature header is
/// `t=<unix seconds>,v1=<hex hmac of "<t>.<body>">`.
#[derive(Debug, Serialize, Deserialize)]
struct RedirectNotification {
    #[serde(rename = "type")]
    kind: String,
    object: RedirectObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refund: Option<RedirectRefund>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure_message: Option<String>,
}

const EVENTS: [(&str, GatewayEventKind); 5] = [
    ("PAYMENT_AUTHORIZED", GatewayEventKind::AuthorizationSucceeded),
    ("PAYMENT_FAILED", GatewayEventKind::AuthorizationFailed),
    ("PAYMENT_CAPTURED", GatewayEventKind::CaptureSucceeded),
    ("CAPTURE_FAILED", GatewayEventKind::CaptureFailed),
    ("REFUND_SUCCEEDED", GatewayEventKind::RefundSucceeded),
];

/// Hosted-page gateway: the buyer pays off-site and the result arrives by
/// callback only.
pub struct RedirectGateway {
    key: ProcessorKey,
    secret: String,
    currencies: Vec<Currency>,
    base_url: String,
    tolerance: Duration,
    transport: Arc<dyn GatewayTransport>,
}

impl RedirectGateway {
    pub fn new(
        key: &str,
        secret: &str,
        currencies: Vec<Currency>,
        base_url: &str,
        tolerance: Duration,
        transport: Arc<dyn GatewayTransport>,
    ) -> Self {
        Self {
            key: ProcessorKey::from(key),
            secret: secret.to_string(),
            currencies,
            base_url: base_url.trim_end_matches('/').to_string(),
            tolerance,
            transport,
        }
    }

    /// Builds a signed notification stamped with the current time.
    pub fn encode_callback(
        &self,
        event: &VerifiedEvent,
        currency: Currency,
    ) -> Result<(Vec<u8>, String), SignatureError> {
        let name = EVENTS
            .iter()
            .find(|(_, kind)| *kind == event.kind)
            .map(|(name, _)| *name)
            .unwrap_or("UNKNOWN");
        let minor = match event.amount {
            Some(amount) => amount
                .minor_units()
                .map_err(|_| SignatureError::InvalidFormat)?,
            None => 0,
        };
        let notification = RedirectNotification {
            kind: name.to_string(),
            object: RedirectObject {
                id: event.external_reference.clone(),
                amount_minor: if event.refund_id.is_some() { 0 } else { minor },
                currency,
            },
            refund: event.refund_id.as_ref().map(|id| RedirectRefund {
                id: id.clone(),
                amount_minor: minor,
            }),
            failure_message: event.reason.clone(),
        };
        let payload = serde_json::to_vec(&notification).map_err(|_| SignatureError::InvalidFormat)?;
        let header =
            signature::sign_timestamped(self.secret.as_bytes(), Utc::now().timestamp(), &payload)?;
        Ok((payload, header))
    }

    fn reference(payment: &Payment) -> Result<&str, GatewayError> {
        payment.external_reference.as_deref().ok_or_else(|| {
            GatewayError::Rejected(format!("payment {} has no gateway reference", payment.id))
        })
    }
}

#[async_trait]
impl Processor for RedirectGateway {
    fn key(&self) -> &ProcessorKey {
        &self.key
    }

    fn method(&self) -> PaymentMethodKind {
        PaymentMethodKind::Redirect
    }

    fn supports(&self, currency: Currency) -> bool {
        self.currencies.contains(&currency)
    }

    async fn initiate(
        &self,
        payment: &Payment,
        order: &OrderContext,
    ) -> Result<GatewayHandle, GatewayError> {
        let charge = self
            .transport
            .create_charge(&payment.id.to_string(), payment.amount, ChargeMode::Hosted)
            .await?;
        if charge.state == RemoteState::Failed {
            return Ok(GatewayHandle::Declined {
                reference: Some(charge.reference),
                reason: charge
                    .decline_reason
                    .unwrap_or_else(|| "declined".to_string()),
            });
        }
        let url = format!(
            "{}/checkout/{}?order={}",
            self.base_url, charge.reference, order.order_id
        );
        Ok(GatewayHandle::Redirect {
            reference: charge.reference,
            url,
        })
    }

    async fn capture(&self, payment: &Payment) -> Result<CaptureOutcome, GatewayError> {
        // Capture happens on the hosted page; report what the gateway knows.
        let charge = self.transport.lookup(&payment.id.to_string()).await?;
        Ok(match charge.map(|c| (c.state, c.decline_reason)) {
            Some((RemoteState::Captured, _)) => CaptureOutcome::Captured,
            Some((RemoteState::Failed, reason)) => CaptureOutcome::Declined {
                reason: reason.unwrap_or_else(|| "payment failed".to_string()),
            },
            _ => CaptureOutcome::Pending,
        })
    }

    async fn refund(
        &self,
        payment: &Payment,
        amount: Money,
        refund_key: &str,
    ) -> Result<RefundOutcome, GatewayError> {
        match self
            .transport
            .refund_charge(Self::reference(payment)?, refund_key, amount)
            .await
        {
            // Hosted refunds always settle through a callback.
            Ok(receipt) => Ok(RefundOutcome::Pending {
                refund_id: receipt.refund_id,
            }),
            Err(GatewayError::Rejected(reason)) => Ok(RefundOutcome::Declined { reason }),
            Err(e) => Err(e),
        }
    }

    async fn status(&self, payment: &Payment) -> Result<GatewayStatus, GatewayError> {
        let charge = self.transport.lookup(&payment.id.to_string()).await?;
        Ok(match charge {
            Some(charge) => GatewayStatus {
                reference: Some(charge.reference),
                state: charge.state,
                refunds: charge.refunds,
            },
            None => GatewayStatus {
                reference: None,
                state: RemoteState::Unknown,
                refunds: Vec::new(),
            },
        })
    }

    fn verify_callback(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<VerifiedEvent, CallbackRejection> {
        signature::verify_timestamped(
            self.secret.as_bytes(),
            signature,
            payload,
            Utc::now().timestamp(),
            self.tolerance,
        )
        .map_err(|e| CallbackRejection::BadSignature(e.to_string()))?;

        let notification: RedirectNotification = serde_json::from_slice(payload)
            .map_err(|e| CallbackRejection::Malformed(e.to_string()))?;
        let kind = EVENTS
            .iter()
            .find(|(name, _)| *name == notification.kind)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                CallbackRejection::Malformed(format!("unknown type `{}`", notification.kind))
            })?;

        let currency = notification.object.currency;
        let (amount, refund_id) = match notification.refund {
            Some(refund) => (
                Some(Money::from_minor(refund.amount_minor, currency)),
                Some(refund.id),
            ),
            None if notification.object.amount_minor > 0 => (
                Some(Money::from_minor(notification.object.amount_minor, currency)),
                None,
            ),
            None => (None, None),
        };

        Ok(VerifiedEvent {
            kind,
            external_reference: notification.object.id,
            amount,
            refund_id,
            reason: notification.failure_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderId;
    use crate::domain::payment::{IdempotencyKey, PaymentId};
    use crate::infrastructure::gateways::transport::SimulatedGateway;

    fn gateway() -> RedirectGateway {
        RedirectGateway::new(
            "gateway_b",
            "secret",
            vec![Currency::Eur],
            "https://pay.example.test/",
            Duration::from_secs(300),
            Arc::new(SimulatedGateway::new("gateway_b")),
        )
    }

    #[tokio::test]
    async fn test_initiate_returns_redirect_url() {
        let gateway = gateway();
        let payment = Payment::new(
            PaymentId(3),
            OrderId(9),
            ProcessorKey::from("gateway_b"),
            Money::from_minor(500, Currency::Eur),
            IdempotencyKey::new("k").unwrap(),
            Utc::now(),
        );
        let context = OrderContext {
            order_id: OrderId(9),
            total: Money::from_minor(500, Currency::Eur),
            description: "order 9".into(),
        };
        let handle = gateway.initiate(&payment, &context).await.unwrap();
        assert_eq!(
            handle,
            GatewayHandle::Redirect {
                reference: "gateway_b-3".into(),
                url: "https://pay.example.test/checkout/gateway_b-3?order=9".into(),
            }
        );
        assert_eq!(gateway.capture(&payment).await.unwrap(), CaptureOutcome::Pending);
    }

    #[test]
    fn test_capture_callback_roundtrip() {
        let gateway = gateway();
        let event = VerifiedEvent {
            kind: GatewayEventKind::CaptureSucceeded,
            external_reference: "gateway_b-3".into(),
            amount: Some(Money::from_minor(500, Currency::Eur)),
            refund_id: None,
            reason: None,
        };
        let (payload, header) = gateway.encode_callback(&event, Currency::Eur).unwrap();
        assert!(header.starts_with("t="));
        assert_eq!(gateway.verify_callback(&payload, &header).unwrap(), event);
    }

    #[test]
    fn test_stale_signature_is_rejected() {
        let gateway = gateway();
        let payload = br#"{"type":"PAYMENT_CAPTURED","object":{"id":"gateway_b-3","amount_minor":500,"currency":"EUR"}}"#;
        let header = signature::sign_timestamped(b"secret", 1_000, payload).unwrap();
        assert!(matches!(
            gateway.verify_callback(payload, &header),
            Err(CallbackRejection::BadSignature(_))
        ));
    }
}
