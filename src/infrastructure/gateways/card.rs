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
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Notification body posted by the card gateway, signed with a hex
/// HMAC-SHA256 of the raw bytes.
#[derive(Debug, Serialize, Deserialize)]
struct CardNotification {
    event: String,
    reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    currency: Option<Currency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refund_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

const EVENTS: [(&str, GatewayEventKind); 5] = [
    ("authorization.succeeded", GatewayEventKind::AuthorizationSucceeded),
    ("authorization.failed", GatewayEventKind::AuthorizationFailed),
    ("capture.succeeded", GatewayEventKind::CaptureSucceeded),
    ("capture.failed", GatewayEventKind::CaptureFailed),
    ("refund.succeeded", GatewayEventKind::RefundSucceeded),
];

/// Card gateway: authorizes synchronously, then the engine captures.
pub struct CardGateway {
    key: ProcessorKey,
    secret: String,
    currencies: Vec<Currency>,
    transport: Arc<dyn GatewayTransport>,
}

impl CardGateway {
    pub fn new(
        key: &str,
        secret: &str,
        currencies: Vec<Currency>,
        transport: Arc<dyn GatewayTransport>,
    ) -> Self {
        Self {
            key: ProcessorKey::from(key),
            secret: secret.to_string(),
            currencies,
            transport,
        }
    }

    /// Builds a signed notification the way the gateway would send it.
    pub fn encode_callback(
        &self,
        event: &VerifiedEvent,
    ) -> Result<(Vec<u8>, String), SignatureError> {
        let name = EVENTS
            .iter()
            .find(|(_, kind)| *kind == event.kind)
            .map(|(name, _)| *name)
            .unwrap_or("unknown");
        let notification = CardNotification {
            event: name.to_string(),
            reference: event.external_reference.clone(),
            amount: event.amount.map(|m| m.amount()),
            currency: event.amount.map(|m| m.currency()),
            refund_id: event.refund_id.clone(),
            reason: event.reason.clone(),
        };
        let payload = serde_json::to_vec(&notification).map_err(|_| SignatureError::InvalidFormat)?;
        let signature = signature::sign(self.secret.as_bytes(), &payload)?;
        Ok((payload, signature))
    }

    fn reference(payment: &Payment) -> Result<&str, GatewayError> {
        payment.external_reference.as_deref().ok_or_else(|| {
            GatewayError::Rejected(format!("payment {} has no gateway reference", payment.id))
        })
    }
}

#[async_trait]
impl Processor for CardGateway {
    fn key(&self) -> &ProcessorKey {
        &self.key
    }

    fn method(&self) -> PaymentMethodKind {
        PaymentMethodKind::Card
    }

    fn supports(&self, currency: Currency) -> bool {
        self.currencies.contains(&currency)
    }

    async fn initiate(
        &self,
        payment: &Payment,
        _order: &OrderContext,
    ) -> Result<GatewayHandle, GatewayError> {
        let charge = self
            .transport
            .create_charge(&payment.id.to_string(), payment.amount, ChargeMode::Authorize)
            .await?;
        Ok(match charge.state {
            RemoteState::Captured => GatewayHandle::Captured {
                reference: charge.reference,
            },
            RemoteState::Failed => GatewayHandle::Declined {
                reference: Some(charge.reference),
                reason: charge
                    .decline_reason
                    .unwrap_or_else(|| "declined".to_string()),
            },
            RemoteState::Authorized | RemoteState::Pending | RemoteState::Unknown => {
                GatewayHandle::Authorized {
                    reference: charge.reference,
                }
            }
        })
    }

    async fn capture(&self, payment: &Payment) -> Result<CaptureOutcome, GatewayError> {
        let charge = self
            .transport
            .capture_charge(Self::reference(payment)?)
            .await?;
        Ok(match charge.state {
            RemoteState::Captured => CaptureOutcome::Captured,
            RemoteState::Failed => CaptureOutcome::Declined {
                reason: charge
                    .decline_reason
                    .unwrap_or_else(|| "capture declined".to_string()),
            },
            RemoteState::Authorized | RemoteState::Pending | RemoteState::Unknown => {
                CaptureOutcome::Pending
            }
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
            Ok(receipt) if receipt.settled => Ok(RefundOutcome::Succeeded {
                refund_id: receipt.refund_id,
            }),
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
        signature::verify(self.secret.as_bytes(), payload, signature)
            .map_err(|e| CallbackRejection::BadSignature(e.to_string()))?;

        let notification: CardNotification = serde_json::from_slice(payload)
            .map_err(|e| CallbackRejection::Malformed(e.to_string()))?;
        let kind = EVENTS
            .iter()
            .find(|(name, _)| *name == notification.event)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                CallbackRejection::Malformed(format!("unknown event `{}`", notification.event))
            })?;
        let amount = match (notification.amount, notification.currency) {
            (Some(amount), Some(currency)) => Some(
                Money::new(amount, currency)
                    .map_err(|e| CallbackRejection::Malformed(e.to_string()))?,
            ),
            (None, None) => None,
            _ => {
                return Err(CallbackRejection::Malformed(
                    "amount and currency must come together".to_string(),
                ));
            }
        };

        Ok(VerifiedEvent {
            kind,
            external_reference: notification.reference,
            amount,
            refund_id: notification.refund_id,
            reason: notification.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::OrderId;
    use crate::domain::payment::{IdempotencyKey, PaymentId};
    use crate::infrastructure::gateways::transport::{Fault, SimulatedGateway};
    use chrono::Utc;

    fn gateway() -> (CardGateway, Arc<SimulatedGateway>) {
        let sim = Arc::new(SimulatedGateway::new("gateway_a"));
        (
            CardGateway::new("gateway_a", "secret", vec![Currency::Eur], sim.clone()),
            sim,
        )
    }

    fn payment() -> Payment {
        Payment::new(
            PaymentId(1),
            OrderId(1),
            ProcessorKey::from("gateway_a"),
            Money::from_minor(10000, Currency::Eur),
            IdempotencyKey::new("k1").unwrap(),
            Utc::now(),
        )
    }

    fn context() -> OrderContext {
        OrderContext {
            order_id: OrderId(1),
            total: Money::from_minor(10000, Currency::Eur),
            description: "order 1".into(),
        }
    }

    #[tokio::test]
    async fn test_authorize_then_capture() {
        let (gateway, _) = gateway();
        let mut payment = payment();
        let handle = gateway.initiate(&payment, &context()).await.unwrap();
        assert_eq!(
            handle,
            GatewayHandle::Authorized {
                reference: "gateway_a-1".into()
            }
        );
        payment.external_reference = handle.reference().map(str::to_string);
        assert_eq!(gateway.capture(&payment).await.unwrap(), CaptureOutcome::Captured);

        let status = gateway.status(&payment).await.unwrap();
        assert_eq!(status.state, RemoteState::Captured);
    }

    #[tokio::test]
    async fn test_refund_decline_is_an_outcome() {
        let (gateway, sim) = gateway();
        let mut payment = payment();
        gateway.initiate(&payment, &context()).await.unwrap();
        payment.external_reference = Some("gateway_a-1".into());
        gateway.capture(&payment).await.unwrap();

        sim.script([Fault::Decline("insufficient balance".into())])
            .await;
        let outcome = gateway
            .refund(&payment, Money::from_minor(100, Currency::Eur), "rk")
            .await
            .unwrap();
        assert!(matches!(outcome, RefundOutcome::Declined { .. }));
    }

    #[test]
    fn test_callback_roundtrip_through_signature() {
        let (gateway, _) = gateway();
        let event = VerifiedEvent {
            kind: GatewayEventKind::RefundSucceeded,
            external_reference: "gateway_a-1".into(),
            amount: Some(Money::from_minor(4000, Currency::Eur)),
            refund_id: Some("rf-1".into()),
            reason: None,
        };
        let (payload, signature) = gateway.encode_callback(&event).unwrap();
        assert_eq!(gateway.verify_callback(&payload, &signature).unwrap(), event);
    }

    #[test]
    fn test_callback_rejections() {
        let (gateway, _) = gateway();
        let payload = br#"{"event":"capture.succeeded","reference":"gateway_a-1"}"#;
        assert!(matches!(
            gateway.verify_callback(payload, "deadbeef"),
            Err(CallbackRejection::BadSignature(_))
        ));

        let garbage = b"not json";
        let signature = signature::sign(b"secret", garbage).unwrap();
        assert!(matches!(
            gateway.verify_callback(garbage, &signature),
            Err(CallbackRejection::Malformed(_))
        ));

        let unknown = br#"{"event":"chargeback","reference":"gateway_a-1"}"#;
        let signature = signature::sign(b"secret", unknown).unwrap();
        assert!(matches!(
            gateway.verify_callback(unknown, &signature),
            Err(CallbackRejection::Malformed(_))
        ));
    }
}
