use crate::domain::money::Money;
use crate::domain::payment::{PaymentId, PaymentTransition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Semantic gateway events, independent of any gateway's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    AuthorizationSucceeded,
    AuthorizationFailed,
    CaptureSucceeded,
    CaptureFailed,
    RefundSucceeded,
}

impl GatewayEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GatewayEventKind::AuthorizationSucceeded => "authorization_succeeded",
            GatewayEventKind::AuthorizationFailed => "authorization_failed",
            GatewayEventKind::CaptureSucceeded => "capture_succeeded",
            GatewayEventKind::CaptureFailed => "capture_failed",
            GatewayEventKind::RefundSucceeded => "refund_succeeded",
        }
    }
}

impl fmt::Display for GatewayEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback whose signature checked out and whose payload parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedEvent {
    pub kind: GatewayEventKind,
    pub external_reference: String,
    pub amount: Option<Money>,
    pub refund_id: Option<String>,
    pub reason: Option<String>,
}

impl VerifiedEvent {
    /// Refunds are keyed by their gateway refund id so distinct refunds of
    /// one payment are distinct events.
    pub fn event_type(&self) -> String {
        match (&self.kind, &self.refund_id) {
            (GatewayEventKind::RefundSucceeded, Some(refund_id)) => {
                format!("{}:{}", self.kind, refund_id)
            }
            (kind, _) => kind.as_str().to_string(),
        }
    }

    pub fn dedup_key(&self, gateway: &str) -> DedupKey {
        DedupKey {
            gateway: gateway.to_string(),
            external_reference: self.external_reference.clone(),
            event_type: self.event_type(),
        }
    }

    pub fn transition(&self) -> Result<PaymentTransition, CallbackRejection> {
        let transition = match self.kind {
            GatewayEventKind::AuthorizationSucceeded => PaymentTransition::Authorize,
            GatewayEventKind::CaptureSucceeded => PaymentTransition::Capture,
            GatewayEventKind::AuthorizationFailed | GatewayEventKind::CaptureFailed => {
                PaymentTransition::Fail {
                    reason: self
                        .reason
                        .clone()
                        .unwrap_or_else(|| self.kind.as_str().to_string()),
                }
            }
            GatewayEventKind::RefundSucceeded => {
                let refund_id = self.refund_id.clone().ok_or_else(|| {
                    CallbackRejection::Malformed("refund event without refund id".to_string())
                })?;
                let amount = self.amount.ok_or_else(|| {
                    CallbackRejection::Malformed("refund event without amount".to_string())
                })?;
                PaymentTransition::Refund { refund_id, amount }
            }
        };
        Ok(transition)
    }
}

/// Identity of a semantic event for replay detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub gateway: String,
    pub external_reference: String,
    pub event_type: String,
}

impl DedupKey {
    pub fn storage_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.gateway, self.external_reference, self.event_type
        )
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.gateway, self.external_reference, self.event_type
        )
    }
}

/// Why a processor refused to turn a raw callback into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackRejection {
    #[error("bad signature: {0}")]
    BadSignature(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCheck {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    BadSignature,
    Malformed,
    Orphan,
    Stale,
    AmountMismatch,
    RefundExceeds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied,
    DuplicateIgnored,
    /// Verified but not applicable yet, such as a refund confirmed before the
    /// capture. Replayed once the payment moves.
    Parked {
        detail: String,
    },
    Rejected {
        reason: RejectionReason,
        detail: String,
    },
}

impl CallbackOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CallbackOutcome::Applied => "applied",
            CallbackOutcome::DuplicateIgnored => "duplicate_ignored",
            CallbackOutcome::Parked { .. } => "parked",
            CallbackOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// How `CallbackRecord::payload` holds the raw body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Hex,
}

/// Audit entry for one inbound notification. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub gateway: String,
    /// The body as received; hex encoded when it is not valid UTF-8.
    pub payload: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    pub signature: SignatureCheck,
    pub dedup_key: Option<DedupKey>,
    pub external_reference: Option<String>,
    pub payment_id: Option<PaymentId>,
    /// The verified event, kept so a parked notification can be replayed
    /// without its signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<VerifiedEvent>,
    pub outcome: CallbackOutcome,
    pub received_at: DateTime<Utc>,
}

fn encode_payload(payload: &[u8]) -> (String, PayloadEncoding) {
    match std::str::from_utf8(payload) {
        Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
        Err(_) => (hex::encode(payload), PayloadEncoding::Hex),
    }
}

impl CallbackRecord {
    pub fn unverified(
        gateway: &str,
        payload: &[u8],
        rejection: &CallbackRejection,
        received_at: DateTime<Utc>,
    ) -> Self {
        let (signature, reason) = match rejection {
            CallbackRejection::BadSignature(_) => {
                (SignatureCheck::Invalid, RejectionReason::BadSignature)
            }
            CallbackRejection::Malformed(_) => (SignatureCheck::Valid, RejectionReason::Malformed),
        };
        let (payload, payload_encoding) = encode_payload(payload);
        Self {
            gateway: gateway.to_string(),
            payload,
            payload_encoding,
            signature,
            dedup_key: None,
            external_reference: None,
            payment_id: None,
            event: None,
            outcome: CallbackOutcome::Rejected {
                reason,
                detail: rejection.to_string(),
            },
            received_at,
        }
    }

    pub fn verified(
        gateway: &str,
        payload: &[u8],
        event: &VerifiedEvent,
        payment_id: Option<PaymentId>,
        outcome: CallbackOutcome,
        received_at: DateTime<Utc>,
    ) -> Self {
        let (payload, payload_encoding) = encode_payload(payload);
        Self {
            gateway: gateway.to_string(),
            payload,
            payload_encoding,
            signature: SignatureCheck::Valid,
            dedup_key: Some(event.dedup_key(gateway)),
            external_reference: Some(event.external_reference.clone()),
            payment_id,
            event: Some(event.clone()),
            outcome,
            received_at,
        }
    }

    /// The body exactly as the gateway sent it.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.payload.clone().into_bytes()),
            PayloadEncoding::Hex => hex::decode(&self.payload),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.outcome == CallbackOutcome::Applied
    }

    pub fn is_parked(&self) -> bool {
        matches!(self.outcome, CallbackOutcome::Parked { .. })
    }
}
