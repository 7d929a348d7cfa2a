use crate::application::registry::ProcessorRegistry;
use crate::application::settlement::Settlement;
use crate::domain::callback::{
    CallbackOutcome, CallbackRecord, CallbackRejection, GatewayEventKind, RejectionReason,
    VerifiedEvent,
};
use crate::domain::order::OrderState;
use crate::domain::payment::{
    FinancialEvent, Payment, PaymentId, TransitionEffect, TransitionRejected,
};
use crate::domain::ports::{CallbackCommit, PaymentStoreRef};
use crate::domain::receipt::ReceiptId;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of ingesting one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackReport {
    pub outcome: CallbackOutcome,
    pub payment: Option<PaymentId>,
    pub order_state: Option<OrderState>,
    pub receipts: Vec<ReceiptId>,
    pub receipt_errors: Vec<String>,
}

impl CallbackReport {
    fn bare(outcome: CallbackOutcome, payment: Option<PaymentId>) -> Self {
        Self {
            outcome,
            payment,
            order_state: None,
            receipts: Vec::new(),
            receipt_errors: Vec::new(),
        }
    }
}

/// One raw notification being processed.
struct Inbound<'a> {
    gateway: &'a str,
    payload: &'a [u8],
    received_at: DateTime<Utc>,
}

/// A parked notification is replayed without writing a new record until it
/// can be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Fresh,
    Replay,
}

/// Verifies, deduplicates and applies gateway notifications.
pub struct CallbackProcessor {
    registry: Arc<ProcessorRegistry>,
    payments: PaymentStoreRef,
    settlement: Arc<Settlement>,
    max_commit_attempts: usize,
}

impl CallbackProcessor {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        payments: PaymentStoreRef,
        settlement: Arc<Settlement>,
        max_commit_attempts: usize,
    ) -> Self {
        Self {
            registry,
            payments,
            settlement,
            max_commit_attempts: max_commit_attempts.max(1),
        }
    }

    /// Processes one notification end to end.
    ///
    /// Unknown gateways and bad signatures are errors (`InvalidProcessor`,
    /// `RejectedCallback`); so are orphans (`OrphanCallback`), which are still
    /// recorded. Every other outcome, including rejections, is reported.
    /// A refund confirmed before the payment collected is parked and applied
    /// by the first transition that makes it applicable.
    pub async fn ingest(
        &self,
        gateway: &str,
        payload: &[u8],
        signature: &str,
    ) -> Result<CallbackReport> {
        let processor = self.registry.resolve(gateway)?;
        let inbound = Inbound {
            gateway: processor.key().as_str(),
            payload,
            received_at: Utc::now(),
        };

        let event = match processor.verify_callback(payload, signature) {
            Ok(event) => event,
            Err(rejection) => return self.reject_unverified(&inbound, rejection).await,
        };

        let mut report = self.apply(&inbound, &event, Delivery::Fresh).await?;
        if matches!(report.outcome, CallbackOutcome::Applied | CallbackOutcome::Parked { .. }) {
            let replayed = self
                .replay_parked(inbound.gateway, &event.external_reference)
                .await?;
            let key = event.dedup_key(inbound.gateway);
            if report.outcome != CallbackOutcome::Applied
                && self.payments.applied_callback(&key).await?.is_some()
            {
                report.outcome = CallbackOutcome::Applied;
            }
            for extra in replayed {
                report.receipts.extend(extra.receipts);
                report.receipt_errors.extend(extra.receipt_errors);
                report.order_state = extra.order_state.or(report.order_state);
            }
        }
        Ok(report)
    }

    /// Applies every parked notification for one gateway reference that the
    /// payment now accepts. Returns the reports of those applied.
    pub async fn replay_parked(
        &self,
        gateway: &str,
        reference: &str,
    ) -> Result<Vec<CallbackReport>> {
        let mut applied = Vec::new();
        loop {
            let mut progressed = false;
            for record in self.payments.parked_callbacks().await? {
                if record.gateway != gateway
                    || record.external_reference.as_deref() != Some(reference)
                {
                    continue;
                }
                let Some(event) = &record.event else {
                    continue;
                };
                let payload = record
                    .payload_bytes()
                    .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
                let inbound = Inbound {
                    gateway,
                    payload: &payload,
                    received_at: Utc::now(),
                };
                let report = self.apply(&inbound, event, Delivery::Replay).await?;
                if report.outcome == CallbackOutcome::Applied {
                    info!(
                        gateway,
                        reference,
                        event = %event.kind,
                        parked_at = %record.received_at,
                        "Parked callback applied"
                    );
                    progressed = true;
                    applied.push(report);
                }
            }
            if !progressed {
                return Ok(applied);
            }
        }
    }

    /// Replays parked notifications for every reference that has any.
    /// Returns how many were applied.
    pub async fn replay_all_parked(&self) -> Result<usize> {
        let mut references: Vec<(String, String)> = self
            .payments
            .parked_callbacks()
            .await?
            .into_iter()
            .filter_map(|record| Some((record.gateway, record.external_reference?)))
            .collect();
        references.sort();
        references.dedup();

        let mut applied = 0;
        for (gateway, reference) in references {
            applied += self.replay_parked(&gateway, &reference).await?.len();
        }
        Ok(applied)
    }

    async fn apply(
        &self,
        inbound: &Inbound<'_>,
        event: &VerifiedEvent,
        delivery: Delivery,
    ) -> Result<CallbackReport> {
        let processor = self.registry.resolve(inbound.gateway)?;
        let key = event.dedup_key(inbound.gateway);

        for attempt in 1..=self.max_commit_attempts {
            let payment = self
                .payments
                .find_by_reference(processor.key(), &event.external_reference)
                .await?;

            if self.payments.applied_callback(&key).await?.is_some() {
                return self
                    .record_duplicate(inbound, event, payment.as_ref().map(|p| p.id))
                    .await;
            }

            let Some(payment) = payment else {
                self.record_rejected(
                    inbound,
                    event,
                    None,
                    RejectionReason::Orphan,
                    "no payment with this reference".to_string(),
                )
                .await?;
                return Err(PaymentError::OrphanCallback {
                    gateway: inbound.gateway.to_string(),
                    reference: event.external_reference.clone(),
                });
            };

            if event.kind == GatewayEventKind::CaptureSucceeded
                && let Some(amount) = event.amount
                && amount != payment.amount
            {
                return self
                    .record_rejected(
                        inbound,
                        event,
                        Some(payment.id),
                        RejectionReason::AmountMismatch,
                        format!("captured {amount}, payment is {}", payment.amount),
                    )
                    .await;
            }

            let transition = match event.transition() {
                Ok(transition) => transition,
                Err(rejection) => {
                    return self
                        .record_rejected(
                            inbound,
                            event,
                            Some(payment.id),
                            RejectionReason::Malformed,
                            rejection.to_string(),
                        )
                        .await;
                }
            };

            let mut updated = payment.clone();
            let financial_event = match updated.apply(transition, inbound.received_at) {
                Ok(TransitionEffect::Applied { event, .. }) => event,
                Ok(TransitionEffect::AlreadyApplied { .. }) => {
                    return self
                        .record_duplicate(inbound, event, Some(payment.id))
                        .await;
                }
                Err(rejected) => {
                    let reason = match &rejected {
                        TransitionRejected::Stale { .. }
                            if event.kind == GatewayEventKind::RefundSucceeded
                                && payment.state.is_open() =>
                        {
                            return self.park(inbound, event, &payment, delivery).await;
                        }
                        TransitionRejected::Stale { .. } => RejectionReason::Stale,
                        TransitionRejected::RefundExceeds { .. } => RejectionReason::RefundExceeds,
                        TransitionRejected::InvalidAmount(_) => RejectionReason::AmountMismatch,
                    };
                    return self
                        .record_rejected(
                            inbound,
                            event,
                            Some(payment.id),
                            reason,
                            rejected.to_string(),
                        )
                        .await;
                }
            };

            // A settled outcome resolves a call that timed out earlier.
            if !updated.state.is_open() && updated.call_timed_out() {
                updated.finish_call();
            }

            let record = CallbackRecord::verified(
                inbound.gateway,
                inbound.payload,
                event,
                Some(payment.id),
                CallbackOutcome::Applied,
                inbound.received_at,
            );
            match self.payments.commit_callback(record, Some(updated)).await? {
                CallbackCommit::Committed(stored) => {
                    let stored = stored.unwrap_or(payment);
                    info!(
                        gateway = inbound.gateway,
                        reference = %event.external_reference,
                        payment = %stored.id,
                        event = %event.kind,
                        state = %stored.state,
                        outcome = "applied",
                        "Callback applied"
                    );
                    return self.settle(stored, financial_event).await;
                }
                CallbackCommit::Duplicate => {
                    return self
                        .record_duplicate(inbound, event, Some(payment.id))
                        .await;
                }
                CallbackCommit::Conflict => {
                    debug!(
                        payment = %payment.id,
                        attempt,
                        "Payment changed concurrently; retrying callback"
                    );
                }
            }
        }
        Err(PaymentError::Conflict(format!("callback {key}")))
    }

    /// Keeps a notification the payment cannot take yet. A replay that is
    /// still too early leaves the existing parked record as it is.
    async fn park(
        &self,
        inbound: &Inbound<'_>,
        event: &VerifiedEvent,
        payment: &Payment,
        delivery: Delivery,
    ) -> Result<CallbackReport> {
        let outcome = CallbackOutcome::Parked {
            detail: format!("payment is {}; waiting for collection", payment.state),
        };
        if delivery == Delivery::Fresh {
            info!(
                gateway = inbound.gateway,
                reference = %event.external_reference,
                payment = %payment.id,
                event = %event.kind,
                outcome = "parked",
                "Callback parked until the payment collects"
            );
            let record = CallbackRecord::verified(
                inbound.gateway,
                inbound.payload,
                event,
                Some(payment.id),
                outcome.clone(),
                inbound.received_at,
            );
            self.payments.commit_callback(record, None).await?;
        }
        Ok(CallbackReport::bare(outcome, Some(payment.id)))
    }

    async fn settle(
        &self,
        payment: Payment,
        event: Option<FinancialEvent>,
    ) -> Result<CallbackReport> {
        let events: Vec<_> = event.into_iter().collect();
        let settled = self.settlement.settle(&payment, &events).await?;
        Ok(CallbackReport {
            outcome: CallbackOutcome::Applied,
            payment: Some(payment.id),
            order_state: Some(settled.order.state),
            receipts: settled.receipts.iter().map(|r| r.id).collect(),
            receipt_errors: settled.receipt_errors,
        })
    }

    async fn reject_unverified(
        &self,
        inbound: &Inbound<'_>,
        rejection: CallbackRejection,
    ) -> Result<CallbackReport> {
        let record = CallbackRecord::unverified(
            inbound.gateway,
            inbound.payload,
            &rejection,
            inbound.received_at,
        );
        let outcome = record.outcome.clone();
        self.payments.commit_callback(record, None).await?;
        warn!(
            gateway = inbound.gateway,
            outcome = outcome.label(),
            reason = %rejection,
            "Callback rejected"
        );
        match rejection {
            CallbackRejection::BadSignature(reason) => Err(PaymentError::RejectedCallback {
                gateway: inbound.gateway.to_string(),
                reason,
            }),
            CallbackRejection::Malformed(_) => Ok(CallbackReport::bare(outcome, None)),
        }
    }

    async fn record_rejected(
        &self,
        inbound: &Inbound<'_>,
        event: &VerifiedEvent,
        payment: Option<PaymentId>,
        reason: RejectionReason,
        detail: String,
    ) -> Result<CallbackReport> {
        warn!(
            gateway = inbound.gateway,
            reference = %event.external_reference,
            event = %event.kind,
            ?reason,
            %detail,
            outcome = "rejected",
            "Callback rejected"
        );
        let outcome = CallbackOutcome::Rejected { reason, detail };
        let record = CallbackRecord::verified(
            inbound.gateway,
            inbound.payload,
            event,
            payment,
            outcome.clone(),
            inbound.received_at,
        );
        self.payments.commit_callback(record, None).await?;
        Ok(CallbackReport::bare(outcome, payment))
    }

    async fn record_duplicate(
        &self,
        inbound: &Inbound<'_>,
        event: &VerifiedEvent,
        payment: Option<PaymentId>,
    ) -> Result<CallbackReport> {
        info!(
            gateway = inbound.gateway,
            reference = %event.external_reference,
            event = %event.kind,
            outcome = "duplicate_ignored",
            "Duplicate callback ignored"
        );
        let record = CallbackRecord::verified(
            inbound.gateway,
            inbound.payload,
            event,
            payment,
            CallbackOutcome::DuplicateIgnored,
            inbound.received_at,
        );
        self.payments.commit_callback(record, None).await?;
        Ok(CallbackReport::bare(CallbackOutcome::DuplicateIgnored, payment))
    }
}
