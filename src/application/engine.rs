use crate::application::builder::{PaymentBuilder, PaymentRequest};
use crate::application::callbacks::{CallbackProcessor, CallbackReport};
use crate::application::gateway_call::GatewayCallPolicy;
use crate::application::order_sync::OrderSynchronizer;
use crate::application::receipts::ReceiptBuilder;
use crate::application::registry::{PaymentMethod, ProcessorRegistry};
use crate::application::settlement::{Settled, Settlement};
use crate::config::EngineSettings;
use crate::domain::callback::CallbackRecord;
use crate::domain::money::{Currency, Money};
use crate::domain::order::{Order, OrderDraft, OrderId, OrderPreview, OrderState, PaymentTotals};
use crate::domain::payment::{
    GatewayOperation, IdempotencyKey, Payment, PaymentId, PaymentState, PaymentTransition,
    TransitionEffect,
};
use crate::domain::ports::{OrderStoreRef, PaymentStoreRef, ReceiptStoreRef, Reservation};
use crate::domain::processor::{
    CaptureOutcome, GatewayError, GatewayHandle, OrderContext, PaymentMethodKind, ProcessorRef,
    RefundOutcome, RemoteState,
};
use crate::domain::receipt::Receipt;
use crate::error::{PaymentError, Result};
use crate::infrastructure::in_memory::{
    InMemoryOrderStore, InMemoryPaymentStore, InMemoryReceiptStore,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The storage backends the engine works against.
#[derive(Clone)]
pub struct Stores {
    pub orders: OrderStoreRef,
    pub payments: PaymentStoreRef,
    pub receipts: ReceiptStoreRef,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            orders: Arc::new(InMemoryOrderStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            receipts: Arc::new(InMemoryReceiptStore::new()),
        }
    }
}

/// What the buyer should do next after starting a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NextAction {
    Redirect { url: String },
    Completed,
    AwaitingCallback,
    Failed { reason: String },
    /// A gateway call timed out; the payment awaits re-verification.
    Ambiguous,
}

impl NextAction {
    pub fn of(payment: &Payment) -> Self {
        if payment.call_timed_out() {
            return NextAction::Ambiguous;
        }
        match payment.state {
            PaymentState::Captured | PaymentState::PartiallyRefunded | PaymentState::Refunded => {
                NextAction::Completed
            }
            PaymentState::Failed => NextAction::Failed {
                reason: payment
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
            PaymentState::Pending => match &payment.redirect_url {
                Some(url) => NextAction::Redirect { url: url.clone() },
                None => NextAction::AwaitingCallback,
            },
            PaymentState::Authorized => NextAction::AwaitingCallback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentStart {
    pub payment: Payment,
    pub next_action: NextAction,
    /// False when the idempotency key matched an existing payment.
    pub created: bool,
}

#[derive(Debug, Clone)]
pub enum RefundStatus {
    Completed {
        payment: Payment,
        receipts: Vec<Receipt>,
    },
    /// Accepted by the gateway; confirmed later by callback.
    Pending { payment: Payment, refund_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Parked callbacks applied during the pass.
    pub replayed: usize,
    pub receipts: usize,
    pub reconciliation_failures: usize,
    pub orders: usize,
}

/// Per-order figures for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order: OrderId,
    pub state: OrderState,
    pub currency: Currency,
    pub total: Money,
    pub captured: Money,
    pub refunded: Money,
    pub receipts: usize,
}

/// Entry point for order, payment and callback handling.
///
/// Owns the stores and the processor registry. Every mutation goes through
/// optimistic compare-and-swap, so one engine may be shared across tasks.
pub struct PaymentEngine {
    registry: Arc<ProcessorRegistry>,
    stores: Stores,
    builder: PaymentBuilder,
    settlement: Arc<Settlement>,
    callbacks: CallbackProcessor,
    policy: GatewayCallPolicy,
    max_commit_attempts: usize,
    ambiguity_grace: chrono::Duration,
}

impl PaymentEngine {
    /// Creates a new `PaymentEngine`.
    ///
    /// # Arguments
    ///
    /// * `registry` - Processors available to payments, keyed by stable key.
    /// * `stores` - Order, payment and receipt storage.
    /// * `settings` - Gateway timeouts, retry and concurrency limits.
    pub fn new(registry: ProcessorRegistry, stores: Stores, settings: &EngineSettings) -> Self {
        let registry = Arc::new(registry);
        let max_commit_attempts = settings.max_commit_attempts.max(1);
        let settlement = Arc::new(Settlement::new(
            OrderSynchronizer::new(
                stores.orders.clone(),
                stores.payments.clone(),
                max_commit_attempts,
            ),
            ReceiptBuilder::new(stores.orders.clone(), stores.receipts.clone()),
        ));
        Self {
            builder: PaymentBuilder::new(
                registry.clone(),
                stores.orders.clone(),
                stores.payments.clone(),
            ),
            callbacks: CallbackProcessor::new(
                registry.clone(),
                stores.payments.clone(),
                settlement.clone(),
                max_commit_attempts,
            ),
            policy: GatewayCallPolicy::from_settings(settings),
            ambiguity_grace: chrono::Duration::from_std(settings.ambiguity_grace)
                .unwrap_or(chrono::Duration::MAX),
            max_commit_attempts,
            settlement,
            registry,
            stores,
        }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Validates a draft and prices it without persisting anything.
    pub fn preview(&self, draft: &OrderDraft) -> Result<OrderPreview> {
        draft.preview()
    }

    pub async fn create_order(&self, draft: OrderDraft) -> Result<Order> {
        let order = draft.into_order(Utc::now())?;
        self.stores.orders.insert(order.clone()).await?;
        info!(order = %order.id, total = %order.total, lines = order.lines.len(), "Order created");
        Ok(order)
    }

    pub async fn payment_methods(&self, order_id: OrderId) -> Result<Vec<PaymentMethod>> {
        let order = self.load_order(order_id).await?;
        if !order.state.accepts_payments() {
            return Ok(Vec::new());
        }
        Ok(self.registry.methods_for(order.currency()))
    }

    pub async fn cancel_order(&self, order_id: OrderId) -> Result<Order> {
        self.settlement.orders().cancel(order_id).await
    }

    pub async fn recompute_order(&self, order_id: OrderId) -> Result<Order> {
        self.settlement.orders().recompute(order_id).await
    }

    /// Creates (or reuses) a payment and drives it as far as the gateway
    /// allows synchronously.
    pub async fn start_payment(&self, request: PaymentRequest) -> Result<PaymentStart> {
        let now = Utc::now();
        let (reservation, processor) = self.builder.build(request, now).await?;
        let created = matches!(reservation, Reservation::Created(_));
        let id = reservation.payment().id;
        if created {
            self.settlement
                .orders()
                .recompute(reservation.payment().order_id)
                .await?;
        }

        let claimed = self
            .update_payment(id, |p| {
                (p.state == PaymentState::Pending
                    && p.external_reference.is_none()
                    && p.begin_call(GatewayOperation::Initiate, now))
                .then_some(())
            })
            .await?;
        let Some((payment, ())) = claimed else {
            let payment = self.load_payment(id).await?;
            debug!(payment = %id, state = %payment.state, "Payment already started");
            return Ok(PaymentStart {
                next_action: NextAction::of(&payment),
                payment,
                created,
            });
        };

        let admitted = self
            .settlement
            .orders()
            .admit_payment(payment.order_id)
            .await;
        let order = match admitted {
            Ok(order) => order,
            Err(e @ PaymentError::InvalidOrderState { .. }) => {
                warn!(
                    payment = %id,
                    order = %payment.order_id,
                    "Order stopped accepting payments before initiation"
                );
                let reason = "order no longer accepts payments".to_string();
                self.transition_payment(
                    id,
                    PaymentTransition::Fail { reason },
                    Payment::finish_call,
                )
                .await?;
                return Err(e);
            }
            Err(e) => {
                self.release_call(id).await?;
                return Err(e);
            }
        };
        let context = OrderContext {
            order_id: order.id,
            total: order.total,
            description: format!("order {}", order.id),
        };
        let gateway = processor.key().as_str();
        let handle = self
            .policy
            .call(GatewayOperation::Initiate, gateway, || {
                processor.initiate(&payment, &context)
            })
            .await;

        let payment = match handle {
            Ok(GatewayHandle::Authorized { reference }) => {
                let (payment, _) = self
                    .transition_payment(id, PaymentTransition::Authorize, |p| {
                        p.finish_call();
                        p.external_reference = Some(reference.clone());
                    })
                    .await?;
                info!(payment = %id, gateway, reference = %reference, "Payment authorized");
                if processor.method() == PaymentMethodKind::Card
                    && payment.state == PaymentState::Authorized
                {
                    self.capture_now(&processor, id).await?
                } else {
                    payment
                }
            }
            Ok(GatewayHandle::Captured { reference }) => {
                self.transition_payment(id, PaymentTransition::Capture, |p| {
                    p.finish_call();
                    p.external_reference = Some(reference.clone());
                })
                .await?
                .0
            }
            Ok(GatewayHandle::Redirect { reference, url }) => {
                let updated = self
                    .update_payment(id, |p| {
                        p.finish_call();
                        p.external_reference = Some(reference.clone());
                        p.redirect_url = Some(url.clone());
                        Some(())
                    })
                    .await?;
                info!(
                    payment = %id,
                    gateway,
                    reference = %reference,
                    "Buyer redirected to gateway"
                );
                match updated {
                    Some((payment, ())) => payment,
                    None => self.load_payment(id).await?,
                }
            }
            Ok(GatewayHandle::Declined { reference, reason }) => {
                warn!(payment = %id, gateway, %reason, "Payment declined");
                self.transition_payment(id, PaymentTransition::Fail { reason }, |p| {
                    p.finish_call();
                    if let Some(reference) = &reference {
                        p.external_reference = Some(reference.clone());
                    }
                })
                .await?
                .0
            }
            Err(e) => {
                return Err(self
                    .gateway_failure(id, GatewayOperation::Initiate, gateway, e)
                    .await?);
            }
        };

        Ok(PaymentStart {
            next_action: NextAction::of(&payment),
            payment,
            created,
        })
    }

    /// Synchronous capture of an authorized card payment.
    async fn capture_now(&self, processor: &ProcessorRef, id: PaymentId) -> Result<Payment> {
        let now = Utc::now();
        let claimed = self
            .update_payment(id, |p| {
                (p.state == PaymentState::Authorized
                    && p.begin_call(GatewayOperation::Capture, now))
                .then_some(())
            })
            .await?;
        let Some((payment, ())) = claimed else {
            return self.load_payment(id).await;
        };

        let gateway = processor.key().as_str();
        let outcome = self
            .policy
            .call(GatewayOperation::Capture, gateway, || {
                processor.capture(&payment)
            })
            .await;
        match outcome {
            Ok(CaptureOutcome::Captured) => Ok(self
                .transition_payment(id, PaymentTransition::Capture, Payment::finish_call)
                .await?
                .0),
            Ok(CaptureOutcome::Pending) => {
                info!(payment = %id, gateway, "Capture accepted; awaiting confirmation");
                self.release_call(id).await
            }
            Ok(CaptureOutcome::Declined { reason }) => {
                warn!(payment = %id, gateway, %reason, "Capture declined");
                Ok(self
                    .transition_payment(
                        id,
                        PaymentTransition::Fail { reason },
                        Payment::finish_call,
                    )
                    .await?
                    .0)
            }
            Err(e) => Err(self
                .gateway_failure(id, GatewayOperation::Capture, gateway, e)
                .await?),
        }
    }

    /// Refunds part or all of a captured payment. `refund_key` is passed to
    /// the gateway so a repeated request refunds once.
    pub async fn request_refund(
        &self,
        payment_id: PaymentId,
        amount: Money,
        refund_key: &str,
    ) -> Result<RefundStatus> {
        let refund_key = IdempotencyKey::new(refund_key)?;
        let payment = self.load_payment(payment_id).await?;
        let order = self.load_order(payment.order_id).await?;
        if !order.state.accepts_refunds() {
            return Err(PaymentError::InvalidOrderState {
                order: order.id,
                state: order.state,
                action: "be refunded",
            });
        }
        if amount.currency() != payment.amount.currency() {
            return Err(PaymentError::CurrencyMismatch {
                expected: payment.amount.currency(),
                actual: amount.currency(),
            });
        }
        if !amount.is_positive() {
            return Err(PaymentError::ValidationError(format!(
                "refund amount must be positive, got {amount}"
            )));
        }
        let refundable = payment.refundable()?;
        if amount > refundable {
            return Err(PaymentError::AmountExceeded {
                order: order.id,
                requested: amount,
                remaining: refundable,
            });
        }
        let processor = self.registry.resolve(payment.processor.as_str())?;

        let now = Utc::now();
        let claimed = self
            .update_payment(payment_id, |p| {
                (p.state.has_collected() && p.begin_call(GatewayOperation::Refund, now))
                    .then_some(())
            })
            .await?;
        let Some((payment, ())) = claimed else {
            let current = self.load_payment(payment_id).await?;
            return Err(PaymentError::InvalidPaymentState {
                payment: payment_id,
                state: current.state,
                action: "be refunded while another gateway call is pending",
            });
        };

        let gateway = processor.key().as_str();
        let outcome = self
            .policy
            .call(GatewayOperation::Refund, gateway, || {
                processor.refund(&payment, amount, refund_key.as_str())
            })
            .await;
        match outcome {
            Ok(RefundOutcome::Succeeded { refund_id }) => {
                let (payment, settled) = self
                    .transition_payment(
                        payment_id,
                        PaymentTransition::Refund {
                            refund_id: refund_id.clone(),
                            amount,
                        },
                        Payment::finish_call,
                    )
                    .await?;
                info!(
                    payment = %payment_id,
                    gateway,
                    refund = %refund_id,
                    %amount,
                    "Refund completed"
                );
                Ok(RefundStatus::Completed {
                    payment,
                    receipts: settled.receipts,
                })
            }
            Ok(RefundOutcome::Pending { refund_id }) => {
                info!(
                    payment = %payment_id,
                    gateway,
                    refund = %refund_id,
                    "Refund accepted; awaiting confirmation"
                );
                let payment = self.release_call(payment_id).await?;
                Ok(RefundStatus::Pending { payment, refund_id })
            }
            Ok(RefundOutcome::Declined { reason }) => {
                warn!(payment = %payment_id, gateway, %reason, "Refund declined");
                self.release_call(payment_id).await?;
                Err(PaymentError::GatewayDeclined(reason))
            }
            Err(e) => Err(self
                .gateway_failure(payment_id, GatewayOperation::Refund, gateway, e)
                .await?),
        }
    }

    /// Applies a verified gateway notification.
    pub async fn ingest_callback(
        &self,
        gateway: &str,
        payload: &[u8],
        signature: &str,
    ) -> Result<CallbackReport> {
        self.callbacks.ingest(gateway, payload, signature).await
    }

    /// Payments whose last gateway call has an unknown outcome.
    pub async fn ambiguous_payments(&self) -> Result<Vec<Payment>> {
        let now = Utc::now();
        Ok(self
            .stores
            .payments
            .all()
            .await?
            .into_iter()
            .filter(|p| p.is_ambiguous(now, self.ambiguity_grace))
            .collect())
    }

    /// Asks the gateway for the authoritative state of a payment and applies
    /// it, clearing any pending-call marker.
    pub async fn reverify_payment(&self, payment_id: PaymentId) -> Result<Payment> {
        let payment = self.load_payment(payment_id).await?;
        let processor = self.registry.resolve(payment.processor.as_str())?;
        let gateway = processor.key().as_str();
        let operation = payment
            .pending_call
            .as_ref()
            .map_or(GatewayOperation::Initiate, |call| call.operation);

        let status = match self
            .policy
            .call(operation, gateway, || processor.status(&payment))
            .await
        {
            Ok(status) => status,
            Err(GatewayError::Timeout(_)) => {
                return Err(PaymentError::AmbiguousGatewayOutcome {
                    payment: payment_id,
                    operation,
                });
            }
            Err(e) => return Err(PaymentError::GatewayUnavailable(e.to_string())),
        };

        let mut transitions = Vec::new();
        match status.state {
            RemoteState::Authorized => transitions.push(PaymentTransition::Authorize),
            RemoteState::Captured => transitions.push(PaymentTransition::Capture),
            RemoteState::Failed => transitions.push(PaymentTransition::Fail {
                reason: "failed at gateway".to_string(),
            }),
            RemoteState::Unknown if payment.external_reference.is_none() => {
                transitions.push(PaymentTransition::Fail {
                    reason: "never reached the gateway".to_string(),
                });
            }
            RemoteState::Unknown | RemoteState::Pending => {}
        }
        transitions.extend(status.refunds.iter().map(|refund| PaymentTransition::Refund {
            refund_id: refund.refund_id.clone(),
            amount: refund.amount,
        }));

        let now = Utc::now();
        let updated = self
            .update_payment(payment_id, |p| {
                p.finish_call();
                if p.external_reference.is_none() {
                    p.external_reference = status.reference.clone();
                }
                let mut events = Vec::new();
                for transition in &transitions {
                    match p.apply(transition.clone(), now) {
                        Ok(TransitionEffect::Applied {
                            event: Some(event), ..
                        }) => events.push(event),
                        Ok(_) => {}
                        Err(rejected) => {
                            warn!(
                                payment = %payment_id,
                                reason = %rejected,
                                "Gateway state conflicts with payment"
                            )
                        }
                    }
                }
                Some(events)
            })
            .await?;
        let Some((payment, events)) = updated else {
            return self.load_payment(payment_id).await;
        };
        info!(
            payment = %payment_id,
            gateway,
            remote = ?status.state,
            state = %payment.state,
            "Payment re-verified"
        );
        self.settlement.settle(&payment, &events).await?;
        let payment = self.replay_parked_for(payment).await?;

        if processor.method() == PaymentMethodKind::Card
            && payment.state == PaymentState::Authorized
        {
            return self.capture_now(&processor, payment_id).await;
        }
        Ok(payment)
    }

    /// Applies parked callbacks that have become applicable, issues any
    /// missing receipts and recomputes every order.
    ///
    /// Safe to run at any time; converges state left behind by a crash
    /// between a payment commit and its follow-up work.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            replayed: self.callbacks.replay_all_parked().await?,
            ..RecoveryReport::default()
        };
        for payment in self.stores.payments.all().await? {
            for event in &payment.events {
                match self.settlement.receipts().issue(&payment, event).await {
                    Ok(_) => report.receipts += 1,
                    Err(e) if e.is_internal() => return Err(e),
                    Err(_) => report.reconciliation_failures += 1,
                }
            }
        }
        for order in self.stores.orders.all().await? {
            self.settlement.orders().recompute(order.id).await?;
            report.orders += 1;
        }
        info!(
            replayed = report.replayed,
            receipts = report.receipts,
            failures = report.reconciliation_failures,
            orders = report.orders,
            "Recovery pass complete"
        );
        Ok(report)
    }

    pub async fn order(&self, id: OrderId) -> Result<Option<Order>> {
        self.stores.orders.get(id).await
    }

    pub async fn payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.stores.payments.get(id).await
    }

    pub async fn payments_for(&self, order_id: OrderId) -> Result<Vec<Payment>> {
        self.stores.payments.for_order(order_id).await
    }

    pub async fn receipts_for(&self, payment_id: PaymentId) -> Result<Vec<Receipt>> {
        self.stores.receipts.for_payment(payment_id).await
    }

    pub async fn orders(&self) -> Result<Vec<Order>> {
        self.stores.orders.all().await
    }

    pub async fn payments(&self) -> Result<Vec<Payment>> {
        self.stores.payments.all().await
    }

    pub async fn receipts(&self) -> Result<Vec<Receipt>> {
        self.stores.receipts.all().await
    }

    pub async fn callbacks(&self) -> Result<Vec<CallbackRecord>> {
        self.stores.payments.callbacks().await
    }

    /// Totals per order, in order id order.
    pub async fn order_summaries(&self) -> Result<Vec<OrderSummary>> {
        let receipts = self.stores.receipts.all().await?;
        let mut summaries = Vec::new();
        for order in self.stores.orders.all().await? {
            let payments = self.stores.payments.for_order(order.id).await?;
            let totals = PaymentTotals::of(order.currency(), &payments)?;
            summaries.push(OrderSummary {
                order: order.id,
                state: order.state,
                currency: order.currency(),
                total: order.total,
                captured: totals.captured,
                refunded: totals.refunded,
                receipts: receipts.iter().filter(|r| r.order_id == order.id).count(),
            });
        }
        Ok(summaries)
    }

    async fn load_order(&self, id: OrderId) -> Result<Order> {
        self.stores
            .orders
            .get(id)
            .await?
            .ok_or(PaymentError::OrderNotFound(id))
    }

    async fn load_payment(&self, id: PaymentId) -> Result<Payment> {
        self.stores
            .payments
            .get(id)
            .await?
            .ok_or(PaymentError::PaymentNotFound(id))
    }

    /// Read-modify-write of a payment under compare-and-swap. `change` runs
    /// on a fresh copy each attempt; returning `None` leaves the payment as is.
    async fn update_payment<R, F>(
        &self,
        id: PaymentId,
        mut change: F,
    ) -> Result<Option<(Payment, R)>>
    where
        F: FnMut(&mut Payment) -> Option<R>,
    {
        for attempt in 1..=self.max_commit_attempts {
            let mut payment = self.load_payment(id).await?;
            let Some(result) = change(&mut payment) else {
                return Ok(None);
            };
            match self.stores.payments.compare_and_swap(payment).await? {
                Some(stored) => return Ok(Some((stored, result))),
                None => debug!(payment = %id, attempt, "Payment changed concurrently; retrying"),
            }
        }
        Err(PaymentError::Conflict(format!("payment {id}")))
    }

    /// Applies a gateway reply to a payment, then settles the order.
    async fn transition_payment<F>(
        &self,
        id: PaymentId,
        transition: PaymentTransition,
        mut prepare: F,
    ) -> Result<(Payment, Settled)>
    where
        F: FnMut(&mut Payment),
    {
        let now = Utc::now();
        let updated = self
            .update_payment(id, |p| {
                prepare(p);
                Some(p.apply(transition.clone(), now))
            })
            .await?;
        let Some((payment, effect)) = updated else {
            return Err(PaymentError::PaymentNotFound(id));
        };

        let events = match effect {
            Ok(TransitionEffect::Applied { from, to, event }) => {
                info!(payment = %id, %from, %to, "Payment transitioned");
                event.into_iter().collect()
            }
            Ok(TransitionEffect::AlreadyApplied { .. }) => Vec::new(),
            Err(rejected) => {
                warn!(
                    payment = %id,
                    reason = %rejected,
                    "Gateway reply conflicts with payment state"
                );
                Vec::new()
            }
        };
        let settled = self.settlement.settle(&payment, &events).await?;
        let payment = self.replay_parked_for(payment).await?;
        Ok((payment, settled))
    }

    /// Applies parked callbacks once the payment has collected, returning
    /// the payment as they left it.
    async fn replay_parked_for(&self, payment: Payment) -> Result<Payment> {
        let reference = match payment.external_reference.clone() {
            Some(reference) if payment.state.has_collected() => reference,
            _ => return Ok(payment),
        };
        let applied = self
            .callbacks
            .replay_parked(payment.processor.as_str(), &reference)
            .await?;
        if applied.is_empty() {
            Ok(payment)
        } else {
            self.load_payment(payment.id).await
        }
    }

    async fn release_call(&self, id: PaymentId) -> Result<Payment> {
        match self
            .update_payment(id, |p| {
                p.finish_call();
                Some(())
            })
            .await?
        {
            Some((payment, ())) => Ok(payment),
            None => self.load_payment(id).await,
        }
    }

    /// Records a failed gateway call and converts it into the caller's error.
    ///
    /// Timeouts leave the payment untouched apart from flagging the call.
    /// Exhausted initiate or capture calls fail the payment; a refund call
    /// only releases the marker since the payment already collected.
    async fn gateway_failure(
        &self,
        id: PaymentId,
        operation: GatewayOperation,
        gateway: &str,
        failure: GatewayError,
    ) -> Result<PaymentError> {
        if let GatewayError::Timeout(after) = failure {
            self.update_payment(id, |p| {
                p.mark_call_timed_out();
                Some(())
            })
            .await?;
            warn!(
                payment = %id,
                gateway,
                %operation,
                timeout = ?after,
                "Gateway outcome unknown; payment needs re-verification"
            );
            return Ok(PaymentError::AmbiguousGatewayOutcome {
                payment: id,
                operation,
            });
        }

        error!(payment = %id, gateway, %operation, error = %failure, "Gateway call failed");
        if operation == GatewayOperation::Refund {
            self.release_call(id).await?;
        } else {
            self.transition_payment(
                id,
                PaymentTransition::Fail {
                    reason: failure.to_string(),
                },
                Payment::finish_call,
            )
            .await?;
        }
        Ok(match failure {
            GatewayError::Rejected(reason) => PaymentError::GatewayDeclined(reason),
            other => PaymentError::GatewayUnavailable(other.to_string()),
        })
    }
}
