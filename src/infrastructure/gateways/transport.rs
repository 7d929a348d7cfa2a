use crate::domain::money::Money;
use crate::domain::processor::{GatewayError, RemoteRefund, RemoteState};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// A charge as the remote gateway sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharge {
    pub reference: String,
    pub amount: Money,
    pub state: RemoteState,
    pub decline_reason: Option<String>,
    pub refunds: Vec<RemoteRefund>,
}

/// How a new charge proceeds after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeMode {
    /// Funds are held until an explicit capture.
    Authorize,
    /// Authorized and captured in one step.
    AutoCapture,
    /// The buyer completes payment on a hosted page; the charge stays pending.
    Hosted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_id: String,
    /// False when the gateway accepted the refund but settles it later.
    pub settled: bool,
}

/// Wire-level operations shared by the shipped gateway integrations.
///
/// `token` is the client idempotency token: repeating a call with the same
/// token never creates a second charge or refund.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn create_charge(
        &self,
        token: &str,
        amount: Money,
        mode: ChargeMode,
    ) -> Result<RemoteCharge, GatewayError>;

    async fn capture_charge(&self, reference: &str) -> Result<RemoteCharge, GatewayError>;

    async fn refund_charge(
        &self,
        reference: &str,
        refund_key: &str,
        amount: Money,
    ) -> Result<RefundReceipt, GatewayError>;

    async fn lookup(&self, token: &str) -> Result<Option<RemoteCharge>, GatewayError>;
}

/// Scripted misbehaviour for the next call to a `SimulatedGateway`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// No misbehaviour for this call.
    Pass,
    /// Fails with a transient error; nothing happens remotely.
    Unavailable,
    /// The gateway refuses the charge, capture or refund.
    Decline(String),
    /// Never answers within `Duration`; nothing happens remotely.
    Hang(Duration),
    /// Performs the operation but answers too late.
    ApplyThenHang(Duration),
    /// Captures and refunds are accepted but settled asynchronously.
    Deferred,
}

#[derive(Default)]
struct Ledger {
    charges: HashMap<String, RemoteCharge>,
    tokens: HashMap<String, String>,
    refunds: HashMap<String, (String, RemoteRefund)>,
    faults: VecDeque<Fault>,
    next_refund: u64,
    calls: usize,
}

/// In-process stand-in for a remote gateway.
///
/// Keeps its own ledger of charges and refunds and honours idempotency
/// tokens, so retries and re-verification behave like against a real one.
pub struct SimulatedGateway {
    prefix: String,
    ledger: Mutex<Ledger>,
}

impl SimulatedGateway {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Queues faults consumed one per call, in order.
    pub async fn script(&self, faults: impl IntoIterator<Item = Fault>) {
        self.ledger.lock().await.faults.extend(faults);
    }

    pub async fn calls(&self) -> usize {
        self.ledger.lock().await.calls
    }

    pub async fn charge(&self, reference: &str) -> Option<RemoteCharge> {
        self.ledger.lock().await.charges.get(reference).cloned()
    }

    /// Moves a charge to a final state, as when a buyer finishes (or
    /// abandons) an off-site payment.
    pub async fn settle(&self, reference: &str, state: RemoteState) {
        if let Some(charge) = self.ledger.lock().await.charges.get_mut(reference) {
            charge.state = state;
        }
    }

    async fn begin(&self) -> Option<Fault> {
        let mut ledger = self.ledger.lock().await;
        ledger.calls += 1;
        ledger.faults.pop_front()
    }

    async fn before(&self, fault: &Option<Fault>) -> Result<(), GatewayError> {
        match fault {
            Some(Fault::Unavailable) => {
                Err(GatewayError::Unavailable(format!("{} returned 503", self.prefix)))
            }
            Some(Fault::Hang(delay)) => {
                tokio::time::sleep(*delay).await;
                Err(GatewayError::Unavailable(format!("{} hung up", self.prefix)))
            }
            _ => Ok(()),
        }
    }

    async fn after(fault: &Option<Fault>) {
        if let Some(Fault::ApplyThenHang(delay)) = fault {
            tokio::time::sleep(*delay).await;
        }
    }
}

#[async_trait]
impl GatewayTransport for SimulatedGateway {
    async fn create_charge(
        &self,
        token: &str,
        amount: Money,
        mode: ChargeMode,
    ) -> Result<RemoteCharge, GatewayError> {
        let fault = self.begin().await;
        self.before(&fault).await?;

        let charge = {
            let mut ledger = self.ledger.lock().await;
            if let Some(reference) = ledger.tokens.get(token).cloned()
                && let Some(existing) = ledger.charges.get(&reference)
            {
                existing.clone()
            } else {
                let reference = format!("{}-{}", self.prefix, token);
                let (state, decline_reason) = match &fault {
                    Some(Fault::Decline(reason)) => (RemoteState::Failed, Some(reason.clone())),
                    _ => match mode {
                        ChargeMode::Authorize => (RemoteState::Authorized, None),
                        ChargeMode::AutoCapture => (RemoteState::Captured, None),
                        ChargeMode::Hosted => (RemoteState::Pending, None),
                    },
                };
                let charge = RemoteCharge {
                    reference: reference.clone(),
                    amount,
                    state,
                    decline_reason,
                    refunds: Vec::new(),
                };
                ledger.tokens.insert(token.to_string(), reference.clone());
                ledger.charges.insert(reference, charge.clone());
                charge
            }
        };

        Self::after(&fault).await;
        Ok(charge)
    }

    async fn capture_charge(&self, reference: &str) -> Result<RemoteCharge, GatewayError> {
        let fault = self.begin().await;
        self.before(&fault).await?;

        let charge = {
            let mut ledger = self.ledger.lock().await;
            let charge = ledger.charges.get_mut(reference).ok_or_else(|| {
                GatewayError::Rejected(format!("no such charge `{reference}`"))
            })?;
            match (&fault, charge.state) {
                (_, RemoteState::Captured | RemoteState::Failed) => {}
                (Some(Fault::Decline(reason)), _) => {
                    charge.state = RemoteState::Failed;
                    charge.decline_reason = Some(reason.clone());
                }
                (Some(Fault::Deferred), _) => charge.state = RemoteState::Pending,
                _ => charge.state = RemoteState::Captured,
            }
            charge.clone()
        };

        Self::after(&fault).await;
        Ok(charge)
    }

    async fn refund_charge(
        &self,
        reference: &str,
        refund_key: &str,
        amount: Money,
    ) -> Result<RefundReceipt, GatewayError> {
        let fault = self.begin().await;
        self.before(&fault).await?;
        if let Some(Fault::Decline(reason)) = &fault {
            return Err(GatewayError::Rejected(reason.clone()));
        }

        let receipt = {
            let mut ledger = self.ledger.lock().await;
            if let Some((_, refund)) = ledger.refunds.get(refund_key) {
                RefundReceipt {
                    refund_id: refund.refund_id.clone(),
                    settled: fault != Some(Fault::Deferred),
                }
            } else {
                ledger.next_refund += 1;
                let refund = RemoteRefund {
                    refund_id: format!("{}-rf-{}", self.prefix, ledger.next_refund),
                    amount,
                };
                let charge = ledger.charges.get_mut(reference).ok_or_else(|| {
                    GatewayError::Rejected(format!("no such charge `{reference}`"))
                })?;
                if charge.state != RemoteState::Captured {
                    return Err(GatewayError::Rejected(format!(
                        "charge `{reference}` is not captured"
                    )));
                }
                charge.refunds.push(refund.clone());
                let refund_id = refund.refund_id.clone();
                ledger
                    .refunds
                    .insert(refund_key.to_string(), (reference.to_string(), refund));
                RefundReceipt {
                    refund_id,
                    settled: fault != Some(Fault::Deferred),
                }
            }
        };

        Self::after(&fault).await;
        Ok(receipt)
    }

    async fn lookup(&self, token: &str) -> Result<Option<RemoteCharge>, GatewayError> {
        let fault = self.begin().await;
        self.before(&fault).await?;
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .tokens
            .get(token)
            .and_then(|reference| ledger.charges.get(reference))
            .cloned())
    }
}
