use crate::domain::order::{Order, OrderId, OrderState, PaymentTotals, derive_state};
use crate::domain::ports::{OrderStoreRef, PaymentStoreRef};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

/// Keeps each order's state in line with its payments.
///
/// Every attempt re-reads the order and its payments, so concurrent callers
/// converge on the same derived state; writes use the order version.
pub struct OrderSynchronizer {
    orders: OrderStoreRef,
    payments: PaymentStoreRef,
    max_attempts: usize,
}

impl OrderSynchronizer {
    pub fn new(orders: OrderStoreRef, payments: PaymentStoreRef, max_attempts: usize) -> Self {
        Self {
            orders,
            payments,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn load(&self, id: OrderId) -> Result<Order> {
        self.orders
            .get(id)
            .await?
            .ok_or(PaymentError::OrderNotFound(id))
    }

    /// Recomputes the order state from current payments. Idempotent.
    pub async fn recompute(&self, id: OrderId) -> Result<Order> {
        for attempt in 1..=self.max_attempts {
            let order = self.load(id).await?;
            let payments = self.payments.for_order(id).await?;

            if order.state == OrderState::Cancelled {
                let totals = PaymentTotals::of(order.currency(), &payments)?;
                if totals.captured.is_positive() {
                    warn!(
                        order = %id,
                        captured = %totals.captured,
                        "Funds captured on a cancelled order; manual refund required"
                    );
                }
                return Ok(order);
            }

            let derived = derive_state(&order, &payments)?;
            if derived == order.state {
                return Ok(order);
            }
            if !order.state.can_advance_to(derived) {
                warn!(
                    order = %id,
                    from = %order.state,
                    to = %derived,
                    "Ignoring backwards order transition"
                );
                return Ok(order);
            }

            let from = order.state;
            let mut next = order;
            next.state = derived;
            next.updated_at = Utc::now();
            match self.orders.compare_and_swap(next).await? {
                Some(stored) => {
                    info!(order = %id, %from, to = %stored.state, "Order state updated");
                    return Ok(stored);
                }
                None => debug!(order = %id, attempt, "Order changed concurrently; retrying"),
            }
        }
        Err(PaymentError::Conflict(format!("order {id}")))
    }

    /// Confirms the order still accepts payments and bumps its version, so a
    /// cancel racing with this call re-reads the payments before it commits.
    pub async fn admit_payment(&self, id: OrderId) -> Result<Order> {
        for attempt in 1..=self.max_attempts {
            let order = self.load(id).await?;
            if !order.state.accepts_payments() {
                return Err(PaymentError::InvalidOrderState {
                    order: id,
                    state: order.state,
                    action: "accept payments",
                });
            }
            match self.orders.compare_and_swap(order).await? {
                Some(stored) => return Ok(stored),
                None => debug!(order = %id, attempt, "Order changed concurrently; retrying"),
            }
        }
        Err(PaymentError::Conflict(format!("order {id}")))
    }

    /// Explicit cancel, allowed only before any payment authorized or
    /// collected and while no gateway call is in flight.
    pub async fn cancel(&self, id: OrderId) -> Result<Order> {
        for attempt in 1..=self.max_attempts {
            let order = self.load(id).await?;
            if order.state == OrderState::Cancelled {
                return Ok(order);
            }
            let payments = self.payments.for_order(id).await?;
            if !order.can_cancel(&payments) {
                return Err(PaymentError::InvalidOrderState {
                    order: id,
                    state: order.state,
                    action: "be cancelled",
                });
            }

            let mut next = order;
            next.state = OrderState::Cancelled;
            next.updated_at = Utc::now();
            match self.orders.compare_and_swap(next).await? {
                Some(stored) => {
                    info!(order = %id, "Order cancelled");
                    return Ok(stored);
                }
                None => debug!(order = %id, attempt, "Order changed concurrently; retrying"),
            }
        }
        Err(PaymentError::Conflict(format!("order {id}")))
    }
}
