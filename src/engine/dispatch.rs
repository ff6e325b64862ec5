use std::time::Instant;

use rusqlite::params;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::driver::{AccountStatus, Availability};
use crate::models::identity::Identity;
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::drivers::{load_driver, set_availability};
use crate::store::orders::{append_event, claim_note, load_order, OrderStore};
use crate::store::{to_micros, Database};

/// Result of a claim attempt. Losing a claim race is an expected outcome, not an error.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Order),
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn into_result(self, order_id: i64) -> Result<Order, AppError> {
        match self {
            ClaimOutcome::Claimed(order) => Ok(order),
            ClaimOutcome::AlreadyClaimed => Err(AppError::AlreadyClaimed(order_id)),
        }
    }
}

/// Arbitrates which driver gets an order and closes out deliveries.
#[derive(Clone)]
pub struct DispatchCoordinator {
    db: Database,
    orders: OrderStore,
    metrics: Metrics,
}

impl DispatchCoordinator {
    pub fn new(db: Database, orders: OrderStore, metrics: Metrics) -> Self {
        Self {
            db,
            orders,
            metrics,
        }
    }

    /// Assigns a pending, driverless order to `driver`. The assignment is a
    /// single conditional update, so of any number of concurrent claims for
    /// one order exactly one succeeds. Never retried here. A store timeout can
    /// still have committed the claim; re-read the order before retrying.
    pub async fn claim(&self, order_id: i64, driver: &str) -> Result<ClaimOutcome, AppError> {
        let start = Instant::now();
        let driver_id = driver.to_string();

        let result = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let profile = load_driver(&tx, &driver_id)?;
                if profile.account_status == AccountStatus::Suspended {
                    return Err(AppError::Validation(format!(
                        "driver {driver_id} is suspended"
                    )));
                }

                let changed = tx.execute(
                    "UPDATE orders SET driver = ?1, status = ?2 \
                     WHERE id = ?3 AND status = ?4 AND driver IS NULL",
                    params![driver_id, OrderStatus::Assigned, order_id, OrderStatus::Pending],
                )?;
                if changed == 0 {
                    // Distinguish a lost race from a bad id.
                    load_order(&tx, order_id)?;
                    return Ok(None);
                }

                let event = append_event(
                    &tx,
                    order_id,
                    OrderStatus::Assigned,
                    &claim_note(&driver_id),
                    &Identity::driver(driver_id.clone()),
                )?;
                tx.execute(
                    "UPDATE orders SET assigned_at = ?1 WHERE id = ?2",
                    params![to_micros(event.created_at), order_id],
                )?;
                set_availability(&tx, &driver_id, Availability::OnDelivery)?;
                let order = load_order(&tx, order_id)?;
                tx.commit()?;
                Ok(Some((order, event)))
            })
            .await;

        let outcome_label = match &result {
            Ok(Some(_)) => "claimed",
            Ok(None) => "already_claimed",
            Err(_) => "error",
        };
        self.metrics
            .claim_latency_seconds
            .with_label_values(&[outcome_label])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .claims_total
            .with_label_values(&[outcome_label])
            .inc();

        match result {
            Ok(Some((order, event))) => {
                info!(order_id, driver, "order claimed");
                self.orders.record_transition(&order, event);
                Ok(ClaimOutcome::Claimed(order))
            }
            Ok(None) => {
                info!(order_id, driver, "claim rejected: already claimed");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            Err(err) => {
                warn!(order_id, driver, error = %err, "claim failed");
                Err(err)
            }
        }
    }

    /// Marks the order delivered. The driver's history entry is written in
    /// the same transaction, and the driver goes back to `AVAILABLE` once no
    /// other order is active for them.
    pub async fn complete(&self, order_id: i64, driver: &str) -> Result<Order, AppError> {
        let order = self
            .orders
            .transition(order_id, OrderStatus::Delivered, &Identity::driver(driver))
            .await?;

        info!(order_id, driver, actual_minutes = order.actual_minutes, "delivery completed");
        Ok(order)
    }

    /// Cancels the order. If a driver had it, their history gets a cancelled
    /// entry and they are released.
    pub async fn cancel(&self, order_id: i64, actor: &Identity) -> Result<Order, AppError> {
        let order = self
            .orders
            .transition(order_id, OrderStatus::Cancelled, actor)
            .await?;

        info!(order_id, actor = %actor, "order cancelled");
        Ok(order)
    }
}
