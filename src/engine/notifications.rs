use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rusqlite::params;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::orders::{load_order, row_to_order, ORDER_COLUMNS};
use crate::store::Database;

/// Tracks which delivered orders a customer has already been told about.
#[derive(Clone)]
pub struct NotificationGate {
    db: Database,
    sessions: Arc<DashMap<Uuid, JoinHandle<()>>>,
    metrics: Metrics,
}

impl NotificationGate {
    pub fn new(db: Database, metrics: Metrics) -> Self {
        Self {
            db,
            sessions: Arc::new(DashMap::new()),
            metrics,
        }
    }

    pub async fn has_unnotified(&self, customer: &str) -> Result<bool, AppError> {
        let customer = customer.to_string();
        self.db
            .call(move |conn| {
                let found: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM orders \
                     WHERE customer = ?1 AND status = ?2 AND delivered_notified = 0)",
                    params![customer, OrderStatus::Delivered],
                    |row| row.get(0),
                )?;
                Ok(found)
            })
            .await
    }

    /// Returns how many orders were newly marked. Calling it again without a
    /// new delivery in between marks nothing.
    pub async fn mark_notified(&self, customer: &str) -> Result<usize, AppError> {
        let customer_id = customer.to_string();
        let marked = self
            .db
            .call(move |conn| {
                let marked = conn.execute(
                    "UPDATE orders SET delivered_notified = 1 \
                     WHERE customer = ?1 AND status = ?2 AND delivered_notified = 0",
                    params![customer_id, OrderStatus::Delivered],
                )?;
                Ok(marked)
            })
            .await?;

        if marked > 0 {
            info!(customer, marked, "customer notified");
        }
        Ok(marked)
    }

    /// Marks every pending delivery notification for the customer and returns
    /// the orders that were marked, in delivery order.
    pub async fn take_unnotified(&self, customer: &str) -> Result<Vec<Order>, AppError> {
        let customer_id = customer.to_string();
        let orders = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM orders \
                         WHERE customer = ?1 AND status = ?2 AND delivered_notified = 0 \
                         ORDER BY delivered_at ASC, id ASC",
                    )?;
                    let ids = stmt
                        .query_map(params![customer_id, OrderStatus::Delivered], |row| {
                            row.get::<_, i64>(0)
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                };

                let mut orders = Vec::with_capacity(ids.len());
                for id in ids {
                    tx.execute(
                        "UPDATE orders SET delivered_notified = 1 WHERE id = ?1",
                        params![id],
                    )?;
                    orders.push(load_order(&tx, id)?);
                }
                tx.commit()?;
                Ok(orders)
            })
            .await?;

        if !orders.is_empty() {
            info!(customer, marked = orders.len(), "customer notified");
        }
        Ok(orders)
    }

    /// Delivered orders the customer has not been told about yet, in delivery
    /// order. Nothing is marked.
    pub async fn unnotified(&self, customer: &str) -> Result<Vec<Order>, AppError> {
        let customer = customer.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders \
                     WHERE customer = ?1 AND status = ?2 AND delivered_notified = 0 \
                     ORDER BY delivered_at ASC, id ASC"
                ))?;
                let orders = stmt
                    .query_map(params![customer, OrderStatus::Delivered], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(orders)
            })
            .await
    }

    /// Marks only the listed orders, and only those still unmarked.
    pub async fn acknowledge(
        &self,
        customer: &str,
        order_ids: &[i64],
    ) -> Result<usize, AppError> {
        let customer_id = customer.to_string();
        let order_ids = order_ids.to_vec();
        let marked = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut marked = 0;
                for id in order_ids {
                    marked += tx.execute(
                        "UPDATE orders SET delivered_notified = 1 \
                         WHERE id = ?1 AND customer = ?2 AND status = ?3 \
                         AND delivered_notified = 0",
                        params![id, customer_id, OrderStatus::Delivered],
                    )?;
                }
                tx.commit()?;
                Ok(marked)
            })
            .await?;

        if marked > 0 {
            info!(customer, marked, "customer notified");
        }
        Ok(marked)
    }

    /// Polls for delivered orders on behalf of one customer session. Each batch
    /// goes out on the returned channel and stays unmarked until the receiver
    /// calls [`NotificationBatch::ack`], so a batch that never reaches the
    /// customer is offered again to the next session. The poll ends when the
    /// session is stopped, a batch is dropped unacknowledged, the receiver is
    /// dropped, or the store fails.
    pub fn start_polling(
        &self,
        customer: &str,
        interval: Duration,
    ) -> (Uuid, mpsc::Receiver<NotificationBatch>) {
        let session = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(16);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let gate = self.clone();
        let customer = customer.to_string();
        let handle = tokio::spawn(async move {
            if registered_rx.await.is_err() {
                return;
            }
            gate.poll_loop(session, &customer, interval, tx).await;
            if gate.sessions.remove(&session).is_some() {
                gate.metrics.notification_polls_active.dec();
            }
        });

        self.sessions.insert(session, handle);
        self.metrics.notification_polls_active.inc();
        let _ = registered_tx.send(());

        (session, rx)
    }

    /// Cancels a poll session. Returns false if it had already ended.
    pub fn stop_polling(&self, session: Uuid) -> bool {
        match self.sessions.remove(&session) {
            Some((_, handle)) => {
                handle.abort();
                self.metrics.notification_polls_active.dec();
                info!(session = %session, "notification poll stopped");
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn poll_loop(
        &self,
        session: Uuid,
        customer: &str,
        interval: Duration,
        tx: mpsc::Sender<NotificationBatch>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(session = %session, customer, "notification poll started");

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let delivered = match self.has_unnotified(customer).await {
                Ok(false) => continue,
                Ok(true) => self.unnotified(customer).await,
                Err(err) => Err(err),
            };
            let orders = match delivered {
                Ok(orders) if orders.is_empty() => continue,
                Ok(orders) => orders,
                Err(err) => {
                    warn!(
                        session = %session,
                        customer,
                        error = %err,
                        "notification poll failed; stopping"
                    );
                    break;
                }
            };

            let order_ids: Vec<i64> = orders.iter().map(|order| order.id).collect();
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(NotificationBatch { orders, ack: ack_tx }).await.is_err() {
                break;
            }
            if ack_rx.await.is_err() {
                info!(
                    session = %session,
                    customer,
                    "notification batch not acknowledged; stopping"
                );
                break;
            }

            if let Err(err) = self.acknowledge(customer, &order_ids).await {
                warn!(
                    session = %session,
                    customer,
                    error = %err,
                    "notification poll failed; stopping"
                );
                break;
            }
        }
    }
}

/// Delivered orders handed to one poll session. Dropping the batch without
/// acknowledging it leaves the orders unnotified.
#[derive(Debug)]
pub struct NotificationBatch {
    pub orders: Vec<Order>,
    ack: oneshot::Sender<()>,
}

impl NotificationBatch {
    /// Confirms the orders reached the customer.
    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}
