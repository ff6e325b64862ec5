use std::time::Duration;

use tokio::sync::broadcast;

use crate::engine::dispatch::DispatchCoordinator;
use crate::engine::notifications::NotificationGate;
use crate::models::order::OrderUpdate;
use crate::observability::metrics::Metrics;
use crate::store::drivers::DriverLedger;
use crate::store::orders::OrderStore;
use crate::store::Database;

pub struct AppState {
    pub db: Database,
    pub orders: OrderStore,
    pub drivers: DriverLedger,
    pub dispatch: DispatchCoordinator,
    pub notifications: NotificationGate,
    pub order_updates_tx: broadcast::Sender<OrderUpdate>,
    pub notify_poll_interval: Duration,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(db: Database, event_buffer_size: usize, notify_poll_interval: Duration) -> Self {
        let (order_updates_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        let metrics = Metrics::new();

        let orders = OrderStore::new(db.clone(), order_updates_tx.clone(), metrics.clone());
        let drivers = DriverLedger::new(db.clone());
        let dispatch = DispatchCoordinator::new(db.clone(), orders.clone(), metrics.clone());
        let notifications = NotificationGate::new(db.clone(), metrics.clone());

        Self {
            db,
            orders,
            drivers,
            dispatch,
            notifications,
            order_updates_tx,
            notify_poll_interval,
            metrics,
        }
    }
}
