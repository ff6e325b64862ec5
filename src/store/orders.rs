use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::engine::pricing::estimated_minutes;
use crate::error::AppError;
use crate::models::identity::{Identity, Role};
use crate::models::order::{
    GeoPoint, NewOrder, NewOrderItem, Order, OrderItem, OrderStatus, OrderStatusEvent, OrderUpdate,
};
use crate::observability::metrics::Metrics;
use crate::store::drivers::settle;
use crate::store::{from_micros, opt_from_micros, to_micros, Database};

pub(crate) const ORDER_COLUMNS: &str = "id, customer, restaurant_name, restaurant_address, \
    restaurant_lat, restaurant_lng, delivery_address, delivery_lat, delivery_lng, item_count, total, \
    special_instructions, payment_method, status, driver, created_at, assigned_at, picked_up_at, \
    delivered_at, estimated_minutes, actual_minutes, delivered_notified";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// History views.
    #[default]
    NewestFirst,
    /// Dispatch fairness.
    OldestFirst,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::NewestFirst => "ORDER BY created_at DESC, id DESC",
            SortOrder::OldestFirst => "ORDER BY created_at ASC, id ASC",
        }
    }
}

/// Owns order records, their items, and the append-only status log.
#[derive(Clone)]
pub struct OrderStore {
    db: Database,
    updates_tx: broadcast::Sender<OrderUpdate>,
    metrics: Metrics,
}

impl OrderStore {
    pub fn new(db: Database, updates_tx: broadcast::Sender<OrderUpdate>, metrics: Metrics) -> Self {
        Self {
            db,
            updates_tx,
            metrics,
        }
    }

    pub async fn create(&self, order: NewOrder) -> Result<i64, AppError> {
        validate_new_order(&order)?;

        let estimate = estimated_minutes(
            order.total,
            order.restaurant_location.as_ref(),
            order.delivery_location.as_ref(),
        );
        let actor = Identity::customer(order.customer.clone());

        let (id, event) = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = to_micros(Utc::now());
                tx.execute(
                    "INSERT INTO orders (customer, restaurant_name, restaurant_address, \
                     restaurant_lat, restaurant_lng, delivery_address, delivery_lat, delivery_lng, \
                     item_count, total, special_instructions, payment_method, status, created_at, \
                     estimated_minutes) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        order.customer,
                        order.restaurant_name,
                        order.restaurant_address,
                        order.restaurant_location.map(|p| p.lat),
                        order.restaurant_location.map(|p| p.lng),
                        order.delivery_address,
                        order.delivery_location.map(|p| p.lat),
                        order.delivery_location.map(|p| p.lng),
                        order.item_count,
                        order.total,
                        order.special_instructions,
                        order.payment_method,
                        OrderStatus::Pending,
                        now,
                        estimate,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                let event = append_event(
                    &tx,
                    id,
                    OrderStatus::Pending,
                    &format!("order placed, estimated {estimate} min"),
                    &actor,
                )?;
                tx.commit()?;
                Ok((id, event))
            })
            .await?;

        self.metrics.orders_created_total.inc();
        self.metrics
            .order_transitions_total
            .with_label_values(&[OrderStatus::Pending.as_str()])
            .inc();
        info!(order_id = id, estimated_minutes = estimate, "order created");

        let order = self.get(id).await?;
        self.publish(&order, event);
        Ok(id)
    }

    pub async fn add_item(&self, order_id: i64, item: NewOrderItem) -> Result<OrderItem, AppError> {
        if item.quantity < 1 {
            return Err(AppError::Validation("item quantity must be at least 1".to_string()));
        }
        if !item.unit_price.is_finite() || item.unit_price < 0.0 {
            return Err(AppError::Validation("item price must be >= 0".to_string()));
        }

        self.db
            .call(move |conn| {
                load_order(conn, order_id)?;
                conn.execute(
                    "INSERT INTO order_items (order_id, name, quantity, unit_price, note) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![order_id, item.name, item.quantity, item.unit_price, item.note],
                )?;
                Ok(OrderItem {
                    id: conn.last_insert_rowid(),
                    order_id,
                    name: item.name,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    note: item.note,
                })
            })
            .await
    }

    pub async fn transition(
        &self,
        order_id: i64,
        next: OrderStatus,
        actor: &Identity,
    ) -> Result<Order, AppError> {
        let actor = actor.clone();
        let (order, event) = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = load_order(&tx, order_id)?;
                let event = apply_transition(&tx, &current, next, &actor)?;
                let updated = load_order(&tx, order_id)?;
                tx.commit()?;
                Ok((updated, event))
            })
            .await?;

        self.record_transition(&order, event);
        Ok(order)
    }

    pub async fn get(&self, order_id: i64) -> Result<Order, AppError> {
        self.db.call(move |conn| load_order(conn, order_id)).await
    }

    pub async fn items(&self, order_id: i64) -> Result<Vec<OrderItem>, AppError> {
        self.db
            .call(move |conn| {
                load_order(conn, order_id)?;
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, name, quantity, unit_price, note \
                     FROM order_items WHERE order_id = ?1 ORDER BY id ASC",
                )?;
                let items = stmt
                    .query_map(params![order_id], |row| {
                        Ok(OrderItem {
                            id: row.get(0)?,
                            order_id: row.get(1)?,
                            name: row.get(2)?,
                            quantity: row.get(3)?,
                            unit_price: row.get(4)?,
                            note: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await
    }

    /// Status log of one order, oldest first.
    pub async fn events(&self, order_id: i64) -> Result<Vec<OrderStatusEvent>, AppError> {
        self.db
            .call(move |conn| {
                load_order(conn, order_id)?;
                let mut stmt = conn.prepare(
                    "SELECT id, order_id, status, note, actor, created_at \
                     FROM order_status_events WHERE order_id = ?1 ORDER BY id ASC",
                )?;
                let events = stmt
                    .query_map(params![order_id], row_to_event)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await
    }

    pub async fn by_customer(
        &self,
        customer: &str,
        sort: SortOrder,
    ) -> Result<Vec<Order>, AppError> {
        self.select_orders("customer = ?1", customer.to_string(), sort)
            .await
    }

    pub async fn by_driver(&self, driver: &str, sort: SortOrder) -> Result<Vec<Order>, AppError> {
        self.select_orders("driver = ?1", driver.to_string(), sort)
            .await
    }

    pub async fn pending(&self, sort: SortOrder) -> Result<Vec<Order>, AppError> {
        self.select_orders("status = ?1", OrderStatus::Pending.as_str().to_string(), sort)
            .await
    }

    /// The driver's longest-running assigned or in-progress order.
    pub async fn oldest_active_for(&self, driver: &str) -> Result<Option<Order>, AppError> {
        let driver = driver.to_string();
        self.db
            .call(move |conn| oldest_active(conn, &driver))
            .await
    }

    pub async fn status_counts(&self) -> Result<Vec<(OrderStatus, i64)>, AppError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM orders GROUP BY status ORDER BY status",
                )?;
                let counts = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(counts)
            })
            .await
    }

    /// Metrics, logging and fan-out for a committed status change.
    pub(crate) fn record_transition(&self, order: &Order, event: OrderStatusEvent) {
        self.metrics
            .order_transitions_total
            .with_label_values(&[event.status.as_str()])
            .inc();
        info!(
            order_id = order.id,
            status = %event.status,
            actor = %event.actor,
            "order transitioned"
        );
        self.publish(order, event);
    }

    fn publish(&self, order: &Order, event: OrderStatusEvent) {
        let _ = self.updates_tx.send(OrderUpdate {
            customer: order.customer.clone(),
            driver: order.driver.clone(),
            event,
        });
    }

    async fn select_orders(
        &self,
        predicate: &'static str,
        value: String,
        sort: SortOrder,
    ) -> Result<Vec<Order>, AppError> {
        self.db
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE {predicate} {}",
                    sort.sql()
                );
                let mut stmt = conn.prepare(&sql)?;
                let orders = stmt
                    .query_map(params![value], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(orders)
            })
            .await
    }
}

fn validate_new_order(order: &NewOrder) -> Result<(), AppError> {
    let required = [
        ("customer", &order.customer),
        ("restaurant_name", &order.restaurant_name),
        ("restaurant_address", &order.restaurant_address),
        ("delivery_address", &order.delivery_address),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(AppError::Validation(format!("{field} cannot be empty")));
        }
    }

    if !order.total.is_finite() || order.total < 0.0 {
        return Err(AppError::Validation("total must be >= 0".to_string()));
    }
    if order.item_count == 0 {
        return Err(AppError::Validation("item_count must be > 0".to_string()));
    }

    for (field, point) in [
        ("restaurant_location", &order.restaurant_location),
        ("delivery_location", &order.delivery_location),
    ] {
        if let Some(point) = point {
            if !point.is_valid() {
                return Err(AppError::Validation(format!(
                    "{field} is not a valid coordinate pair"
                )));
            }
        }
    }

    Ok(())
}

pub(crate) fn load_order(conn: &Connection, order_id: i64) -> Result<Order, AppError> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        row_to_order,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
}

pub(crate) fn oldest_active(conn: &Connection, driver: &str) -> Result<Option<Order>, AppError> {
    let order = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders \
                 WHERE driver = ?1 AND status IN ('ASSIGNED', 'IN_PROGRESS') \
                 ORDER BY created_at ASC, id ASC LIMIT 1"
            ),
            params![driver],
            row_to_order,
        )
        .optional()?;
    Ok(order)
}

/// Appends one status log row. Timestamps within an order never repeat or
/// go backwards, even when the wall clock does.
pub(crate) fn append_event(
    conn: &Connection,
    order_id: i64,
    status: OrderStatus,
    note: &str,
    actor: &Identity,
) -> Result<OrderStatusEvent, AppError> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(created_at) FROM order_status_events WHERE order_id = ?1",
        params![order_id],
        |row| row.get(0),
    )?;
    let now = to_micros(Utc::now());
    let created_at = match last {
        Some(last) if last >= now => last + 1,
        _ => now,
    };
    let actor = actor.to_string();

    conn.execute(
        "INSERT INTO order_status_events (order_id, status, note, actor, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![order_id, status, note, actor, created_at],
    )?;

    Ok(OrderStatusEvent {
        id: conn.last_insert_rowid(),
        order_id,
        status,
        note: note.to_string(),
        actor,
        created_at: from_micros(created_at),
    })
}

/// Moves `current` to `next` if that is a legal edge, stamping the matching
/// timestamp and logging the change. The update is conditioned on the status
/// `current` was read with, so a concurrent change makes this one fail.
/// Reaching `DELIVERED` or `CANCELLED` also settles the holding driver's
/// history and availability in the same transaction.
fn apply_transition(
    conn: &Connection,
    current: &Order,
    next: OrderStatus,
    actor: &Identity,
) -> Result<OrderStatusEvent, AppError> {
    if next == OrderStatus::Assigned {
        return Err(AppError::Validation(
            "orders are assigned by claiming them".to_string(),
        ));
    }
    if !current.status.can_transition_to(next) {
        return Err(AppError::InvalidTransition {
            from: current.status,
            to: next,
        });
    }
    authorize(current, next, actor)?;

    let event = append_event(conn, current.id, next, &transition_note(next, actor), actor)?;
    let stamp = to_micros(event.created_at);

    let changed = match next {
        OrderStatus::InProgress => conn.execute(
            "UPDATE orders SET status = ?1, picked_up_at = ?2 WHERE id = ?3 AND status = ?4",
            params![next, stamp, current.id, current.status],
        )?,
        OrderStatus::Delivered => {
            let actual_minutes = (event.created_at - current.created_at).num_seconds() / 60;
            conn.execute(
                "UPDATE orders SET status = ?1, delivered_at = ?2, actual_minutes = ?3 \
                 WHERE id = ?4 AND status = ?5",
                params![next, stamp, actual_minutes, current.id, current.status],
            )?
        }
        _ => conn.execute(
            "UPDATE orders SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![next, current.id, current.status],
        )?,
    };

    if changed == 0 {
        return Err(AppError::InvalidTransition {
            from: current.status,
            to: next,
        });
    }

    if next.is_terminal() {
        settle(conn, current, next, event.created_at)?;
    }

    Ok(event)
}

/// Drivers move only their own orders. Customers may only cancel their own.
fn authorize(current: &Order, next: OrderStatus, actor: &Identity) -> Result<(), AppError> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Driver if current.driver.as_deref() == Some(actor.username.as_str()) => Ok(()),
        Role::Driver => Err(AppError::Validation(format!(
            "order {} is not assigned to driver {}",
            current.id, actor.username
        ))),
        Role::Customer if next == OrderStatus::Cancelled && current.customer == actor.username => {
            Ok(())
        }
        Role::Customer => Err(AppError::Validation(format!(
            "customer {} cannot move order {} to {next}",
            actor.username, current.id
        ))),
    }
}

fn transition_note(next: OrderStatus, actor: &Identity) -> String {
    match next {
        OrderStatus::Pending => "order placed".to_string(),
        OrderStatus::Assigned => format!("claimed by {}", actor.username),
        OrderStatus::InProgress => format!("picked up by {}", actor.username),
        OrderStatus::Delivered => format!("delivered by {}", actor.username),
        OrderStatus::Cancelled => format!("cancelled by {}", actor.username),
    }
}

pub(crate) fn claim_note(driver: &str) -> String {
    transition_note(OrderStatus::Assigned, &Identity::driver(driver))
}

fn location(lat: Option<f64>, lng: Option<f64>) -> Option<GeoPoint> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
        _ => None,
    }
}

pub(crate) fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        customer: row.get(1)?,
        restaurant_name: row.get(2)?,
        restaurant_address: row.get(3)?,
        restaurant_location: location(row.get(4)?, row.get(5)?),
        delivery_address: row.get(6)?,
        delivery_location: location(row.get(7)?, row.get(8)?),
        item_count: row.get(9)?,
        total: row.get(10)?,
        special_instructions: row.get(11)?,
        payment_method: row.get(12)?,
        status: row.get(13)?,
        driver: row.get(14)?,
        created_at: from_micros(row.get(15)?),
        assigned_at: opt_from_micros(row.get(16)?),
        picked_up_at: opt_from_micros(row.get(17)?),
        delivered_at: opt_from_micros(row.get(18)?),
        estimated_minutes: row.get(19)?,
        actual_minutes: row.get(20)?,
        delivered_notified: row.get(21)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<OrderStatusEvent> {
    Ok(OrderStatusEvent {
        id: row.get(0)?,
        order_id: row.get(1)?,
        status: row.get(2)?,
        note: row.get(3)?,
        actor: row.get(4)?,
        created_at: from_micros(row.get(5)?),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::sync::broadcast;

    use super::{OrderStore, SortOrder};
    use crate::error::AppError;
    use crate::models::driver::Availability;
    use crate::models::identity::Identity;
    use crate::models::order::{GeoPoint, NewOrder, NewOrderItem, OrderStatus};
    use crate::observability::metrics::Metrics;
    use crate::store::drivers::tests::new_driver;
    use crate::store::drivers::DriverLedger;
    use crate::store::Database;

    pub(crate) fn new_order(customer: &str, total: f64) -> NewOrder {
        NewOrder {
            customer: customer.to_string(),
            restaurant_name: "Luigi's".to_string(),
            restaurant_address: "1 Main St".to_string(),
            restaurant_location: Some(GeoPoint { lat: 0.0, lng: 10.0 }),
            delivery_address: "9 Elm St".to_string(),
            delivery_location: Some(GeoPoint {
                lat: 0.2698,
                lng: 10.0,
            }),
            item_count: 2,
            total,
            special_instructions: None,
            payment_method: "CARD".to_string(),
        }
    }

    async fn store() -> OrderStore {
        let db = Database::open_in_memory().await.unwrap();
        let (tx, _rx) = broadcast::channel(16);
        OrderStore::new(db, tx, Metrics::new())
    }

    async fn ledger(store: &OrderStore, drivers: &[&str]) -> DriverLedger {
        let ledger = DriverLedger::new(store.db.clone());
        for driver in drivers {
            ledger.register(new_driver(driver)).await.unwrap();
        }
        ledger
    }

    /// Puts an order straight into ASSIGNED for tests that do not go through claim.
    async fn force_assign(store: &OrderStore, order_id: i64, driver: &str) {
        let driver = driver.to_string();
        store
            .db
            .call(move |conn| {
                conn.execute(
                    "UPDATE orders SET status = 'ASSIGNED', driver = ?1 WHERE id = ?2",
                    rusqlite::params![driver, order_id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_stamps_estimate_and_creation_event() {
        let store = store().await;
        let id = store.create(new_order("alice", 45.0)).await.unwrap();

        let order = store.get(id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.driver.is_none());
        assert_eq!(order.estimated_minutes, 30 + 60);
        assert!(!order.delivered_notified);

        let events = store.events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OrderStatus::Pending);
        assert_eq!(events[0].actor, "customer:alice");
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let store = store().await;
        let first = store.create(new_order("alice", 10.0)).await.unwrap();
        let second = store.create(new_order("bob", 10.0)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn create_rejects_malformed_input() {
        let store = store().await;

        let mut negative = new_order("alice", -1.0);
        assert!(matches!(
            store.create(negative.clone()).await,
            Err(AppError::Validation(_))
        ));

        negative.total = 5.0;
        negative.item_count = 0;
        assert!(matches!(
            store.create(negative).await,
            Err(AppError::Validation(_))
        ));

        let mut bad_coords = new_order("alice", 5.0);
        bad_coords.delivery_location = Some(GeoPoint {
            lat: f64::NAN,
            lng: 1.0,
        });
        assert!(matches!(
            store.create(bad_coords).await,
            Err(AppError::Validation(_))
        ));

        assert!(store.pending(SortOrder::OldestFirst).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_item_checks_order_and_quantity() {
        let store = store().await;
        let id = store.create(new_order("alice", 12.0)).await.unwrap();

        let item = NewOrderItem {
            name: "Margherita".to_string(),
            quantity: 2,
            unit_price: 6.0,
            note: Some("extra basil".to_string()),
        };
        store.add_item(id, item.clone()).await.unwrap();

        assert!(matches!(
            store.add_item(id + 100, item.clone()).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            store
                .add_item(
                    id,
                    NewOrderItem {
                        quantity: 0,
                        ..item
                    }
                )
                .await,
            Err(AppError::Validation(_))
        ));

        let items = store.items(id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].note.as_deref(), Some("extra basil"));
    }

    #[tokio::test]
    async fn transition_cannot_skip_or_assign() {
        let store = store().await;
        let id = store.create(new_order("alice", 12.0)).await.unwrap();
        let admin = Identity::admin("root");

        assert!(matches!(
            store.transition(id, OrderStatus::InProgress, &admin).await,
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.transition(id, OrderStatus::Assigned, &admin).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            store.transition(999, OrderStatus::Cancelled, &admin).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delivered_order_is_frozen() {
        let store = store().await;
        ledger(&store, &["dave"]).await;
        let id = store.create(new_order("alice", 12.0)).await.unwrap();
        force_assign(&store, id, "dave").await;
        let dave = Identity::driver("dave");

        let picked = store
            .transition(id, OrderStatus::InProgress, &dave)
            .await
            .unwrap();
        assert!(picked.picked_up_at.is_some());

        let delivered = store
            .transition(id, OrderStatus::Delivered, &dave)
            .await
            .unwrap();
        assert!(delivered.delivered_at.is_some());
        assert_eq!(delivered.actual_minutes, Some(0));

        let before = store.events(id).await.unwrap().len();
        let err = store
            .transition(id, OrderStatus::InProgress, &dave)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        assert_eq!(store.get(id).await.unwrap().status, OrderStatus::Delivered);
        assert_eq!(store.events(id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn other_drivers_cannot_move_an_order() {
        let store = store().await;
        let id = store.create(new_order("alice", 12.0)).await.unwrap();
        force_assign(&store, id, "dave").await;

        let err = store
            .transition(id, OrderStatus::InProgress, &Identity::driver("erin"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn terminal_transition_settles_the_driver() {
        let store = store().await;
        let drivers = ledger(&store, &["dave"]).await;
        drivers
            .set_availability("dave", Availability::OnDelivery)
            .await
            .unwrap();
        let id = store.create(new_order("alice", 45.0)).await.unwrap();
        force_assign(&store, id, "dave").await;
        let dave = Identity::driver("dave");

        store
            .transition(id, OrderStatus::InProgress, &dave)
            .await
            .unwrap();
        store
            .transition(id, OrderStatus::Delivered, &dave)
            .await
            .unwrap();

        let history = drivers.history("dave").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_id, id);
        assert_eq!(history[0].earnings, 13.5);
        assert!(history[0].delivered_at.is_some());

        let profile = drivers.get("dave").await.unwrap();
        assert_eq!(profile.completed_deliveries, 1);
        assert_eq!(profile.availability, Availability::Available);
    }

    #[tokio::test]
    async fn failed_settlement_rolls_back_the_transition() {
        let store = store().await;
        let id = store.create(new_order("alice", 45.0)).await.unwrap();
        // Nobody registered this driver, so there is no profile to settle.
        force_assign(&store, id, "ghost").await;

        let err = store
            .transition(id, OrderStatus::Cancelled, &Identity::admin("root"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        assert_eq!(store.get(id).await.unwrap().status, OrderStatus::Assigned);
        assert_eq!(store.events(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn customers_may_only_cancel_their_own_orders() {
        let store = store().await;
        ledger(&store, &["dave"]).await;
        let id = store.create(new_order("alice", 12.0)).await.unwrap();
        force_assign(&store, id, "dave").await;

        let mallory = Identity::customer("mallory");
        for next in [OrderStatus::InProgress, OrderStatus::Cancelled] {
            assert!(matches!(
                store.transition(id, next, &mallory).await,
                Err(AppError::Validation(_))
            ));
        }
        assert!(matches!(
            store
                .transition(id, OrderStatus::InProgress, &Identity::customer("alice"))
                .await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(store.get(id).await.unwrap().status, OrderStatus::Assigned);

        let cancelled = store
            .transition(id, OrderStatus::Cancelled, &Identity::customer("alice"))
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn queries_honour_sort_order() {
        let store = store().await;
        let first = store.create(new_order("alice", 10.0)).await.unwrap();
        let second = store.create(new_order("alice", 10.0)).await.unwrap();
        store.create(new_order("bob", 10.0)).await.unwrap();

        let newest = store
            .by_customer("alice", SortOrder::NewestFirst)
            .await
            .unwrap();
        assert_eq!(
            newest.iter().map(|o| o.id).collect::<Vec<_>>(),
            vec![second, first]
        );

        let pending = store.pending(SortOrder::OldestFirst).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].id, first);

        force_assign(&store, second, "dave").await;
        force_assign(&store, first, "dave").await;
        let active = store.oldest_active_for("dave").await.unwrap().unwrap();
        assert_eq!(active.id, first);
        assert!(store.oldest_active_for("erin").await.unwrap().is_none());
    }
}
