use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::info;

use crate::engine::pricing::{driver_payout, round_currency};
use crate::error::AppError;
use crate::models::driver::{
    AccountStatus, Availability, DeliveryHistoryEntry, DriverProfile, NewDriver,
};
use crate::models::order::{Order, OrderStatus};
use crate::store::orders::{load_order, oldest_active};
use crate::store::{from_micros, opt_from_micros, to_micros, Database};

const DRIVER_COLUMNS: &str = "username, vehicle_type, license_number, service_area, availability, \
    completed_deliveries, rating, account_status, created_at";

const HISTORY_COLUMNS: &str = "id, driver, order_id, picked_up_at, delivered_at, status, rating, \
    feedback, earnings, recorded_at";

/// Driver profiles, availability, delivery history and rating aggregate.
#[derive(Clone)]
pub struct DriverLedger {
    db: Database,
}

impl DriverLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn register(&self, driver: NewDriver) -> Result<DriverProfile, AppError> {
        if driver.username.trim().is_empty() {
            return Err(AppError::Validation("username cannot be empty".to_string()));
        }

        let profile = self
            .db
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO drivers (username, vehicle_type, license_number, service_area, \
                     availability, account_status, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        driver.username,
                        driver.vehicle_type,
                        driver.license_number,
                        driver.service_area,
                        Availability::Offline,
                        AccountStatus::Active,
                        to_micros(Utc::now()),
                    ],
                );
                if let Err(rusqlite::Error::SqliteFailure(err, _)) = &inserted {
                    if err.code == ErrorCode::ConstraintViolation {
                        return Err(AppError::Validation(format!(
                            "driver {} already exists",
                            driver.username
                        )));
                    }
                }
                inserted?;
                load_driver(conn, &driver.username)
            })
            .await?;

        info!(driver = %profile.username, "driver registered");
        Ok(profile)
    }

    pub async fn get(&self, driver: &str) -> Result<DriverProfile, AppError> {
        let driver = driver.to_string();
        self.db.call(move |conn| load_driver(conn, &driver)).await
    }

    pub async fn list(&self) -> Result<Vec<DriverProfile>, AppError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DRIVER_COLUMNS} FROM drivers ORDER BY username ASC"
                ))?;
                let drivers = stmt
                    .query_map([], row_to_driver)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(drivers)
            })
            .await
    }

    /// Unconditional; setting the current state again is a no-op.
    pub async fn set_availability(
        &self,
        driver: &str,
        availability: Availability,
    ) -> Result<DriverProfile, AppError> {
        let driver = driver.to_string();
        let profile = self
            .db
            .call(move |conn| {
                set_availability(conn, &driver, availability)?;
                load_driver(conn, &driver)
            })
            .await?;

        info!(driver = %profile.username, availability = %availability, "availability changed");
        Ok(profile)
    }

    pub async fn set_account_status(
        &self,
        driver: &str,
        status: AccountStatus,
    ) -> Result<DriverProfile, AppError> {
        let driver = driver.to_string();
        let profile = self
            .db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE drivers SET account_status = ?1 WHERE username = ?2",
                    params![status, driver],
                )?;
                if changed == 0 {
                    return Err(driver_not_found(&driver));
                }
                load_driver(conn, &driver)
            })
            .await?;

        info!(driver = %profile.username, account_status = %status, "account status changed");
        Ok(profile)
    }

    /// Availability is left alone; whoever confirms the delivery resets it.
    pub async fn record_delivery(
        &self,
        driver: &str,
        order_id: i64,
        picked_up_at: Option<DateTime<Utc>>,
        delivered_at: Option<DateTime<Utc>>,
        status: OrderStatus,
    ) -> Result<DeliveryHistoryEntry, AppError> {
        let driver = driver.to_string();
        let entry = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let entry =
                    record_delivery(&tx, &driver, order_id, picked_up_at, delivered_at, status)?;
                tx.commit()?;
                Ok(entry)
            })
            .await?;

        info!(
            driver = %entry.driver,
            order_id = entry.order_id,
            status = %entry.status,
            earnings = entry.earnings,
            "delivery recorded"
        );
        Ok(entry)
    }

    /// Stores the rating on the history entry and recomputes the driver's mean
    /// from every rated entry, in one transaction.
    pub async fn rate_delivery(
        &self,
        driver: &str,
        order_id: i64,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<DriverProfile, AppError> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::Validation("rating must be between 1 and 5".to_string()));
        }

        let driver = driver.to_string();
        let profile = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE delivery_history SET rating = ?1, feedback = ?2 \
                     WHERE driver = ?3 AND order_id = ?4",
                    params![rating, feedback, driver, order_id],
                )?;
                if changed == 0 {
                    return Err(AppError::NotFound(format!(
                        "no delivery of order {order_id} by driver {driver}"
                    )));
                }
                tx.execute(
                    "UPDATE drivers SET rating = ( \
                         SELECT AVG(rating) FROM delivery_history \
                         WHERE driver = ?1 AND rating IS NOT NULL \
                     ) WHERE username = ?1",
                    params![driver],
                )?;
                let profile = load_driver(&tx, &driver)?;
                tx.commit()?;
                Ok(profile)
            })
            .await?;

        info!(
            driver = %profile.username,
            order_id,
            rating,
            mean = profile.rating,
            "delivery rated"
        );
        Ok(profile)
    }

    /// Newest first.
    pub async fn history(&self, driver: &str) -> Result<Vec<DeliveryHistoryEntry>, AppError> {
        let driver = driver.to_string();
        self.db
            .call(move |conn| {
                load_driver(conn, &driver)?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM delivery_history \
                     WHERE driver = ?1 ORDER BY recorded_at DESC, id DESC"
                ))?;
                let entries = stmt
                    .query_map(params![driver], row_to_history)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await
    }

    pub async fn total_earnings(&self, driver: &str) -> Result<f64, AppError> {
        let driver = driver.to_string();
        self.db
            .call(move |conn| {
                load_driver(conn, &driver)?;
                let total: f64 = conn.query_row(
                    "SELECT COALESCE(SUM(earnings), 0.0) FROM delivery_history WHERE driver = ?1",
                    params![driver],
                    |row| row.get(0),
                )?;
                Ok(round_currency(total))
            })
            .await
    }
}

fn driver_not_found(driver: &str) -> AppError {
    AppError::NotFound(format!("driver {driver} not found"))
}

pub(crate) fn load_driver(conn: &Connection, driver: &str) -> Result<DriverProfile, AppError> {
    conn.query_row(
        &format!("SELECT {DRIVER_COLUMNS} FROM drivers WHERE username = ?1"),
        params![driver],
        row_to_driver,
    )
    .optional()?
    .ok_or_else(|| driver_not_found(driver))
}

pub(crate) fn set_availability(
    conn: &Connection,
    driver: &str,
    availability: Availability,
) -> Result<(), AppError> {
    let changed = conn.execute(
        "UPDATE drivers SET availability = ?1 WHERE username = ?2",
        params![availability, driver],
    )?;
    if changed == 0 {
        return Err(driver_not_found(driver));
    }
    Ok(())
}

/// Writes the single history row for a terminally resolved order. A
/// successful delivery also bumps the driver's completed count and earns the
/// standard payout.
pub(crate) fn record_delivery(
    conn: &Connection,
    driver: &str,
    order_id: i64,
    picked_up_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    status: OrderStatus,
) -> Result<DeliveryHistoryEntry, AppError> {
    if !status.is_terminal() {
        return Err(AppError::Validation(format!(
            "delivery can only be recorded as DELIVERED or CANCELLED, got {status}"
        )));
    }

    load_driver(conn, driver)?;
    let order = load_order(conn, order_id)?;
    if order.driver.as_deref() != Some(driver) {
        return Err(AppError::Validation(format!(
            "order {order_id} is not assigned to driver {driver}"
        )));
    }
    if order.status != status {
        return Err(AppError::Validation(format!(
            "order {order_id} is {}, cannot record it as {status}",
            order.status
        )));
    }

    let earnings = if status == OrderStatus::Delivered {
        driver_payout(order.total)
    } else {
        0.0
    };
    let recorded_at = Utc::now();

    conn.execute(
        "INSERT INTO delivery_history (driver, order_id, picked_up_at, delivered_at, status, \
         earnings, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            driver,
            order_id,
            picked_up_at.map(to_micros),
            delivered_at.map(to_micros),
            status,
            earnings,
            to_micros(recorded_at),
        ],
    )?;
    let id = conn.last_insert_rowid();

    if status == OrderStatus::Delivered {
        conn.execute(
            "UPDATE drivers SET completed_deliveries = completed_deliveries + 1 \
             WHERE username = ?1",
            params![driver],
        )?;
    }

    Ok(DeliveryHistoryEntry {
        id,
        driver: driver.to_string(),
        order_id,
        picked_up_at,
        delivered_at,
        status,
        rating: None,
        feedback: None,
        earnings,
        recorded_at,
    })
}

/// Closes out a terminal transition for the driver holding `before`, if any:
/// one history row, then the driver is released. Runs inside the caller's
/// transaction after the order row has moved to `status`.
pub(crate) fn settle(
    conn: &Connection,
    before: &Order,
    status: OrderStatus,
    at: DateTime<Utc>,
) -> Result<Option<DeliveryHistoryEntry>, AppError> {
    let Some(driver) = before.driver.as_deref() else {
        return Ok(None);
    };
    let delivered_at = (status == OrderStatus::Delivered).then_some(at);
    let entry = record_delivery(
        conn,
        driver,
        before.id,
        before.picked_up_at,
        delivered_at,
        status,
    )?;
    release_driver(conn, driver)?;
    Ok(Some(entry))
}

/// Back to `AVAILABLE` only from `ON_DELIVERY`, and only once no other order
/// is active for the driver.
fn release_driver(conn: &Connection, driver: &str) -> Result<(), AppError> {
    let profile = load_driver(conn, driver)?;
    if profile.availability == Availability::OnDelivery && oldest_active(conn, driver)?.is_none() {
        set_availability(conn, driver, Availability::Available)?;
    }
    Ok(())
}

fn row_to_driver(row: &Row<'_>) -> rusqlite::Result<DriverProfile> {
    Ok(DriverProfile {
        username: row.get(0)?,
        vehicle_type: row.get(1)?,
        license_number: row.get(2)?,
        service_area: row.get(3)?,
        availability: row.get(4)?,
        completed_deliveries: row.get(5)?,
        rating: row.get(6)?,
        account_status: row.get(7)?,
        created_at: from_micros(row.get(8)?),
    })
}

fn row_to_history(row: &Row<'_>) -> rusqlite::Result<DeliveryHistoryEntry> {
    Ok(DeliveryHistoryEntry {
        id: row.get(0)?,
        driver: row.get(1)?,
        order_id: row.get(2)?,
        picked_up_at: opt_from_micros(row.get(3)?),
        delivered_at: opt_from_micros(row.get(4)?),
        status: row.get(5)?,
        rating: row.get(6)?,
        feedback: row.get(7)?,
        earnings: row.get(8)?,
        recorded_at: from_micros(row.get(9)?),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;

    use super::DriverLedger;
    use crate::error::AppError;
    use crate::models::driver::{AccountStatus, Availability, NewDriver};
    use crate::models::order::OrderStatus;
    use crate::store::Database;

    pub(crate) fn new_driver(username: &str) -> NewDriver {
        NewDriver {
            username: username.to_string(),
            vehicle_type: "bike".to_string(),
            license_number: "LIC-1".to_string(),
            service_area: "downtown".to_string(),
        }
    }

    async fn ledger_with_orders(
        driver: &str,
        orders: &[(f64, OrderStatus)],
    ) -> (DriverLedger, Database) {
        let db = Database::open_in_memory().await.unwrap();
        let ledger = DriverLedger::new(db.clone());
        ledger.register(new_driver(driver)).await.unwrap();

        for (total, status) in orders {
            let driver = driver.to_string();
            let (total, status) = (*total, *status);
            db.call(move |conn| {
                conn.execute(
                    "INSERT INTO orders (customer, restaurant_name, restaurant_address, \
                     delivery_address, item_count, total, payment_method, status, driver, \
                     created_at, estimated_minutes) \
                     VALUES ('alice', 'r', 'a', 'd', 1, ?1, 'CARD', ?2, ?3, 0, 30)",
                    rusqlite::params![total, status, driver],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        }

        (ledger, db)
    }

    #[tokio::test]
    async fn register_starts_offline_and_unrated() {
        let (ledger, _db) = ledger_with_orders("dave", &[]).await;
        let profile = ledger.get("dave").await.unwrap();

        assert_eq!(profile.availability, Availability::Offline);
        assert_eq!(profile.account_status, AccountStatus::Active);
        assert_eq!(profile.completed_deliveries, 0);
        assert!(profile.rating.is_none());

        assert!(matches!(
            ledger.register(new_driver("dave")).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn availability_is_idempotent() {
        let (ledger, _db) = ledger_with_orders("dave", &[]).await;

        ledger
            .set_availability("dave", Availability::Available)
            .await
            .unwrap();
        let again = ledger
            .set_availability("dave", Availability::Available)
            .await
            .unwrap();
        assert_eq!(again.availability, Availability::Available);

        assert!(matches!(
            ledger.set_availability("nobody", Availability::Available).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn record_delivery_counts_only_successes() {
        let (ledger, _db) = ledger_with_orders(
            "dave",
            &[(45.0, OrderStatus::Delivered), (20.0, OrderStatus::Cancelled)],
        ).await;
        let now = Some(Utc::now());

        let entry = ledger
            .record_delivery("dave", 1, now, now, OrderStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(entry.earnings, 13.5);

        ledger
            .record_delivery("dave", 2, now, None, OrderStatus::Cancelled)
            .await
            .unwrap();

        let profile = ledger.get("dave").await.unwrap();
        assert_eq!(profile.completed_deliveries, 1);
        assert_eq!(profile.availability, Availability::Offline);
        assert_eq!(ledger.total_earnings("dave").await.unwrap(), 13.5);
        assert_eq!(ledger.history("dave").await.unwrap().len(), 2);

        assert!(matches!(
            ledger
                .record_delivery("nobody", 1, now, now, OrderStatus::Delivered)
                .await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            ledger
                .record_delivery("dave", 1, now, now, OrderStatus::Delivered)
                .await,
            Err(AppError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn rating_mean_covers_every_rated_delivery() {
        let (ledger, _db) = ledger_with_orders("dave", &[(10.0, OrderStatus::Delivered); 3]).await;
        for order_id in 1..=3 {
            ledger
                .record_delivery("dave", order_id, None, None, OrderStatus::Delivered)
                .await
                .unwrap();
        }

        ledger.rate_delivery("dave", 1, 5, None).await.unwrap();
        let profile = ledger
            .rate_delivery("dave", 2, 2, Some("cold food".to_string()))
            .await
            .unwrap();
        assert_eq!(profile.rating, Some(3.5));

        // Re-rating replaces the earlier score rather than adding to it.
        let profile = ledger.rate_delivery("dave", 1, 3, None).await.unwrap();
        assert_eq!(profile.rating, Some(2.5));

        let history = ledger.history("dave").await.unwrap();
        let rated: Vec<u8> = history.iter().filter_map(|entry| entry.rating).collect();
        assert_eq!(rated.len(), 2);
    }

    #[tokio::test]
    async fn rating_requires_history_and_range() {
        let (ledger, _db) = ledger_with_orders("dave", &[(10.0, OrderStatus::Delivered)]).await;

        assert!(matches!(
            ledger.rate_delivery("dave", 1, 4, None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            ledger.rate_delivery("dave", 1, 6, None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            ledger.rate_delivery("dave", 1, 0, None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn record_delivery_requires_the_order_to_have_reached_that_status() {
        let (ledger, db) = ledger_with_orders(
            "dave",
            &[(45.0, OrderStatus::Assigned), (45.0, OrderStatus::Cancelled)],
        )
        .await;
        let now = Some(Utc::now());

        assert!(matches!(
            ledger
                .record_delivery("dave", 1, now, now, OrderStatus::Delivered)
                .await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            ledger
                .record_delivery("dave", 2, now, now, OrderStatus::Delivered)
                .await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            ledger
                .record_delivery("dave", 1, now, None, OrderStatus::InProgress)
                .await,
            Err(AppError::Validation(_))
        ));

        let profile = ledger.get("dave").await.unwrap();
        assert_eq!(profile.completed_deliveries, 0);
        assert!(ledger.history("dave").await.unwrap().is_empty());

        // Once the order really is delivered the entry can be written.
        db.call(|conn| {
            conn.execute("UPDATE orders SET status = 'DELIVERED' WHERE id = 1", [])?;
            Ok(())
        })
        .await
        .unwrap();
        let entry = ledger
            .record_delivery("dave", 1, now, now, OrderStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(entry.earnings, 13.5);
    }
}
