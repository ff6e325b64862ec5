//! SQLite persistence for orders and drivers.
//!
//! All statements run on tokio-rusqlite's single background connection thread,
//! so a closure passed to [`Database::call`] executes without interleaving with
//! any other store operation. Multi-row mutations still open an explicit
//! transaction so a failure part-way through leaves nothing behind.

pub mod drivers;
pub mod orders;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::AppError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer TEXT NOT NULL,
    restaurant_name TEXT NOT NULL,
    restaurant_address TEXT NOT NULL,
    restaurant_lat REAL,
    restaurant_lng REAL,
    delivery_address TEXT NOT NULL,
    delivery_lat REAL,
    delivery_lng REAL,
    item_count INTEGER NOT NULL CHECK (item_count > 0),
    total REAL NOT NULL CHECK (total >= 0),
    special_instructions TEXT,
    payment_method TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    driver TEXT,
    created_at INTEGER NOT NULL,
    assigned_at INTEGER,
    picked_up_at INTEGER,
    delivered_at INTEGER,
    estimated_minutes INTEGER NOT NULL,
    actual_minutes INTEGER,
    delivered_notified INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_orders_customer ON orders(customer);
CREATE INDEX IF NOT EXISTS idx_orders_driver ON orders(driver);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

CREATE TABLE IF NOT EXISTS order_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id),
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity >= 1),
    unit_price REAL NOT NULL CHECK (unit_price >= 0),
    note TEXT
);
CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);

CREATE TABLE IF NOT EXISTS order_status_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id),
    status TEXT NOT NULL,
    note TEXT NOT NULL,
    actor TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_order_status_events_order ON order_status_events(order_id);

CREATE TABLE IF NOT EXISTS drivers (
    username TEXT PRIMARY KEY NOT NULL,
    vehicle_type TEXT NOT NULL,
    license_number TEXT NOT NULL,
    service_area TEXT NOT NULL,
    availability TEXT NOT NULL DEFAULT 'OFFLINE',
    completed_deliveries INTEGER NOT NULL DEFAULT 0,
    rating REAL,
    account_status TEXT NOT NULL DEFAULT 'ACTIVE',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    driver TEXT NOT NULL REFERENCES drivers(username),
    order_id INTEGER NOT NULL UNIQUE REFERENCES orders(id),
    picked_up_at INTEGER,
    delivered_at INTEGER,
    status TEXT NOT NULL,
    rating INTEGER CHECK (rating BETWEEN 1 AND 5),
    feedback TEXT,
    earnings REAL NOT NULL DEFAULT 0,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_history_driver ON delivery_history(driver);
";

/// Shared store handle. Cloning is cheap; every clone talks to the same
/// background connection.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
    op_timeout: Duration,
}

impl Database {
    pub async fn open(path: &str, op_timeout: Duration) -> Result<Self, AppError> {
        let conn = if path == ":memory:" {
            tokio_rusqlite::Connection::open_in_memory().await?
        } else {
            tokio_rusqlite::Connection::open(path).await?
        };

        let in_memory = path == ":memory:";
        let db = Self { conn, op_timeout };
        db.call(move |conn| {
            conn.busy_timeout(op_timeout)?;
            if !in_memory {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        info!(path, "database opened");
        Ok(db)
    }

    pub async fn open_in_memory() -> Result<Self, AppError> {
        Self::open(":memory:", Duration::from_secs(5)).await
    }

    /// Runs `op` on the connection thread. Store failures and timeouts both
    /// surface as [`AppError::Persistence`]; domain errors pass through as-is.
    ///
    /// A timeout only stops waiting. `op` still runs to completion on the
    /// connection thread and may commit, so after a timed-out write the caller
    /// has to re-read before assuming nothing changed.
    pub async fn call<F, R>(&self, op: F) -> Result<R, AppError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, AppError> + Send + 'static,
        R: Send + 'static,
    {
        let pending = self
            .conn
            .call(move |conn| Ok::<_, rusqlite::Error>(op(conn)));

        match tokio::time::timeout(self.op_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => Err(AppError::Persistence(format!(
                "store operation timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

pub(crate) fn opt_from_micros(micros: Option<i64>) -> Option<DateTime<Utc>> {
    micros.map(from_micros)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Database;
    use crate::error::AppError;

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.db");
        let path = path.to_str().unwrap().to_string();

        let db = Database::open(&path, Duration::from_secs(5)).await.unwrap();
        db.call(|conn| {
            conn.execute(
                "INSERT INTO drivers (username, vehicle_type, license_number, service_area, \
                 created_at) VALUES ('dave', 'bike', 'L-1', 'north', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        drop(db);

        let reopened = Database::open(&path, Duration::from_secs(5)).await.unwrap();
        let count = reopened
            .call(|conn| {
                let count = conn.query_row("SELECT COUNT(*) FROM drivers", [], |row| {
                    row.get::<_, i64>(0)
                })?;
                Ok(count)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn timed_out_write_still_lands() {
        let db = Database::open_in_memory().await.unwrap();
        let impatient = Database {
            conn: db.conn.clone(),
            op_timeout: Duration::ZERO,
        };

        let result = impatient
            .call(|conn| {
                std::thread::sleep(Duration::from_millis(50));
                conn.execute(
                    "INSERT INTO drivers (username, vehicle_type, license_number, service_area, \
                     created_at) VALUES ('dave', 'bike', 'L-1', 'north', 0)",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AppError::Persistence(_))));

        // Calls are serialized on one thread, so this runs after the insert.
        let count = db
            .call(|conn| {
                let count = conn.query_row("SELECT COUNT(*) FROM drivers", [], |row| {
                    row.get::<_, i64>(0)
                })?;
                Ok(count)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn ping_succeeds_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        db.ping().await.unwrap();
    }
}
