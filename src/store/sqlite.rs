//! SQLite persistence for orders, drivers, and the dispatch queue.
//!
//! The connection sits behind a mutex that is only ever taken inside
//! `spawn_blocking`, so no async task holds it across an await point.
//! Conditional updates read, check, and write inside one `BEGIN IMMEDIATE`
//! transaction, which keeps them atomic even with several processes sharing
//! the database file.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::error::AppError;
use crate::models::dispatch::{DispatchEntry, Rejection};
use crate::models::driver::{Driver, DriverId, GeoPoint, LocationRequest};
use crate::models::order::{
    NewOrder, Order, OrderFilter, OrderId, OrderRating, OrderStatus, RequesterId,
    RequesterStanding,
};
use crate::store::{OrderTransition, Store, fold_rating};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        requester_id INTEGER NOT NULL,
        requester_name TEXT,
        contact_phone TEXT,
        order_type TEXT NOT NULL,
        kind_json TEXT NOT NULL,
        comment TEXT,
        latitude REAL,
        longitude REAL,
        status TEXT NOT NULL,
        driver_id INTEGER,
        scheduled_at INTEGER,
        pending_dispatch_at INTEGER,
        reminder_sent INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        completed_at INTEGER,
        rating_score INTEGER,
        rating_comment TEXT,
        requester_rating_score INTEGER,
        requester_rating_comment TEXT
    );

    CREATE TABLE IF NOT EXISTS drivers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        vehicle_plate TEXT,
        phone TEXT,
        on_shift INTEGER NOT NULL DEFAULT 0,
        available INTEGER NOT NULL DEFAULT 0,
        latitude REAL,
        longitude REAL,
        shift_started_at INTEGER,
        rating REAL NOT NULL DEFAULT 0,
        rating_count INTEGER NOT NULL DEFAULT 0,
        CHECK (available = 0 OR on_shift = 1)
    );

    CREATE TABLE IF NOT EXISTS dispatch_queue (
        order_id INTEGER PRIMARY KEY REFERENCES orders(id),
        candidate_ids TEXT NOT NULL,
        current_index INTEGER NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        queued_at INTEGER NOT NULL,
        last_offer_sent_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS rejections (
        order_id INTEGER NOT NULL,
        driver_id INTEGER NOT NULL,
        rejected_at INTEGER NOT NULL,
        UNIQUE(order_id, driver_id)
    );

    CREATE TABLE IF NOT EXISTS location_requests (
        driver_id INTEGER PRIMARY KEY,
        requested_by INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
    CREATE INDEX IF NOT EXISTS idx_orders_scheduled_at ON orders(scheduled_at);
    CREATE INDEX IF NOT EXISTS idx_orders_requester ON orders(requester_id);
    CREATE INDEX IF NOT EXISTS idx_orders_driver ON orders(driver_id);
    CREATE INDEX IF NOT EXISTS idx_rejections_driver ON rejections(driver_id);
";

/// Columns added after the first release, for databases created before them.
const LATE_ORDER_COLUMNS: [(&str, &str); 2] = [
    ("requester_rating_score", "INTEGER"),
    ("requester_rating_comment", "TEXT"),
];

const ORDER_COLUMNS: &str = "id, requester_id, requester_name, contact_phone, kind_json, \
     comment, latitude, longitude, status, driver_id, scheduled_at, pending_dispatch_at, \
     reminder_sent, created_at, completed_at, rating_score, rating_comment, \
     requester_rating_score, requester_rating_comment";

const DRIVER_COLUMNS: &str = "id, name, vehicle_plate, phone, on_shift, available, latitude, \
     longitude, shift_started_at, rating, rating_count";

const DISPATCH_COLUMNS: &str =
    "order_id, candidate_ids, current_index, payload, created_at, queued_at, last_offer_sent_at";

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|err| AppError::Storage(format!("failed to open {}: {err}", path.display())))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| AppError::Storage(format!("failed to create schema: {err}")))?;
        add_late_columns(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|err| AppError::Storage(format!("connection lock poisoned: {err}")))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| AppError::Storage(format!("storage task failed: {err}")))?
    }

    async fn orders_where(
        &self,
        clause: &'static str,
        bindings: Vec<i64>,
    ) -> Result<Vec<Order>, AppError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE {clause} ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bindings), order_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

fn add_late_columns(conn: &Connection) -> Result<(), AppError> {
    for (column, kind) in LATE_ORDER_COLUMNS {
        let present: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('orders') WHERE name = ?1",
            [column],
            |row| row.get(0),
        )?;
        if !present {
            conn.execute_batch(&format!("ALTER TABLE orders ADD COLUMN {column} {kind}"))?;
        }
    }
    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(
    column: usize,
    kind: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, kind, Box::new(err))
}

fn timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: i64 = row.get(column)?;
    DateTime::from_timestamp_millis(raw)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, raw))
}

fn optional_timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(column)? {
        Some(_) => timestamp(row, column).map(Some),
        None => Ok(None),
    }
}

fn point(row: &Row<'_>, lat_column: usize) -> rusqlite::Result<Option<GeoPoint>> {
    let lat: Option<f64> = row.get(lat_column)?;
    let lng: Option<f64> = row.get(lat_column + 1)?;
    Ok(lat.zip(lng).map(|(lat, lng)| GeoPoint { lat, lng }))
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let kind_json: String = row.get(4)?;
    let kind =
        serde_json::from_str(&kind_json).map_err(|err| conversion_error(4, Type::Text, err))?;
    let status: String = row.get(8)?;
    let status = status
        .parse::<OrderStatus>()
        .map_err(|err| conversion_error(8, Type::Text, err))?;
    let rating = rating_at(row, 15)?;
    let requester_rating = rating_at(row, 17)?;

    Ok(Order {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        requester_name: row.get(2)?,
        contact_phone: row.get(3)?,
        kind,
        comment: row.get(5)?,
        location: point(row, 6)?,
        status,
        assigned_driver: row.get(9)?,
        scheduled_at: optional_timestamp(row, 10)?,
        pending_dispatch_at: optional_timestamp(row, 11)?,
        reminder_sent: row.get(12)?,
        created_at: timestamp(row, 13)?,
        completed_at: optional_timestamp(row, 14)?,
        rating,
        requester_rating,
    })
}

fn rating_at(row: &Row<'_>, score_column: usize) -> rusqlite::Result<Option<OrderRating>> {
    match row.get::<_, Option<u8>>(score_column)? {
        Some(score) => Ok(Some(OrderRating {
            score,
            comment: row.get(score_column + 1)?,
        })),
        None => Ok(None),
    }
}

fn page_param(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn driver_from_row(row: &Row<'_>) -> rusqlite::Result<Driver> {
    Ok(Driver {
        id: row.get(0)?,
        name: row.get(1)?,
        vehicle_plate: row.get(2)?,
        phone: row.get(3)?,
        on_shift: row.get(4)?,
        available: row.get(5)?,
        position: point(row, 6)?,
        shift_started_at: optional_timestamp(row, 8)?,
        rating: row.get(9)?,
        rating_count: row.get(10)?,
    })
}

fn dispatch_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchEntry> {
    let candidates: String = row.get(1)?;
    let candidate_ids =
        serde_json::from_str(&candidates).map_err(|err| conversion_error(1, Type::Text, err))?;
    let current_index: i64 = row.get(2)?;

    Ok(DispatchEntry {
        order_id: row.get(0)?,
        candidate_ids,
        current_index: usize::try_from(current_index)
            .map_err(|err| conversion_error(2, Type::Integer, err))?,
        payload: row.get(3)?,
        created_at: timestamp(row, 4)?,
        queued_at: timestamp(row, 5)?,
        last_offer_sent_at: optional_timestamp(row, 6)?,
    })
}

fn load_order(conn: &Connection, order_id: OrderId) -> rusqlite::Result<Option<Order>> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        [order_id],
        order_from_row,
    )
    .optional()
}

fn load_driver(conn: &Connection, driver_id: DriverId) -> rusqlite::Result<Option<Driver>> {
    conn.query_row(
        &format!("SELECT {DRIVER_COLUMNS} FROM drivers WHERE id = ?1"),
        [driver_id],
        driver_from_row,
    )
    .optional()
}

fn index_param(index: usize) -> Result<i64, AppError> {
    i64::try_from(index)
        .map_err(|err| AppError::Internal(format!("dispatch index overflow: {err}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_order(
        &self,
        new_order: NewOrder,
        now: DateTime<Utc>,
    ) -> Result<Order, AppError> {
        let kind_json = serde_json::to_string(&new_order.kind)
            .map_err(|err| AppError::Internal(format!("failed to encode order kind: {err}")))?;
        let status = new_order.initial_status(now);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO orders (requester_id, requester_name, contact_phone, order_type,
                     kind_json, comment, latitude, longitude, status, scheduled_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new_order.requester_id,
                    new_order.requester_name,
                    new_order.contact_phone,
                    new_order.kind.label(),
                    kind_json,
                    new_order.comment,
                    new_order.location.map(|p| p.lat),
                    new_order.location.map(|p| p.lng),
                    status.as_str(),
                    new_order.scheduled_at.map(millis),
                    millis(now),
                ],
            )?;
            let id = conn.last_insert_rowid();
            load_order(conn, id)?
                .ok_or_else(|| AppError::Storage(format!("order {id} vanished after insert")))
        })
        .await
    }

    async fn order(&self, order_id: OrderId) -> Result<Option<Order>, AppError> {
        self.with_conn(move |conn| Ok(load_order(conn, order_id)?))
            .await
    }

    async fn orders(&self, filter: OrderFilter) -> Result<Vec<Order>, AppError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR requester_id = ?2)
                   AND (?3 IS NULL OR driver_id = ?3)
                 ORDER BY id DESC LIMIT ?4 OFFSET ?5"
            ))?;
            let rows = stmt.query_map(
                params![
                    filter.status.map(OrderStatus::as_str),
                    filter.requester_id,
                    filter.driver_id,
                    filter.limit.map_or(-1, page_param),
                    page_param(filter.offset),
                ],
                order_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        transition: &OrderTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, AppError> {
        let transition = transition.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut order) = load_order(&tx, order_id)? else {
                return Ok(None);
            };
            if !transition.apply(&mut order, now) {
                return Ok(None);
            }
            tx.execute(
                "UPDATE orders
                 SET status = ?1, driver_id = ?2, completed_at = ?3, reminder_sent = ?4
                 WHERE id = ?5",
                params![
                    order.status.as_str(),
                    order.assigned_driver,
                    order.completed_at.map(millis),
                    order.reminder_sent,
                    order_id,
                ],
            )?;
            tx.commit()?;
            Ok(Some(order))
        })
        .await
    }

    async fn mark_pending_dispatch(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE orders SET pending_dispatch_at = ?1
                 WHERE id = ?2 AND pending_dispatch_at IS NULL",
                params![millis(now), order_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn orders_due_for_activation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Order>, AppError> {
        self.orders_where(
            "status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
            vec![millis(now)],
        )
        .await
    }

    async fn orders_past_grace(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, AppError> {
        self.orders_where(
            "status IN ('scheduled', 'searching')
             AND pending_dispatch_at IS NOT NULL AND pending_dispatch_at <= ?1",
            vec![millis(cutoff)],
        )
        .await
    }

    async fn preorders_due_for_reminder(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Order>, AppError> {
        self.orders_where(
            "status = 'accepted_preorder' AND reminder_sent = 0
             AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
            vec![millis(horizon)],
        )
        .await
    }

    async fn swap_reminder_sent(&self, order_id: OrderId, from: bool) -> Result<bool, AppError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE orders SET reminder_sent = ?1 WHERE id = ?2 AND reminder_sent = ?3",
                params![!from, order_id, from],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn rate_order(
        &self,
        order_id: OrderId,
        rating: OrderRating,
    ) -> Result<Option<Order>, AppError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE orders SET rating_score = ?1, rating_comment = ?2
                 WHERE id = ?3 AND status = 'completed' AND rating_score IS NULL",
                params![rating.score, rating.comment, order_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(load_order(conn, order_id)?)
        })
        .await
    }

    async fn rate_requester(
        &self,
        order_id: OrderId,
        rating: OrderRating,
    ) -> Result<Option<Order>, AppError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE orders SET requester_rating_score = ?1, requester_rating_comment = ?2
                 WHERE id = ?3 AND status = 'completed' AND requester_rating_score IS NULL",
                params![rating.score, rating.comment, order_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(load_order(conn, order_id)?)
        })
        .await
    }

    async fn requester_standing(
        &self,
        requester_id: RequesterId,
        keep_reviews: usize,
    ) -> Result<RequesterStanding, AppError> {
        let ratings = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT requester_rating_score, requester_rating_comment FROM orders
                     WHERE requester_id = ?1 AND requester_rating_score IS NOT NULL
                     ORDER BY completed_at DESC, id DESC",
                )?;
                let rows = stmt.query_map([requester_id], |row| {
                    Ok(OrderRating {
                        score: row.get(0)?,
                        comment: row.get(1)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(RequesterStanding::from_ratings(ratings, keep_reviews))
    }

    async fn upsert_driver(&self, driver: Driver) -> Result<Driver, AppError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO drivers (id, name, vehicle_plate, phone, on_shift, available,
                     latitude, longitude, shift_started_at, rating, rating_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     vehicle_plate = excluded.vehicle_plate,
                     phone = excluded.phone",
                params![
                    driver.id,
                    driver.name,
                    driver.vehicle_plate,
                    driver.phone,
                    driver.on_shift,
                    driver.available && driver.on_shift,
                    driver.position.map(|p| p.lat),
                    driver.position.map(|p| p.lng),
                    driver.shift_started_at.map(millis),
                    driver.rating,
                    driver.rating_count,
                ],
            )?;
            load_driver(conn, driver.id)?.ok_or_else(|| {
                AppError::Storage(format!("driver {} vanished after upsert", driver.id))
            })
        })
        .await
    }

    async fn driver(&self, driver_id: DriverId) -> Result<Option<Driver>, AppError> {
        self.with_conn(move |conn| Ok(load_driver(conn, driver_id)?))
            .await
    }

    async fn drivers(&self) -> Result<Vec<Driver>, AppError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {DRIVER_COLUMNS} FROM drivers ORDER BY id"))?;
            let rows = stmt.query_map([], driver_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn set_shift(
        &self,
        driver_id: DriverId,
        on_shift: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Driver>, AppError> {
        self.with_conn(move |conn| {
            let changed = if on_shift {
                conn.execute(
                    "UPDATE drivers SET on_shift = 1, available = 1, shift_started_at = ?1
                     WHERE id = ?2",
                    params![millis(now), driver_id],
                )?
            } else {
                conn.execute(
                    "UPDATE drivers SET on_shift = 0, available = 0, shift_started_at = NULL,
                         latitude = NULL, longitude = NULL
                     WHERE id = ?1",
                    [driver_id],
                )?
            };
            if changed == 0 {
                return Ok(None);
            }
            Ok(load_driver(conn, driver_id)?)
        })
        .await
    }

    async fn set_availability(
        &self,
        driver_id: DriverId,
        available: bool,
    ) -> Result<Option<Driver>, AppError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(driver) = load_driver(&tx, driver_id)? else {
                return Ok(None);
            };
            if available && !driver.on_shift {
                return Err(AppError::Conflict(format!(
                    "driver {driver_id} is not on shift"
                )));
            }
            tx.execute(
                "UPDATE drivers SET available = ?1 WHERE id = ?2",
                params![available, driver_id],
            )?;
            let updated = load_driver(&tx, driver_id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    async fn set_position(
        &self,
        driver_id: DriverId,
        position: GeoPoint,
    ) -> Result<Option<Driver>, AppError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE drivers SET latitude = ?1, longitude = ?2 WHERE id = ?3",
                params![position.lat, position.lng, driver_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Ok(load_driver(conn, driver_id)?)
        })
        .await
    }

    async fn add_driver_rating(&self, driver_id: DriverId, score: u8) -> Result<(), AppError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(mut driver) = load_driver(&tx, driver_id)? {
                fold_rating(&mut driver, score);
                tx.execute(
                    "UPDATE drivers SET rating = ?1, rating_count = ?2 WHERE id = ?3",
                    params![driver.rating, driver.rating_count, driver_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn put_dispatch(&self, entry: DispatchEntry) -> Result<(), AppError> {
        let candidates = serde_json::to_string(&entry.candidate_ids)
            .map_err(|err| AppError::Internal(format!("failed to encode candidates: {err}")))?;
        let current_index = index_param(entry.current_index)?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO dispatch_queue (order_id, candidate_ids, current_index, payload,
                     created_at, queued_at, last_offer_sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(order_id) DO UPDATE SET
                     candidate_ids = excluded.candidate_ids,
                     current_index = excluded.current_index,
                     payload = excluded.payload,
                     created_at = excluded.created_at,
                     queued_at = excluded.queued_at,
                     last_offer_sent_at = excluded.last_offer_sent_at",
                params![
                    entry.order_id,
                    candidates,
                    current_index,
                    entry.payload,
                    millis(entry.created_at),
                    millis(entry.queued_at),
                    entry.last_offer_sent_at.map(millis),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn dispatch(&self, order_id: OrderId) -> Result<Option<DispatchEntry>, AppError> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {DISPATCH_COLUMNS} FROM dispatch_queue WHERE order_id = ?1"),
                    [order_id],
                    dispatch_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn advance_dispatch(
        &self,
        order_id: OrderId,
        expected_index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let expected_index = index_param(expected_index)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE dispatch_queue
                 SET current_index = current_index + 1, queued_at = ?1, last_offer_sent_at = NULL
                 WHERE order_id = ?2 AND current_index = ?3
                   AND current_index < json_array_length(candidate_ids)",
                params![millis(now), order_id, expected_index],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn expire_dispatch(
        &self,
        order_id: OrderId,
        expected_index: usize,
        offered_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let expected_index = index_param(expected_index)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE dispatch_queue
                 SET current_index = current_index + 1, queued_at = ?1, last_offer_sent_at = NULL
                 WHERE order_id = ?2 AND current_index = ?3 AND last_offer_sent_at IS ?4
                   AND current_index < json_array_length(candidate_ids)
                   AND EXISTS (SELECT 1 FROM orders WHERE id = ?2 AND status = 'searching')",
                params![millis(now), order_id, expected_index, offered_at.map(millis)],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn mark_offer_sent(
        &self,
        order_id: OrderId,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let index = index_param(index)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE dispatch_queue SET last_offer_sent_at = ?1
                 WHERE order_id = ?2 AND current_index = ?3",
                params![millis(now), order_id, index],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn remove_dispatch(&self, order_id: OrderId) -> Result<(), AppError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM dispatch_queue WHERE order_id = ?1", [order_id])?;
            Ok(())
        })
        .await
    }

    async fn overdue_dispatches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchEntry>, AppError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT q.order_id, q.candidate_ids, q.current_index, q.payload, q.created_at,
                        q.queued_at, q.last_offer_sent_at
                 FROM dispatch_queue q JOIN orders o ON o.id = q.order_id
                 WHERE o.status = 'searching'
                   AND ((q.last_offer_sent_at IS NOT NULL AND q.last_offer_sent_at < ?1)
                     OR (q.last_offer_sent_at IS NULL AND q.queued_at < ?1))
                 ORDER BY q.order_id",
            )?;
            let rows = stmt.query_map([millis(cutoff)], dispatch_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn record_rejection(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO rejections (order_id, driver_id, rejected_at)
                 VALUES (?1, ?2, ?3)",
                params![order_id, driver_id, millis(now)],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn rejected_drivers(&self, order_id: OrderId) -> Result<Vec<DriverId>, AppError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT driver_id FROM rejections WHERE order_id = ?1 ORDER BY driver_id",
            )?;
            let rows = stmt.query_map([order_id], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn rejections_by_driver(
        &self,
        driver_id: DriverId,
    ) -> Result<Vec<Rejection>, AppError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT order_id, driver_id, rejected_at FROM rejections
                 WHERE driver_id = ?1 ORDER BY rejected_at DESC",
            )?;
            let rows = stmt.query_map([driver_id], |row| {
                Ok(Rejection {
                    order_id: row.get(0)?,
                    driver_id: row.get(1)?,
                    rejected_at: timestamp(row, 2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn put_location_request(&self, request: LocationRequest) -> Result<(), AppError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO location_requests (driver_id, requested_by, expires_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(driver_id) DO UPDATE SET
                     requested_by = excluded.requested_by,
                     expires_at = excluded.expires_at",
                params![request.driver_id, request.requested_by, millis(request.expires_at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn take_location_request(
        &self,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<Option<LocationRequest>, AppError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let request = tx
                .query_row(
                    "SELECT driver_id, requested_by, expires_at FROM location_requests
                     WHERE driver_id = ?1",
                    [driver_id],
                    |row| {
                        Ok(LocationRequest {
                            driver_id: row.get(0)?,
                            requested_by: row.get(1)?,
                            expires_at: timestamp(row, 2)?,
                        })
                    },
                )
                .optional()?;
            tx.execute("DELETE FROM location_requests WHERE driver_id = ?1", [driver_id])?;
            tx.commit()?;
            Ok(request.filter(|request| !request.is_expired(now)))
        })
        .await
    }

    async fn purge_location_requests(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM location_requests WHERE expires_at <= ?1",
                [millis(now)],
            )?)
        })
        .await
    }
}
