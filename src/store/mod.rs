//! Durable state of the dispatch engine.
//!
//! Every mutation that decides between competing writers is a conditional
//! update that reports whether it won. Callers treat a lost race as "no longer
//! applicable" and never retry.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::dispatch::{DispatchEntry, Rejection};
use crate::models::driver::{Driver, DriverId, GeoPoint, LocationRequest};
use crate::models::order::{
    NewOrder, Order, OrderFilter, OrderId, OrderRating, OrderStatus, RequesterId,
    RequesterStanding,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A guarded status change applied atomically by the store.
///
/// The write succeeds only if the order is in one of `from` and every
/// populated guard matches. `assigned_driver` ends up as `assign` (or the
/// current driver when `assign` is `None`) if `to` holds a driver, and is
/// cleared otherwise.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub from: Vec<OrderStatus>,
    pub to: OrderStatus,
    pub expect_driver: Option<DriverId>,
    pub expect_requester: Option<RequesterId>,
    pub assign: Option<DriverId>,
}

impl OrderTransition {
    pub fn new(from: &[OrderStatus], to: OrderStatus) -> Self {
        Self {
            from: from.to_vec(),
            to,
            expect_driver: None,
            expect_requester: None,
            assign: None,
        }
    }

    pub fn by_driver(mut self, driver_id: DriverId) -> Self {
        self.expect_driver = Some(driver_id);
        self
    }

    pub fn by_requester(mut self, requester_id: RequesterId) -> Self {
        self.expect_requester = Some(requester_id);
        self
    }

    pub fn assigning(mut self, driver_id: DriverId) -> Self {
        self.assign = Some(driver_id);
        self
    }

    /// Applies the transition to `order` if its guards hold.
    pub fn apply(&self, order: &mut Order, now: DateTime<Utc>) -> bool {
        if !self.from.contains(&order.status) {
            return false;
        }
        if self
            .expect_driver
            .is_some_and(|driver| order.assigned_driver != Some(driver))
        {
            return false;
        }
        if self
            .expect_requester
            .is_some_and(|requester| order.requester_id != requester)
        {
            return false;
        }

        let assigned = if self.to.holds_driver() {
            self.assign.or(order.assigned_driver)
        } else {
            None
        };
        if self.to.holds_driver() && assigned.is_none() {
            return false;
        }

        order.status = self.to;
        order.assigned_driver = assigned;
        if self.to == OrderStatus::Completed {
            order.completed_at = Some(now);
        }
        if self.to == OrderStatus::Scheduled {
            order.reminder_sent = false;
        }
        true
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // Orders
    async fn insert_order(&self, new_order: NewOrder, now: DateTime<Utc>)
    -> Result<Order, AppError>;
    async fn order(&self, order_id: OrderId) -> Result<Option<Order>, AppError>;
    /// Matching orders, newest first, paged by the filter's limit and offset.
    async fn orders(&self, filter: OrderFilter) -> Result<Vec<Order>, AppError>;
    async fn transition_order(
        &self,
        order_id: OrderId,
        transition: &OrderTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, AppError>;
    /// Stamps the first activation moment of a preorder. No-op if already stamped.
    async fn mark_pending_dispatch(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    async fn orders_due_for_activation(&self, now: DateTime<Utc>)
    -> Result<Vec<Order>, AppError>;
    async fn orders_past_grace(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, AppError>;
    async fn preorders_due_for_reminder(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Order>, AppError>;
    /// Flips `reminder_sent` from `from` to `!from`.
    async fn swap_reminder_sent(&self, order_id: OrderId, from: bool) -> Result<bool, AppError>;
    async fn rate_order(
        &self,
        order_id: OrderId,
        rating: OrderRating,
    ) -> Result<Option<Order>, AppError>;
    /// Stores the driver's rating of the requester, once per completed order.
    async fn rate_requester(
        &self,
        order_id: OrderId,
        rating: OrderRating,
    ) -> Result<Option<Order>, AppError>;
    /// Aggregate of the ratings drivers gave `requester_id`, with the
    /// `keep_reviews` most recently completed ones attached.
    async fn requester_standing(
        &self,
        requester_id: RequesterId,
        keep_reviews: usize,
    ) -> Result<RequesterStanding, AppError>;

    // Driver directory
    async fn upsert_driver(&self, driver: Driver) -> Result<Driver, AppError>;
    async fn driver(&self, driver_id: DriverId) -> Result<Option<Driver>, AppError>;
    /// All drivers in directory order (ascending id).
    async fn drivers(&self) -> Result<Vec<Driver>, AppError>;
    async fn set_shift(
        &self,
        driver_id: DriverId,
        on_shift: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Driver>, AppError>;
    /// Fails with `Conflict` when making an off-shift driver available.
    async fn set_availability(
        &self,
        driver_id: DriverId,
        available: bool,
    ) -> Result<Option<Driver>, AppError>;
    async fn set_position(
        &self,
        driver_id: DriverId,
        position: GeoPoint,
    ) -> Result<Option<Driver>, AppError>;
    async fn add_driver_rating(&self, driver_id: DriverId, score: u8) -> Result<(), AppError>;

    // Dispatch queue
    /// Inserts or fully replaces the entry of `entry.order_id`.
    async fn put_dispatch(&self, entry: DispatchEntry) -> Result<(), AppError>;
    async fn dispatch(&self, order_id: OrderId) -> Result<Option<DispatchEntry>, AppError>;
    /// Moves the pointer from `expected_index` to the next candidate, which
    /// counts as queued at `now` and not yet offered.
    async fn advance_dispatch(
        &self,
        order_id: OrderId,
        expected_index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    /// Expires the offer under the pointer. Wins only while the order is still
    /// `searching`, the pointer is still at `expected_index`, and the offer
    /// stamp still reads `offered_at`; then moves the pointer like
    /// `advance_dispatch`.
    async fn expire_dispatch(
        &self,
        order_id: OrderId,
        expected_index: usize,
        offered_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    async fn mark_offer_sent(
        &self,
        order_id: OrderId,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    async fn remove_dispatch(&self, order_id: OrderId) -> Result<(), AppError>;
    /// Entries of `searching` orders whose offer (or queueing) predates `cutoff`.
    async fn overdue_dispatches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchEntry>, AppError>;

    // Rejections
    /// Returns false when the pair was already recorded.
    async fn record_rejection(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    async fn rejected_drivers(&self, order_id: OrderId) -> Result<Vec<DriverId>, AppError>;
    async fn rejections_by_driver(&self, driver_id: DriverId)
    -> Result<Vec<Rejection>, AppError>;

    // Location requests
    async fn put_location_request(&self, request: LocationRequest) -> Result<(), AppError>;
    /// Removes the driver's request and returns it unless it had expired.
    async fn take_location_request(
        &self,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<Option<LocationRequest>, AppError>;
    async fn purge_location_requests(&self, now: DateTime<Utc>) -> Result<usize, AppError>;
}

/// Folds one more score into a running average.
pub(crate) fn fold_rating(driver: &mut Driver, score: u8) {
    let count = f64::from(driver.rating_count);
    driver.rating = (driver.rating * count + f64::from(score)) / (count + 1.0);
    driver.rating_count = driver.rating_count.saturating_add(1);
}
