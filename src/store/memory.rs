use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::AppError;
use crate::models::dispatch::{DispatchEntry, Rejection};
use crate::models::driver::{Driver, DriverId, GeoPoint, LocationRequest};
use crate::models::order::{
    NewOrder, Order, OrderFilter, OrderId, OrderRating, OrderStatus, RequesterId,
    RequesterStanding,
};
use crate::store::{OrderTransition, Store, fold_rating};

/// In-process store. Conditional updates run under the DashMap shard lock of
/// the touched key, which makes them atomic within one process.
#[derive(Default)]
pub struct MemoryStore {
    next_order_id: AtomicI64,
    orders: DashMap<OrderId, Order>,
    drivers: DashMap<DriverId, Driver>,
    dispatches: DashMap<OrderId, DispatchEntry>,
    rejections: DashMap<(OrderId, DriverId), DateTime<Utc>>,
    location_requests: DashMap<DriverId, LocationRequest>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn orders_where(&self, keep: impl Fn(&Order) -> bool) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| order.id);
        orders
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_order(
        &self,
        new_order: NewOrder,
        now: DateTime<Utc>,
    ) -> Result<Order, AppError> {
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        let order = Order {
            id,
            status: new_order.initial_status(now),
            requester_id: new_order.requester_id,
            requester_name: new_order.requester_name,
            contact_phone: new_order.contact_phone,
            kind: new_order.kind,
            comment: new_order.comment,
            location: new_order.location,
            assigned_driver: None,
            scheduled_at: new_order.scheduled_at,
            pending_dispatch_at: None,
            reminder_sent: false,
            created_at: now,
            completed_at: None,
            rating: None,
            requester_rating: None,
        };
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn order(&self, order_id: OrderId) -> Result<Option<Order>, AppError> {
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn orders(&self, filter: OrderFilter) -> Result<Vec<Order>, AppError> {
        let mut orders = self.orders_where(|order| filter.matches(order));
        orders.reverse();
        Ok(orders
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        transition: &OrderTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Order>, AppError> {
        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if transition.apply(&mut order, now) {
            Ok(Some(order.clone()))
        } else {
            Ok(None)
        }
    }

    async fn mark_pending_dispatch(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        match self.orders.get_mut(&order_id) {
            Some(mut order) if order.pending_dispatch_at.is_none() => {
                order.pending_dispatch_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn orders_due_for_activation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Order>, AppError> {
        Ok(self.orders_where(|order| {
            order.status == OrderStatus::Scheduled
                && order.scheduled_at.is_some_and(|at| at <= now)
        }))
    }

    async fn orders_past_grace(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>, AppError> {
        Ok(self.orders_where(|order| {
            matches!(order.status, OrderStatus::Scheduled | OrderStatus::Searching)
                && order.pending_dispatch_at.is_some_and(|at| at <= cutoff)
        }))
    }

    async fn preorders_due_for_reminder(
        &self,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<Order>, AppError> {
        Ok(self.orders_where(|order| {
            order.status == OrderStatus::AcceptedPreorder
                && !order.reminder_sent
                && order.scheduled_at.is_some_and(|at| at <= horizon)
        }))
    }

    async fn swap_reminder_sent(&self, order_id: OrderId, from: bool) -> Result<bool, AppError> {
        match self.orders.get_mut(&order_id) {
            Some(mut order) if order.reminder_sent == from => {
                order.reminder_sent = !from;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rate_order(
        &self,
        order_id: OrderId,
        rating: OrderRating,
    ) -> Result<Option<Order>, AppError> {
        match self.orders.get_mut(&order_id) {
            Some(mut order) if order.status == OrderStatus::Completed && order.rating.is_none() => {
                order.rating = Some(rating);
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn rate_requester(
        &self,
        order_id: OrderId,
        rating: OrderRating,
    ) -> Result<Option<Order>, AppError> {
        match self.orders.get_mut(&order_id) {
            Some(mut order)
                if order.status == OrderStatus::Completed && order.requester_rating.is_none() =>
            {
                order.requester_rating = Some(rating);
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn requester_standing(
        &self,
        requester_id: RequesterId,
        keep_reviews: usize,
    ) -> Result<RequesterStanding, AppError> {
        let mut rated = self.orders_where(|order| {
            order.requester_id == requester_id && order.requester_rating.is_some()
        });
        rated.sort_by(|a, b| (b.completed_at, b.id).cmp(&(a.completed_at, a.id)));
        let ratings = rated
            .into_iter()
            .filter_map(|order| order.requester_rating)
            .collect();
        Ok(RequesterStanding::from_ratings(ratings, keep_reviews))
    }

    async fn upsert_driver(&self, driver: Driver) -> Result<Driver, AppError> {
        let mut entry = self.drivers.entry(driver.id).or_insert_with(|| {
            let mut fresh = driver.clone();
            fresh.available = fresh.available && fresh.on_shift;
            fresh
        });
        entry.name = driver.name;
        entry.vehicle_plate = driver.vehicle_plate;
        entry.phone = driver.phone;
        Ok(entry.clone())
    }

    async fn driver(&self, driver_id: DriverId) -> Result<Option<Driver>, AppError> {
        Ok(self.drivers.get(&driver_id).map(|entry| entry.value().clone()))
    }

    async fn drivers(&self) -> Result<Vec<Driver>, AppError> {
        let mut drivers: Vec<Driver> = self
            .drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        drivers.sort_by_key(|driver| driver.id);
        Ok(drivers)
    }

    async fn set_shift(
        &self,
        driver_id: DriverId,
        on_shift: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Driver>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        driver.on_shift = on_shift;
        driver.available = on_shift;
        if on_shift {
            driver.shift_started_at = Some(now);
        } else {
            driver.shift_started_at = None;
            driver.position = None;
        }
        Ok(Some(driver.clone()))
    }

    async fn set_availability(
        &self,
        driver_id: DriverId,
        available: bool,
    ) -> Result<Option<Driver>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        if available && !driver.on_shift {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is not on shift"
            )));
        }
        driver.available = available;
        Ok(Some(driver.clone()))
    }

    async fn set_position(
        &self,
        driver_id: DriverId,
        position: GeoPoint,
    ) -> Result<Option<Driver>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        driver.position = Some(position);
        Ok(Some(driver.clone()))
    }

    async fn add_driver_rating(&self, driver_id: DriverId, score: u8) -> Result<(), AppError> {
        if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
            fold_rating(&mut driver, score);
        }
        Ok(())
    }

    async fn put_dispatch(&self, entry: DispatchEntry) -> Result<(), AppError> {
        self.dispatches.insert(entry.order_id, entry);
        Ok(())
    }

    async fn dispatch(&self, order_id: OrderId) -> Result<Option<DispatchEntry>, AppError> {
        Ok(self
            .dispatches
            .get(&order_id)
            .map(|entry| entry.value().clone()))
    }

    async fn advance_dispatch(
        &self,
        order_id: OrderId,
        expected_index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        match self.dispatches.get_mut(&order_id) {
            Some(mut entry)
                if entry.current_index == expected_index && !entry.is_exhausted() =>
            {
                entry.current_index += 1;
                entry.queued_at = now;
                entry.last_offer_sent_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_dispatch(
        &self,
        order_id: OrderId,
        expected_index: usize,
        offered_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // lock order: queue entry first, then the order
        let Some(mut entry) = self.dispatches.get_mut(&order_id) else {
            return Ok(false);
        };
        let searching = self
            .orders
            .get(&order_id)
            .is_some_and(|order| order.status == OrderStatus::Searching);
        if !searching
            || entry.current_index != expected_index
            || entry.last_offer_sent_at != offered_at
            || entry.is_exhausted()
        {
            return Ok(false);
        }
        entry.current_index += 1;
        entry.queued_at = now;
        entry.last_offer_sent_at = None;
        Ok(true)
    }

    async fn mark_offer_sent(
        &self,
        order_id: OrderId,
        index: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        match self.dispatches.get_mut(&order_id) {
            Some(mut entry) if entry.current_index == index => {
                entry.last_offer_sent_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_dispatch(&self, order_id: OrderId) -> Result<(), AppError> {
        self.dispatches.remove(&order_id);
        Ok(())
    }

    async fn overdue_dispatches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DispatchEntry>, AppError> {
        let overdue: Vec<DispatchEntry> = self
            .dispatches
            .iter()
            .filter(|entry| entry.value().is_overdue(cutoff))
            .map(|entry| entry.value().clone())
            .collect();

        let mut searching: Vec<DispatchEntry> = overdue
            .into_iter()
            .filter(|entry| {
                self.orders
                    .get(&entry.order_id)
                    .is_some_and(|order| order.status == OrderStatus::Searching)
            })
            .collect();
        searching.sort_by_key(|entry| entry.order_id);
        Ok(searching)
    }

    async fn record_rejection(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut inserted = false;
        self.rejections.entry((order_id, driver_id)).or_insert_with(|| {
            inserted = true;
            now
        });
        Ok(inserted)
    }

    async fn rejected_drivers(&self, order_id: OrderId) -> Result<Vec<DriverId>, AppError> {
        let mut drivers: Vec<DriverId> = self
            .rejections
            .iter()
            .filter(|entry| entry.key().0 == order_id)
            .map(|entry| entry.key().1)
            .collect();
        drivers.sort_unstable();
        Ok(drivers)
    }

    async fn rejections_by_driver(
        &self,
        driver_id: DriverId,
    ) -> Result<Vec<Rejection>, AppError> {
        let mut rejections: Vec<Rejection> = self
            .rejections
            .iter()
            .filter(|entry| entry.key().1 == driver_id)
            .map(|entry| Rejection {
                order_id: entry.key().0,
                driver_id,
                rejected_at: *entry.value(),
            })
            .collect();
        rejections.sort_by(|a, b| b.rejected_at.cmp(&a.rejected_at));
        Ok(rejections)
    }

    async fn put_location_request(&self, request: LocationRequest) -> Result<(), AppError> {
        self.location_requests.insert(request.driver_id, request);
        Ok(())
    }

    async fn take_location_request(
        &self,
        driver_id: DriverId,
        now: DateTime<Utc>,
    ) -> Result<Option<LocationRequest>, AppError> {
        Ok(self
            .location_requests
            .remove(&driver_id)
            .map(|(_, request)| request)
            .filter(|request| !request.is_expired(now)))
    }

    async fn purge_location_requests(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let before = self.location_requests.len();
        self.location_requests
            .retain(|_, request| !request.is_expired(now));
        Ok(before.saturating_sub(self.location_requests.len()))
    }
}
