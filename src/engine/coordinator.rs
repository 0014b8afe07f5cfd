//! Offer chain of an order: who gets the offer next, and what happens when
//! they say yes, no, or nothing at all.
//!
//! Nothing here holds a lock. Every contested step is a conditional write in
//! the store, and a caller that loses one just stops.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DispatchSettings;
use crate::engine::lifecycle::RECENT_REVIEWS;
use crate::engine::queue::DispatchPayload;
use crate::engine::ranking::rank;
use crate::error::{AppError, NotificationError};
use crate::geo::haversine_km;
use crate::models::dispatch::DispatchEntry;
use crate::models::driver::{DriverCard, DriverId};
use crate::models::order::{NewOrder, Order, OrderId, OrderStatus};
use crate::notify::{Notifier, Offer, RequesterEvent, RequesterNotice};
use crate::observability::metrics::Metrics;
use crate::store::{OrderTransition, Store};

/// Statuses from which an order may (re)enter the offer chain.
const DISPATCHABLE: [OrderStatus; 3] = [
    OrderStatus::PendingCreation,
    OrderStatus::Scheduled,
    OrderStatus::Searching,
];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// An offer to this driver is out.
    Offered { driver_id: DriverId },
    /// Every candidate said no or never answered.
    Exhausted,
    /// Nobody was eligible when the chain was built.
    NoDrivers,
    /// An activated preorder with no supply, waiting for the next activation pass.
    Held,
    /// Nothing left to do here: the order moved on or another caller got there first.
    Resolved,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RejectOutcome {
    Advanced { next: DispatchOutcome },
    /// The pointer had already moved past this driver.
    NotCurrentCandidate,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DriverCancelOutcome {
    Rerouted { next: DispatchOutcome },
    /// The driver no longer held the order.
    NotApplicable,
}

#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) metrics: Metrics,
    pub(crate) settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        metrics: Metrics,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            notifier,
            metrics,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Records a validated order and, unless it is scheduled for later,
    /// starts looking for a driver right away.
    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order, AppError> {
        let order = self.store.insert_order(new_order, Utc::now()).await?;
        info!(
            order_id = order.id,
            requester_id = order.requester_id,
            kind = order.kind.label(),
            status = %order.status,
            "order created"
        );

        if order.status != OrderStatus::PendingCreation {
            return Ok(order);
        }

        let outcome = self.start_dispatch(order.id, None).await?;
        info!(order_id = order.id, ?outcome, "initial dispatch finished");
        self.load_order(order.id).await
    }

    pub async fn load_order(&self, order_id: OrderId) -> Result<Order, AppError> {
        self.store
            .order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    /// Builds a fresh candidate list and sends the first offer.
    ///
    /// Replaces any previous queue entry of the order, pointer included.
    pub async fn start_dispatch(
        &self,
        order_id: OrderId,
        exclude_driver: Option<DriverId>,
    ) -> Result<DispatchOutcome, AppError> {
        let order = self.load_order(order_id).await?;
        if !DISPATCHABLE.contains(&order.status) {
            return Ok(DispatchOutcome::Resolved);
        }

        let mut excluded: HashSet<DriverId> = self
            .store
            .rejected_drivers(order_id)
            .await?
            .into_iter()
            .collect();
        excluded.extend(exclude_driver);

        let drivers = self.store.drivers().await?;
        let candidates = rank(order.dispatch_point(), &excluded, &drivers);
        let now = Utc::now();

        if candidates.is_empty() {
            if order.status == OrderStatus::Scheduled && order.pending_dispatch_at.is_some() {
                info!(order_id, "no drivers for activated preorder, holding");
                return Ok(DispatchOutcome::Held);
            }

            let give_up = OrderTransition::new(&DISPATCHABLE, OrderStatus::CancelledNoDrivers);
            let Some(cancelled) = self.store.transition_order(order_id, &give_up, now).await?
            else {
                return Ok(DispatchOutcome::Resolved);
            };
            self.store.remove_dispatch(order_id).await?;
            self.metrics.outcome("no_drivers");
            info!(order_id, excluded = excluded.len(), "no eligible drivers");
            self.tell_requester(&cancelled, RequesterEvent::NoDriversAvailable, None)
                .await;
            return Ok(DispatchOutcome::NoDrivers);
        }

        let standing = self
            .store
            .requester_standing(order.requester_id, RECENT_REVIEWS)
            .await?;
        let payload = DispatchPayload::snapshot(&order, standing).encode()?;
        info!(order_id, candidates = ?candidates, "dispatch started");
        self.store
            .put_dispatch(DispatchEntry::new(order_id, candidates, payload, now))
            .await?;

        let to_searching = OrderTransition::new(&DISPATCHABLE, OrderStatus::Searching);
        if self
            .store
            .transition_order(order_id, &to_searching, now)
            .await?
            .is_none()
        {
            self.store.remove_dispatch(order_id).await?;
            return Ok(DispatchOutcome::Resolved);
        }

        self.advance(order_id).await
    }

    /// Makes sure the candidate under the pointer has an offer, skipping
    /// candidates that cannot be reached and closing the order once the list
    /// runs out. Safe to call again at any time.
    pub async fn advance(&self, order_id: OrderId) -> Result<DispatchOutcome, AppError> {
        loop {
            let Some(entry) = self.store.dispatch(order_id).await? else {
                return Ok(DispatchOutcome::Resolved);
            };

            let status = self.store.order(order_id).await?.map(|order| order.status);
            if status != Some(OrderStatus::Searching) {
                self.store.remove_dispatch(order_id).await?;
                return Ok(DispatchOutcome::Resolved);
            }

            let Some(driver_id) = entry.current_candidate() else {
                return self.close_exhausted(order_id).await;
            };

            if entry.last_offer_sent_at.is_some() {
                return Ok(DispatchOutcome::Offered { driver_id });
            }

            let payload = DispatchPayload::decode(&entry.payload)?;
            let driver = self.store.driver(driver_id).await?;
            let distance_km = match (payload.order.dispatch_point(), driver) {
                (Some(point), Some(driver)) => driver
                    .position
                    .map(|position| haversine_km(&position, &point)),
                _ => None,
            };
            let offer = Offer::new(driver_id, &payload, distance_km);

            match self.notifier.notify_driver_offer(driver_id, &offer).await {
                Ok(()) => {
                    self.metrics.offers_total.with_label_values(&["sent"]).inc();
                    let now = Utc::now();
                    if !self
                        .store
                        .mark_offer_sent(order_id, entry.current_index, now)
                        .await?
                    {
                        // pointer moved while the offer was in flight
                        return Ok(DispatchOutcome::Resolved);
                    }
                    info!(order_id, driver_id, index = entry.current_index, "offer sent");
                    return Ok(DispatchOutcome::Offered { driver_id });
                }
                Err(err) => {
                    self.metrics
                        .offers_total
                        .with_label_values(&["unreachable"])
                        .inc();
                    warn!(
                        order_id,
                        driver_id,
                        error = %err,
                        "offer not delivered, skipping driver"
                    );

                    let now = Utc::now();
                    self.store.record_rejection(order_id, driver_id, now).await?;
                    if !self
                        .store
                        .advance_dispatch(order_id, entry.current_index, now)
                        .await?
                    {
                        return Ok(DispatchOutcome::Resolved);
                    }
                }
            }
        }
    }

    async fn close_exhausted(&self, order_id: OrderId) -> Result<DispatchOutcome, AppError> {
        let give_up =
            OrderTransition::new(&[OrderStatus::Searching], OrderStatus::CancelledNoDrivers);
        let cancelled = self
            .store
            .transition_order(order_id, &give_up, Utc::now())
            .await?;
        self.store.remove_dispatch(order_id).await?;

        let Some(order) = cancelled else {
            return Ok(DispatchOutcome::Resolved);
        };
        self.metrics.outcome("exhausted");
        info!(order_id, "candidate list exhausted");
        self.tell_requester(&order, RequesterEvent::NoDriversAvailable, None)
            .await;
        Ok(DispatchOutcome::Exhausted)
    }

    /// The single point where racing drivers are told apart: exactly one
    /// `searching -> accepted` write can succeed.
    pub async fn accept(&self, order_id: OrderId, driver_id: DriverId) -> Result<Order, AppError> {
        let driver = self
            .store
            .driver(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;

        let accept = OrderTransition::new(&[OrderStatus::Searching], OrderStatus::Accepted)
            .assigning(driver_id);
        let Some(order) = self
            .store
            .transition_order(order_id, &accept, Utc::now())
            .await?
        else {
            self.metrics.outcome("accept_lost");
            info!(order_id, driver_id, "accept arrived after the order moved on");
            return Err(AppError::NoLongerAvailable(order_id));
        };

        if let Err(err) = self.store.remove_dispatch(order_id).await {
            // a leftover entry is dropped by the next advance or sweep
            warn!(order_id, error = %err, "failed to drop queue entry after accept");
        }
        self.metrics.outcome("accepted");
        info!(order_id, driver_id, "order accepted");
        self.tell_requester(&order, RequesterEvent::OfferAccepted, Some(driver.card()))
            .await;
        Ok(order)
    }

    pub async fn reject(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<RejectOutcome, AppError> {
        let Some(entry) = self.store.dispatch(order_id).await? else {
            return Ok(RejectOutcome::NotCurrentCandidate);
        };
        if entry.current_candidate() != Some(driver_id) {
            info!(order_id, driver_id, "stale rejection ignored");
            return Ok(RejectOutcome::NotCurrentCandidate);
        }

        let now = Utc::now();
        self.store.record_rejection(order_id, driver_id, now).await?;
        if !self
            .store
            .advance_dispatch(order_id, entry.current_index, now)
            .await?
        {
            return Ok(RejectOutcome::NotCurrentCandidate);
        }
        self.metrics.outcome("rejected");
        info!(order_id, driver_id, "offer rejected");

        let next = self.advance(order_id).await?;
        Ok(RejectOutcome::Advanced { next })
    }

    /// Handles an offer that went unanswered, or a queued candidate whose
    /// offer never went out. `now` is the sweep's clock.
    pub async fn expire_offer(
        &self,
        entry: &DispatchEntry,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, AppError> {
        let order_id = entry.order_id;
        let Some(driver_id) = entry.current_candidate() else {
            return self.advance(order_id).await;
        };

        // `entry` is the sweep's snapshot and may be outdated by now
        if !self
            .store
            .expire_dispatch(order_id, entry.current_index, entry.last_offer_sent_at, now)
            .await?
        {
            info!(order_id, driver_id, "expiry overtaken, nothing to do");
            return Ok(DispatchOutcome::Resolved);
        }

        if entry.last_offer_sent_at.is_some() {
            self.metrics.outcome("expired");
            info!(order_id, driver_id, "offer expired");
            if let Err(err) = self.notifier.notify_driver_timeout(driver_id, order_id).await {
                self.notification_failed("driver", order_id, &err);
            }
        } else {
            self.metrics.outcome("stale");
            warn!(order_id, driver_id, "offer was never sent, skipping driver");
        }

        self.store.record_rejection(order_id, driver_id, now).await?;
        self.advance(order_id).await
    }

    pub async fn cancel_by_driver(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<DriverCancelOutcome, AppError> {
        let revert = OrderTransition::new(&[OrderStatus::Accepted], OrderStatus::Searching)
            .by_driver(driver_id);
        let Some(order) = self
            .store
            .transition_order(order_id, &revert, Utc::now())
            .await?
        else {
            return Ok(DriverCancelOutcome::NotApplicable);
        };

        self.store
            .record_rejection(order_id, driver_id, Utc::now())
            .await?;
        self.metrics.outcome("driver_cancelled");
        info!(order_id, driver_id, "driver cancelled, rerouting");
        self.tell_requester(&order, RequesterEvent::DriverCancelledRerouting, None)
            .await;

        let next = self.start_dispatch(order_id, Some(driver_id)).await?;
        Ok(DriverCancelOutcome::Rerouted { next })
    }

    pub(crate) async fn tell_requester(
        &self,
        order: &Order,
        event: RequesterEvent,
        driver: Option<DriverCard>,
    ) {
        let notice = RequesterNotice {
            order_id: order.id,
            event,
            driver,
        };
        if let Err(err) = self.notifier.notify_requester(order.requester_id, &notice).await {
            self.notification_failed("requester", order.id, &err);
        }
    }

    pub(crate) async fn release_driver(&self, driver_id: DriverId, order_id: OrderId) {
        if let Err(err) = self.notifier.notify_driver_released(driver_id, order_id).await {
            self.notification_failed("driver", order_id, &err);
        }
    }

    pub(crate) fn notification_failed(
        &self,
        channel: &str,
        order_id: OrderId,
        err: &NotificationError,
    ) {
        self.metrics
            .notifications_failed_total
            .with_label_values(&[channel])
            .inc();
        warn!(order_id, channel, error = %err, "notification failed");
    }
}
