//! What happens to an order once a driver holds it, plus the requester and
//! admin actions that can cut in at any point.

use chrono::Utc;
use tracing::info;

use crate::engine::coordinator::Dispatcher;
use crate::error::AppError;
use crate::models::driver::{Driver, DriverId};
use crate::models::order::{
    Order, OrderId, OrderRating, OrderStatus, RequesterId, RequesterStanding,
};
use crate::notify::RequesterEvent;
use crate::store::OrderTransition;

/// Reviews of a requester shown to drivers along with an offer.
pub const RECENT_REVIEWS: usize = 3;

impl Dispatcher {
    pub async fn mark_arrived(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let order = self.load_order(order_id).await?;
        let waiting = matches!(
            order.status,
            OrderStatus::Accepted | OrderStatus::AcceptedPreorder
        );
        if !waiting || order.assigned_driver != Some(driver_id) {
            return Err(AppError::NoLongerAvailable(order_id));
        }

        info!(order_id, driver_id, "driver arrived");
        let card = self.store.driver(driver_id).await?.map(|driver| driver.card());
        self.tell_requester(&order, RequesterEvent::DriverArrived, card)
            .await;
        Ok(order)
    }

    pub async fn start_trip(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let start = OrderTransition::new(
            &[OrderStatus::Accepted, OrderStatus::AcceptedPreorder],
            OrderStatus::InProgress,
        )
        .by_driver(driver_id);
        let order = self.driver_transition(order_id, &start).await?;
        info!(order_id, driver_id, "trip started");
        Ok(order)
    }

    pub async fn complete(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let finish = OrderTransition::new(
            &[OrderStatus::Accepted, OrderStatus::InProgress],
            OrderStatus::Completed,
        )
        .by_driver(driver_id);
        let order = self.driver_transition(order_id, &finish).await?;
        self.metrics.outcome("completed");
        info!(order_id, driver_id, "order completed");
        Ok(order)
    }

    /// Ends a trip that already started. The passenger is with the driver,
    /// so there is nobody left to re-dispatch to.
    pub async fn abandon_trip(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let abandon =
            OrderTransition::new(&[OrderStatus::InProgress], OrderStatus::CancelledByDriver)
                .by_driver(driver_id);
        let order = self.driver_transition(order_id, &abandon).await?;
        self.metrics.outcome("abandoned");
        info!(order_id, driver_id, "trip abandoned by driver");
        self.tell_requester(&order, RequesterEvent::Cancelled, None)
            .await;
        Ok(order)
    }

    pub async fn cancel_by_user(
        &self,
        order_id: OrderId,
        requester_id: RequesterId,
    ) -> Result<Order, AppError> {
        let before = self.load_order(order_id).await?;
        let entry = self.store.dispatch(order_id).await?;

        let cancel = OrderTransition::new(
            &[
                OrderStatus::PendingCreation,
                OrderStatus::Scheduled,
                OrderStatus::Searching,
                OrderStatus::Accepted,
                OrderStatus::AcceptedPreorder,
            ],
            OrderStatus::CancelledByUser,
        )
        .by_requester(requester_id);
        let Some(order) = self
            .store
            .transition_order(order_id, &cancel, Utc::now())
            .await?
        else {
            if before.requester_id != requester_id {
                return Err(AppError::NotFound(format!("order {order_id} not found")));
            }
            return Err(AppError::Conflict(format!(
                "order {order_id} can no longer be cancelled"
            )));
        };
        self.store.remove_dispatch(order_id).await?;
        self.metrics.outcome("cancelled_by_user");
        info!(order_id, requester_id, previous = %before.status, "order cancelled by requester");

        let offered = entry.and_then(|entry| entry.offered_candidate());
        if let Some(driver_id) = before.assigned_driver.or(offered) {
            self.release_driver(driver_id, order_id).await;
        }
        self.tell_requester(&order, RequesterEvent::Cancelled, None)
            .await;
        Ok(order)
    }

    /// Admin override: hands a searching or accepted order to a chosen driver.
    pub async fn reassign(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let driver = self.on_shift_driver(driver_id).await?;
        let before = self.load_order(order_id).await?;
        let entry = self.store.dispatch(order_id).await?;

        let reassign = OrderTransition::new(
            &[OrderStatus::Searching, OrderStatus::Accepted],
            OrderStatus::Accepted,
        )
        .assigning(driver_id);
        let Some(order) = self
            .store
            .transition_order(order_id, &reassign, Utc::now())
            .await?
        else {
            return Err(AppError::Conflict(format!(
                "order {order_id} can no longer be reassigned"
            )));
        };
        self.store.remove_dispatch(order_id).await?;
        self.metrics.outcome("reassigned");
        info!(order_id, driver_id, previous = ?before.assigned_driver, "order reassigned");

        let offered = entry.and_then(|entry| entry.offered_candidate());
        if let Some(previous) = before
            .assigned_driver
            .or(offered)
            .filter(|previous| *previous != driver_id)
        {
            self.release_driver(previous, order_id).await;
        }
        self.tell_requester(&order, RequesterEvent::OfferAccepted, Some(driver.card()))
            .await;
        Ok(order)
    }

    /// One rating per completed order, folded into the driver's average.
    pub async fn rate(
        &self,
        order_id: OrderId,
        requester_id: RequesterId,
        rating: OrderRating,
    ) -> Result<Order, AppError> {
        check_score(&rating)?;
        let order = self.load_order(order_id).await?;
        if order.requester_id != requester_id {
            return Err(AppError::NotFound(format!("order {order_id} not found")));
        }

        let score = rating.score;
        let Some(rated) = self.store.rate_order(order_id, rating).await? else {
            return Err(AppError::Conflict(format!(
                "order {order_id} is not completed or was already rated"
            )));
        };
        if let Some(driver_id) = rated.assigned_driver {
            self.store.add_driver_rating(driver_id, score).await?;
        }
        info!(order_id, score, "order rated");
        Ok(rated)
    }

    /// The driver's side of the rating: one score for the requester per
    /// completed order. Drivers see the aggregate on later offers.
    pub async fn rate_requester(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
        rating: OrderRating,
    ) -> Result<Order, AppError> {
        check_score(&rating)?;
        let order = self.load_order(order_id).await?;
        if order.assigned_driver != Some(driver_id) {
            return Err(AppError::NotFound(format!("order {order_id} not found")));
        }

        let score = rating.score;
        let Some(rated) = self.store.rate_requester(order_id, rating).await? else {
            return Err(AppError::Conflict(format!(
                "order {order_id} is not completed or the client was already rated"
            )));
        };
        info!(order_id, driver_id, requester_id = rated.requester_id, score, "client rated");
        Ok(rated)
    }

    pub async fn requester_standing(
        &self,
        requester_id: RequesterId,
    ) -> Result<RequesterStanding, AppError> {
        self.store
            .requester_standing(requester_id, RECENT_REVIEWS)
            .await
    }

    /// A driver claims a preorder ahead of its scheduled time.
    pub async fn accept_preorder(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let driver = self.on_shift_driver(driver_id).await?;
        let claim = OrderTransition::new(&[OrderStatus::Scheduled], OrderStatus::AcceptedPreorder)
            .assigning(driver_id);
        let order = self.driver_transition(order_id, &claim).await?;

        self.metrics.outcome("preorder_accepted");
        info!(order_id, driver_id, "preorder claimed");
        self.tell_requester(&order, RequesterEvent::PreorderAccepted, Some(driver.card()))
            .await;
        Ok(order)
    }

    /// Gives a claimed preorder back; it waits for activation like any other.
    pub async fn release_preorder(
        &self,
        order_id: OrderId,
        driver_id: DriverId,
    ) -> Result<Order, AppError> {
        let release = OrderTransition::new(&[OrderStatus::AcceptedPreorder], OrderStatus::Scheduled)
            .by_driver(driver_id);
        let order = self.driver_transition(order_id, &release).await?;

        self.metrics.outcome("preorder_released");
        info!(order_id, driver_id, "preorder released");
        self.tell_requester(&order, RequesterEvent::PreorderReleased, None)
            .await;
        Ok(order)
    }

    async fn driver_transition(
        &self,
        order_id: OrderId,
        transition: &OrderTransition,
    ) -> Result<Order, AppError> {
        match self
            .store
            .transition_order(order_id, transition, Utc::now())
            .await?
        {
            Some(order) => Ok(order),
            None => {
                self.load_order(order_id).await?;
                Err(AppError::NoLongerAvailable(order_id))
            }
        }
    }

    async fn on_shift_driver(&self, driver_id: DriverId) -> Result<Driver, AppError> {
        let driver = self
            .store
            .driver(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
        if !driver.on_shift {
            return Err(AppError::Conflict(format!("driver {driver_id} is not on shift")));
        }
        Ok(driver)
    }
}

fn check_score(rating: &OrderRating) -> Result<(), AppError> {
    if !(1..=5).contains(&rating.score) {
        return Err(AppError::BadRequest("score must be between 1 and 5".to_string()));
    }
    Ok(())
}
