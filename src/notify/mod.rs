//! Notification sink between the dispatch engine and whatever talks to
//! drivers and requesters.
//!
//! Every method is best effort. A failure comes back as a
//! [`NotificationError`] and never undoes the state change that triggered it.

pub mod render;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::queue::DispatchPayload;
use crate::error::NotificationError;
use crate::models::driver::{DriverCard, DriverId};
use crate::models::order::{Order, OrderId, RequesterId};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequesterEvent {
    OfferAccepted,
    DriverArrived,
    NoDriversAvailable,
    DriverCancelledRerouting,
    SearchStarted,
    PreorderAccepted,
    PreorderReleased,
    Cancelled,
}

impl RequesterEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            RequesterEvent::OfferAccepted => "offer_accepted",
            RequesterEvent::DriverArrived => "driver_arrived",
            RequesterEvent::NoDriversAvailable => "no_drivers_available",
            RequesterEvent::DriverCancelledRerouting => "driver_cancelled_rerouting",
            RequesterEvent::SearchStarted => "search_started",
            RequesterEvent::PreorderAccepted => "preorder_accepted",
            RequesterEvent::PreorderReleased => "preorder_released",
            RequesterEvent::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequesterNotice {
    pub order_id: OrderId,
    pub event: RequesterEvent,
    pub driver: Option<DriverCard>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OfferAction {
    pub label: &'static str,
    pub method: &'static str,
    pub path: String,
}

/// An order proposed to one driver, with the two ways to answer it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Offer {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub text: String,
    pub actions: Vec<OfferAction>,
}

impl Offer {
    pub fn new(driver_id: DriverId, payload: &DispatchPayload, distance_km: Option<f64>) -> Self {
        let order_id = payload.order.id;
        Self {
            order_id,
            driver_id,
            text: render::offer_text(payload, distance_km),
            actions: vec![
                OfferAction {
                    label: "accept",
                    method: "POST",
                    path: format!("/orders/{order_id}/accept"),
                },
                OfferAction {
                    label: "reject",
                    method: "POST",
                    path: format!("/orders/{order_id}/reject"),
                },
            ],
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_driver_offer(
        &self,
        driver_id: DriverId,
        offer: &Offer,
    ) -> Result<(), NotificationError>;

    async fn notify_requester(
        &self,
        requester_id: RequesterId,
        notice: &RequesterNotice,
    ) -> Result<(), NotificationError>;

    async fn notify_driver_timeout(
        &self,
        driver_id: DriverId,
        order_id: OrderId,
    ) -> Result<(), NotificationError>;

    /// Upcoming accepted preorder.
    async fn notify_driver_reminder(
        &self,
        driver_id: DriverId,
        order: &Order,
    ) -> Result<(), NotificationError>;

    /// The driver no longer has anything to do with the order.
    async fn notify_driver_released(
        &self,
        driver_id: DriverId,
        order_id: OrderId,
    ) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Driver(DriverId),
    Requester(RequesterId),
}

/// One published notification, as seen on the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub recipient: Recipient,
    pub order_id: OrderId,
    pub event: &'static str,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<Offer>,
}

impl DispatchEvent {
    fn new(recipient: Recipient, order_id: OrderId, event: &'static str, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            recipient,
            order_id,
            event,
            text,
            offer: None,
        }
    }
}

/// Publishes every notification on a broadcast channel. Having no subscriber
/// is not a delivery failure: the stream is an observer, not the recipient.
#[derive(Clone)]
pub struct BroadcastNotifier {
    events_tx: broadcast::Sender<DispatchEvent>,
}

impl BroadcastNotifier {
    pub fn new(events_tx: broadcast::Sender<DispatchEvent>) -> Self {
        Self { events_tx }
    }

    fn publish(&self, event: DispatchEvent) {
        tracing::debug!(
            order_id = event.order_id,
            event = event.event,
            recipient = ?event.recipient,
            "notification published"
        );
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify_driver_offer(
        &self,
        driver_id: DriverId,
        offer: &Offer,
    ) -> Result<(), NotificationError> {
        let mut event = DispatchEvent::new(
            Recipient::Driver(driver_id),
            offer.order_id,
            "offer",
            offer.text.clone(),
        );
        event.offer = Some(offer.clone());
        self.publish(event);
        Ok(())
    }

    async fn notify_requester(
        &self,
        requester_id: RequesterId,
        notice: &RequesterNotice,
    ) -> Result<(), NotificationError> {
        self.publish(DispatchEvent::new(
            Recipient::Requester(requester_id),
            notice.order_id,
            notice.event.as_str(),
            render::requester_text(notice),
        ));
        Ok(())
    }

    async fn notify_driver_timeout(
        &self,
        driver_id: DriverId,
        order_id: OrderId,
    ) -> Result<(), NotificationError> {
        self.publish(DispatchEvent::new(
            Recipient::Driver(driver_id),
            order_id,
            "offer_expired",
            format!("The offer for order #{order_id} has expired"),
        ));
        Ok(())
    }

    async fn notify_driver_reminder(
        &self,
        driver_id: DriverId,
        order: &Order,
    ) -> Result<(), NotificationError> {
        let when = order
            .scheduled_at
            .map(|at| at.format("%H:%M UTC").to_string())
            .unwrap_or_else(|| "soon".to_string());
        self.publish(DispatchEvent::new(
            Recipient::Driver(driver_id),
            order.id,
            "preorder_reminder",
            format!("Reminder: scheduled order #{} starts at {when}", order.id),
        ));
        Ok(())
    }

    async fn notify_driver_released(
        &self,
        driver_id: DriverId,
        order_id: OrderId,
    ) -> Result<(), NotificationError> {
        self.publish(DispatchEvent::new(
            Recipient::Driver(driver_id),
            order_id,
            "released",
            format!("Order #{order_id} is no longer yours"),
        ));
        Ok(())
    }
}
