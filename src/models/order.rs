use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::driver::{DriverId, GeoPoint};

pub type OrderId = i64;
pub type RequesterId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingCreation,
    Scheduled,
    Searching,
    Accepted,
    InProgress,
    Completed,
    CancelledByUser,
    CancelledByDriver,
    CancelledNoDrivers,
    AcceptedPreorder,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 10] = [
        OrderStatus::PendingCreation,
        OrderStatus::Scheduled,
        OrderStatus::Searching,
        OrderStatus::Accepted,
        OrderStatus::InProgress,
        OrderStatus::Completed,
        OrderStatus::CancelledByUser,
        OrderStatus::CancelledByDriver,
        OrderStatus::CancelledNoDrivers,
        OrderStatus::AcceptedPreorder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::PendingCreation => "pending_creation",
            OrderStatus::Scheduled => "scheduled",
            OrderStatus::Searching => "searching",
            OrderStatus::Accepted => "accepted",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Completed => "completed",
            OrderStatus::CancelledByUser => "cancelled_by_user",
            OrderStatus::CancelledByDriver => "cancelled_by_driver",
            OrderStatus::CancelledNoDrivers => "cancelled_no_drivers",
            OrderStatus::AcceptedPreorder => "accepted_preorder",
        }
    }

    /// Statuses in which `assigned_driver` must be set.
    pub fn holds_driver(self) -> bool {
        matches!(
            self,
            OrderStatus::Accepted
                | OrderStatus::InProgress
                | OrderStatus::Completed
                | OrderStatus::AcceptedPreorder
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::CancelledByUser
                | OrderStatus::CancelledByDriver
                | OrderStatus::CancelledNoDrivers
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| AppError::BadRequest(format!("unknown order status: {raw}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Place {
    Text { address: String },
    Voice { voice_ref: String },
    Coordinates { point: GeoPoint, label: Option<String> },
}

impl Place {
    pub fn point(&self) -> Option<GeoPoint> {
        match self {
            Place::Coordinates { point, .. } => Some(*point),
            Place::Text { .. } | Place::Voice { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderKind {
    Ride {
        pickup: Place,
        destination: Place,
    },
    /// Everything, addresses included, lives in a single voice recording.
    VoiceRide {
        recording: String,
    },
    PickupDelivery {
        pickup: Place,
        destination: Place,
        details: String,
    },
    BuyDelivery {
        shopping_list: String,
        destination: Place,
    },
}

impl OrderKind {
    pub fn label(&self) -> &'static str {
        match self {
            OrderKind::Ride { .. } => "ride",
            OrderKind::VoiceRide { .. } => "voice_ride",
            OrderKind::PickupDelivery { .. } => "pickup_delivery",
            OrderKind::BuyDelivery { .. } => "buy_delivery",
        }
    }

    pub fn pickup(&self) -> Option<&Place> {
        match self {
            OrderKind::Ride { pickup, .. } | OrderKind::PickupDelivery { pickup, .. } => {
                Some(pickup)
            }
            OrderKind::VoiceRide { .. } | OrderKind::BuyDelivery { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRating {
    pub score: u8,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub requester_id: RequesterId,
    pub requester_name: Option<String>,
    pub contact_phone: Option<String>,
    pub kind: OrderKind,
    pub comment: Option<String>,
    pub location: Option<GeoPoint>,
    pub status: OrderStatus,
    pub assigned_driver: Option<DriverId>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub pending_dispatch_at: Option<DateTime<Utc>>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The requester's rating of the driver.
    pub rating: Option<OrderRating>,
    /// The driver's rating of the requester.
    pub requester_rating: Option<OrderRating>,
}

impl Order {
    /// Point used for ranking drivers: explicit coordinates win over the pickup place.
    pub fn dispatch_point(&self) -> Option<GeoPoint> {
        self.location
            .or_else(|| self.kind.pickup().and_then(Place::point))
    }
}

/// Fields the intake layer has already validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub requester_id: RequesterId,
    pub requester_name: Option<String>,
    pub contact_phone: Option<String>,
    pub kind: OrderKind,
    pub comment: Option<String>,
    pub location: Option<GeoPoint>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Criteria for listing orders. Results come newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub requester_id: Option<RequesterId>,
    pub driver_id: Option<DriverId>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl OrderFilter {
    pub fn with_status(status: OrderStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        self.status.is_none_or(|status| order.status == status)
            && self
                .requester_id
                .is_none_or(|requester| order.requester_id == requester)
            && self
                .driver_id
                .is_none_or(|driver| order.assigned_driver == Some(driver))
    }
}

/// How drivers have rated a requester so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequesterStanding {
    pub rating: Option<f64>,
    pub rating_count: u32,
    /// Most recent ratings first.
    pub recent_reviews: Vec<OrderRating>,
}

impl RequesterStanding {
    /// Builds the standing from ratings ordered newest first.
    pub fn from_ratings(ratings: Vec<OrderRating>, keep_reviews: usize) -> Self {
        let rating_count = u32::try_from(ratings.len()).unwrap_or(u32::MAX);
        let rating = (!ratings.is_empty()).then(|| {
            let total: f64 = ratings.iter().map(|rating| f64::from(rating.score)).sum();
            total / ratings.len() as f64
        });
        let mut recent_reviews = ratings;
        recent_reviews.truncate(keep_reviews);
        Self {
            rating,
            rating_count,
            recent_reviews,
        }
    }
}

impl NewOrder {
    pub fn initial_status(&self, now: DateTime<Utc>) -> OrderStatus {
        match self.scheduled_at {
            Some(at) if at > now => OrderStatus::Scheduled,
            _ => OrderStatus::PendingCreation,
        }
    }
}
