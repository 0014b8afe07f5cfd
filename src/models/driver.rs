use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DriverId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub vehicle_plate: Option<String>,
    pub phone: Option<String>,
    pub on_shift: bool,
    pub available: bool,
    pub position: Option<GeoPoint>,
    pub shift_started_at: Option<DateTime<Utc>>,
    pub rating: f64,
    pub rating_count: u32,
}

impl Driver {
    pub fn new(id: DriverId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            vehicle_plate: None,
            phone: None,
            on_shift: false,
            available: false,
            position: None,
            shift_started_at: None,
            rating: 0.0,
            rating_count: 0,
        }
    }

    /// Eligible for new offers: on shift and not paused.
    pub fn is_dispatchable(&self) -> bool {
        self.on_shift && self.available
    }

    pub fn card(&self) -> DriverCard {
        DriverCard {
            id: self.id,
            name: self.name.clone(),
            vehicle_plate: self.vehicle_plate.clone(),
            phone: self.phone.clone(),
            rating: (self.rating_count > 0).then_some(self.rating),
        }
    }
}

/// What a requester gets to see about the driver who took their order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverCard {
    pub id: DriverId,
    pub name: String,
    pub vehicle_plate: Option<String>,
    pub phone: Option<String>,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRequest {
    pub driver_id: DriverId,
    pub requested_by: i64,
    pub expires_at: DateTime<Utc>,
}

impl LocationRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
