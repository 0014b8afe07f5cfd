use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::config::DispatchSettings;
use crate::error::AppError;
use crate::models::dispatch::Rejection;
use crate::models::driver::{Driver, DriverId, GeoPoint, LocationRequest};
use crate::store::Store;

/// Registration details a driver brings along. Shift, availability and
/// rating are owned by the directory and survive re-registration.
#[derive(Debug, Clone)]
pub struct DriverProfile {
    pub id: DriverId,
    pub name: String,
    pub vehicle_plate: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationUpdate {
    pub driver: Driver,
    /// The pending request this position answers, if any.
    pub answered: Option<LocationRequest>,
}

#[derive(Clone)]
pub struct Directory {
    store: Arc<dyn Store>,
    settings: DispatchSettings,
}

impl Directory {
    pub fn new(store: Arc<dyn Store>, settings: DispatchSettings) -> Self {
        Self { store, settings }
    }

    pub async fn register(&self, profile: DriverProfile) -> Result<Driver, AppError> {
        if profile.name.trim().is_empty() {
            return Err(AppError::BadRequest("name cannot be empty".to_string()));
        }

        let mut driver = Driver::new(profile.id, profile.name.trim());
        driver.vehicle_plate = profile.vehicle_plate;
        driver.phone = profile.phone;

        let driver = self.store.upsert_driver(driver).await?;
        info!(driver_id = driver.id, "driver registered");
        Ok(driver)
    }

    pub async fn driver(&self, driver_id: DriverId) -> Result<Driver, AppError> {
        self.store
            .driver(driver_id)
            .await?
            .ok_or_else(|| not_found(driver_id))
    }

    pub async fn drivers(&self) -> Result<Vec<Driver>, AppError> {
        self.store.drivers().await
    }

    /// Starting a shift makes the driver available; ending it clears both
    /// availability and the last known position.
    pub async fn set_shift(&self, driver_id: DriverId, on_shift: bool) -> Result<Driver, AppError> {
        let driver = self
            .store
            .set_shift(driver_id, on_shift, Utc::now())
            .await?
            .ok_or_else(|| not_found(driver_id))?;
        info!(driver_id, on_shift, "shift changed");
        Ok(driver)
    }

    pub async fn set_availability(
        &self,
        driver_id: DriverId,
        available: bool,
    ) -> Result<Driver, AppError> {
        let driver = self
            .store
            .set_availability(driver_id, available)
            .await?
            .ok_or_else(|| not_found(driver_id))?;
        info!(driver_id, available, "availability changed");
        Ok(driver)
    }

    pub async fn update_location(
        &self,
        driver_id: DriverId,
        position: GeoPoint,
    ) -> Result<LocationUpdate, AppError> {
        if !(-90.0..=90.0).contains(&position.lat) || !(-180.0..=180.0).contains(&position.lng) {
            return Err(AppError::BadRequest("coordinates out of range".to_string()));
        }

        let driver = self
            .store
            .set_position(driver_id, position)
            .await?
            .ok_or_else(|| not_found(driver_id))?;
        let answered = self
            .store
            .take_location_request(driver_id, Utc::now())
            .await?;
        if let Some(request) = &answered {
            info!(driver_id, requested_by = request.requested_by, "location request answered");
        }
        Ok(LocationUpdate { driver, answered })
    }

    /// Asks a driver for a fresh position. Replaces any earlier request and
    /// lapses after the configured TTL.
    pub async fn request_location(
        &self,
        driver_id: DriverId,
        requested_by: i64,
    ) -> Result<LocationRequest, AppError> {
        let driver = self.driver(driver_id).await?;
        if !driver.on_shift {
            return Err(AppError::Conflict(format!("driver {driver_id} is not on shift")));
        }

        let request = LocationRequest {
            driver_id,
            requested_by,
            expires_at: Utc::now() + self.settings.location_request_ttl,
        };
        self.store.put_location_request(request.clone()).await?;
        info!(driver_id, requested_by, "location requested");
        Ok(request)
    }

    /// Rejection history of a driver, newest first.
    pub async fn rejections(&self, driver_id: DriverId) -> Result<Vec<Rejection>, AppError> {
        self.driver(driver_id).await?;
        self.store.rejections_by_driver(driver_id).await
    }
}

fn not_found(driver_id: DriverId) -> AppError {
    AppError::NotFound(format!("driver {driver_id} not found"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::{Directory, DriverProfile};
    use crate::config::DispatchSettings;
    use crate::error::AppError;
    use crate::models::driver::GeoPoint;
    use crate::store::MemoryStore;

    fn directory() -> Directory {
        Directory::new(Arc::new(MemoryStore::new()), DispatchSettings::default())
    }

    fn profile(id: i64, name: &str) -> DriverProfile {
        DriverProfile {
            id,
            name: name.to_string(),
            vehicle_plate: None,
            phone: None,
        }
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let result = directory().register(profile(1, "   ")).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn ending_a_shift_forgets_the_position() {
        let directory = directory();
        directory.register(profile(1, "Mykola")).await.unwrap();
        directory.set_shift(1, true).await.unwrap();
        directory
            .update_location(1, GeoPoint { lat: 50.9, lng: 34.8 })
            .await
            .unwrap();

        let driver = directory.set_shift(1, false).await.unwrap();
        assert!(!driver.available);
        assert!(driver.position.is_none());
    }

    #[tokio::test]
    async fn location_update_answers_a_pending_request_once() {
        let directory = directory();
        directory.register(profile(2, "Halyna")).await.unwrap();
        directory.set_shift(2, true).await.unwrap();
        let request = directory.request_location(2, 100).await.unwrap();
        assert!(request.expires_at > chrono::Utc::now() + Duration::minutes(4));

        let point = GeoPoint { lat: 50.91, lng: 34.79 };
        let first = directory.update_location(2, point).await.unwrap();
        assert_eq!(first.answered.map(|r| r.requested_by), Some(100));

        let second = directory.update_location(2, point).await.unwrap();
        assert!(second.answered.is_none());
    }

    #[tokio::test]
    async fn off_shift_drivers_cannot_be_asked_for_a_location() {
        let directory = directory();
        directory.register(profile(3, "Serhii")).await.unwrap();
        let result = directory.request_location(3, 100).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }
}
