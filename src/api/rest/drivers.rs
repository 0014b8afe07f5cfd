use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::engine::{DriverProfile, LocationUpdate};
use crate::error::AppError;
use crate::models::dispatch::Rejection;
use crate::models::driver::{Driver, DriverId, GeoPoint, LocationRequest};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id", get(get_driver))
        .route("/drivers/:id/shift", post(update_shift))
        .route("/drivers/:id/availability", patch(update_availability))
        .route("/drivers/:id/location", patch(update_location))
        .route("/drivers/:id/location-request", post(request_location))
        .route("/drivers/:id/rejections", get(list_rejections))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub id: DriverId,
    pub name: String,
    pub vehicle_plate: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateShiftRequest {
    pub on_shift: bool,
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub available: bool,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct LocationRequestBody {
    pub requested_by: i64,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    let driver = state
        .directory
        .register(DriverProfile {
            id: payload.id,
            name: payload.name,
            vehicle_plate: payload.vehicle_plate,
            phone: payload.phone,
        })
        .await?;
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Driver>>, AppError> {
    Ok(Json(state.directory.drivers().await?))
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DriverId>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.directory.driver(id).await?))
}

async fn update_shift(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DriverId>,
    Json(payload): Json<UpdateShiftRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.directory.set_shift(id, payload.on_shift).await?))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DriverId>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(
        state
            .directory
            .set_availability(id, payload.available)
            .await?,
    ))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DriverId>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<LocationUpdate>, AppError> {
    Ok(Json(
        state
            .directory
            .update_location(id, payload.location)
            .await?,
    ))
}

async fn request_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DriverId>,
    Json(payload): Json<LocationRequestBody>,
) -> Result<Json<LocationRequest>, AppError> {
    Ok(Json(
        state
            .directory
            .request_location(id, payload.requested_by)
            .await?,
    ))
}

async fn list_rejections(
    State(state): State<Arc<AppState>>,
    Path(id): Path<DriverId>,
) -> Result<Json<Vec<Rejection>>, AppError> {
    Ok(Json(state.directory.rejections(id).await?))
}
