use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{DriverCancelOutcome, RejectOutcome};
use crate::error::AppError;
use crate::models::dispatch::DispatchEntry;
use crate::models::driver::{DriverId, GeoPoint};
use crate::models::order::{
    NewOrder, Order, OrderFilter, OrderId, OrderKind, OrderRating, OrderStatus, Place,
    RequesterId, RequesterStanding,
};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/dispatch", get(get_dispatch))
        .route("/orders/:id/accept", post(accept))
        .route("/orders/:id/reject", post(reject))
        .route("/orders/:id/cancel-by-driver", post(cancel_by_driver))
        .route("/orders/:id/cancel", post(cancel))
        .route("/orders/:id/arrived", post(arrived))
        .route("/orders/:id/start", post(start_trip))
        .route("/orders/:id/complete", post(complete))
        .route("/orders/:id/abandon", post(abandon))
        .route("/orders/:id/reassign", post(reassign))
        .route("/orders/:id/rating", post(rate))
        .route("/orders/:id/requester-rating", post(rate_requester))
        .route("/requesters/:id", get(get_requester))
        .route("/orders/:id/preorder/accept", post(accept_preorder))
        .route("/orders/:id/preorder/release", post(release_preorder))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub requester_id: RequesterId,
    pub requester_name: Option<String>,
    pub contact_phone: Option<String>,
    #[serde(flatten)]
    pub kind: OrderKind,
    pub comment: Option<String>,
    pub location: Option<GeoPoint>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl CreateOrderRequest {
    fn validate(self) -> Result<NewOrder, AppError> {
        match &self.kind {
            OrderKind::Ride {
                pickup,
                destination,
            }
            | OrderKind::PickupDelivery {
                pickup,
                destination,
                ..
            } => {
                check_place("pickup", pickup)?;
                check_place("destination", destination)?;
                if pickup == destination {
                    return Err(AppError::BadRequest(
                        "pickup and destination must differ".to_string(),
                    ));
                }
            }
            OrderKind::VoiceRide { recording } => check_text("recording", recording)?,
            OrderKind::BuyDelivery {
                shopping_list,
                destination,
            } => {
                check_text("shopping_list", shopping_list)?;
                check_place("destination", destination)?;
            }
        }
        if let OrderKind::PickupDelivery { details, .. } = &self.kind {
            check_text("details", details)?;
        }
        if let Some(phone) = &self.contact_phone {
            check_phone(phone)?;
        }

        Ok(NewOrder {
            requester_id: self.requester_id,
            requester_name: self.requester_name,
            contact_phone: self.contact_phone,
            kind: self.kind,
            comment: self.comment,
            location: self.location,
            scheduled_at: self.scheduled_at,
        })
    }
}

fn check_text(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn check_place(field: &str, place: &Place) -> Result<(), AppError> {
    match place {
        Place::Text { address } => check_text(field, address),
        Place::Voice { voice_ref } => check_text(field, voice_ref),
        Place::Coordinates { .. } => Ok(()),
    }
}

fn check_phone(phone: &str) -> Result<(), AppError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if !(7..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::BadRequest(format!("invalid phone number: {phone}")));
    }
    Ok(())
}

/// Largest page a listing returns.
const MAX_PAGE: usize = 100;

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
    pub requester_id: Option<RequesterId>,
    pub driver_id: Option<DriverId>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListOrdersQuery {
    fn into_filter(self) -> Result<OrderFilter, AppError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<OrderStatus>)
            .transpose()?;
        Ok(OrderFilter {
            status,
            requester_id: self.requester_id,
            driver_id: self.driver_id,
            limit: Some(self.limit.unwrap_or(MAX_PAGE).min(MAX_PAGE)),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Deserialize)]
pub struct DriverAction {
    pub driver_id: DriverId,
}

#[derive(Deserialize)]
pub struct RequesterAction {
    pub requester_id: RequesterId,
}

#[derive(Deserialize)]
pub struct RateRequest {
    pub requester_id: RequesterId,
    pub score: u8,
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct RateRequesterRequest {
    pub driver_id: DriverId,
    pub score: u8,
    pub comment: Option<String>,
}

#[derive(Serialize)]
pub struct RequesterView {
    pub requester_id: RequesterId,
    #[serde(flatten)]
    pub standing: RequesterStanding,
}

fn rating_from(score: u8, comment: Option<String>) -> OrderRating {
    OrderRating {
        score,
        comment: comment.filter(|comment| !comment.trim().is_empty()),
    }
}

#[derive(Serialize)]
pub struct DispatchView {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub entry: Option<DispatchEntry>,
    pub rejected_drivers: Vec<DriverId>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    let new_order = payload.validate()?;
    let order = state.dispatcher.create_order(new_order).await?;
    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.store.orders(query.into_filter()?).await?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.load_order(id).await?))
}

async fn get_dispatch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
) -> Result<Json<DispatchView>, AppError> {
    let order = state.dispatcher.load_order(id).await?;
    let entry = state.store.dispatch(id).await?;
    let rejected_drivers = state.store.rejected_drivers(id).await?;

    Ok(Json(DispatchView {
        order_id: id,
        status: order.status,
        entry,
        rejected_drivers,
    }))
}

async fn accept(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.accept(id, action.driver_id).await?))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<RejectOutcome>, AppError> {
    state.dispatcher.load_order(id).await?;
    Ok(Json(state.dispatcher.reject(id, action.driver_id).await?))
}

async fn cancel_by_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<DriverCancelOutcome>, AppError> {
    state.dispatcher.load_order(id).await?;
    Ok(Json(
        state
            .dispatcher
            .cancel_by_driver(id, action.driver_id)
            .await?,
    ))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<RequesterAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .dispatcher
            .cancel_by_user(id, action.requester_id)
            .await?,
    ))
}

async fn arrived(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.mark_arrived(id, action.driver_id).await?))
}

async fn start_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.start_trip(id, action.driver_id).await?))
}

async fn complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.complete(id, action.driver_id).await?))
}

async fn abandon(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.abandon_trip(id, action.driver_id).await?))
}

async fn reassign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatcher.reassign(id, action.driver_id).await?))
}

async fn rate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(payload): Json<RateRequest>,
) -> Result<Json<Order>, AppError> {
    let rating = rating_from(payload.score, payload.comment);
    Ok(Json(
        state
            .dispatcher
            .rate(id, payload.requester_id, rating)
            .await?,
    ))
}

async fn rate_requester(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(payload): Json<RateRequesterRequest>,
) -> Result<Json<Order>, AppError> {
    let rating = rating_from(payload.score, payload.comment);
    Ok(Json(
        state
            .dispatcher
            .rate_requester(id, payload.driver_id, rating)
            .await?,
    ))
}

async fn get_requester(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RequesterId>,
) -> Result<Json<RequesterView>, AppError> {
    let standing = state.dispatcher.requester_standing(id).await?;
    Ok(Json(RequesterView {
        requester_id: id,
        standing,
    }))
}

async fn accept_preorder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .dispatcher
            .accept_preorder(id, action.driver_id)
            .await?,
    ))
}

async fn release_preorder(
    State(state): State<Arc<AppState>>,
    Path(id): Path<OrderId>,
    Json(action): Json<DriverAction>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .dispatcher
            .release_preorder(id, action.driver_id)
            .await?,
    ))
}
