use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::rest::orders::SortQuery;
use crate::error::AppError;
use crate::models::driver::{
    AccountStatus, Availability, DeliveryHistoryEntry, DriverProfile, NewDriver,
};
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id", get(get_driver))
        .route("/drivers/:id/availability", patch(update_availability))
        .route("/drivers/:id/account", patch(update_account_status))
        .route("/drivers/:id/orders", get(driver_orders))
        .route("/drivers/:id/orders/active", get(oldest_active_order))
        .route(
            "/drivers/:id/deliveries",
            post(record_delivery).get(delivery_history),
        )
        .route("/drivers/:id/deliveries/:order_id/rating", post(rate_delivery))
        .route("/drivers/:id/earnings", get(earnings))
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub availability: Availability,
}

#[derive(Deserialize)]
pub struct UpdateAccountRequest {
    pub account_status: AccountStatus,
}

#[derive(Deserialize)]
pub struct RecordDeliveryRequest {
    pub order_id: i64,
    #[serde(default)]
    pub picked_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
}

#[derive(Deserialize)]
pub struct RateDeliveryRequest {
    pub rating: u8,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Serialize)]
pub struct EarningsResponse {
    pub driver: String,
    pub total_earnings: f64,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewDriver>,
) -> Result<Json<DriverProfile>, AppError> {
    Ok(Json(state.drivers.register(payload).await?))
}

async fn list_drivers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DriverProfile>>, AppError> {
    Ok(Json(state.drivers.list().await?))
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DriverProfile>, AppError> {
    Ok(Json(state.drivers.get(&id).await?))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<DriverProfile>, AppError> {
    Ok(Json(
        state
            .drivers
            .set_availability(&id, payload.availability)
            .await?,
    ))
}

async fn update_account_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<DriverProfile>, AppError> {
    Ok(Json(
        state
            .drivers
            .set_account_status(&id, payload.account_status)
            .await?,
    ))
}

async fn driver_orders(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SortQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.by_driver(&id, query.sort).await?))
}

async fn oldest_active_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, AppError> {
    state
        .orders
        .oldest_active_for(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("driver {id} has no active order")))
}

async fn record_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<RecordDeliveryRequest>,
) -> Result<Json<DeliveryHistoryEntry>, AppError> {
    Ok(Json(
        state
            .drivers
            .record_delivery(
                &id,
                payload.order_id,
                payload.picked_up_at,
                payload.delivered_at,
                payload.status,
            )
            .await?,
    ))
}

async fn delivery_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeliveryHistoryEntry>>, AppError> {
    Ok(Json(state.drivers.history(&id).await?))
}

async fn rate_delivery(
    State(state): State<Arc<AppState>>,
    Path((id, order_id)): Path<(String, i64)>,
    Json(payload): Json<RateDeliveryRequest>,
) -> Result<Json<DriverProfile>, AppError> {
    Ok(Json(
        state
            .drivers
            .rate_delivery(&id, order_id, payload.rating, payload.feedback)
            .await?,
    ))
}

async fn earnings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EarningsResponse>, AppError> {
    let total_earnings = state.drivers.total_earnings(&id).await?;
    Ok(Json(EarningsResponse {
        driver: id,
        total_earnings,
    }))
}
