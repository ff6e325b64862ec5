use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::pricing::{base_minutes, driver_payout, travel_minutes};
use crate::error::AppError;
use crate::geo::estimate_distance_miles;
use crate::models::identity::Identity;
use crate::models::order::{
    GeoPoint, NewOrder, NewOrderItem, Order, OrderItem, OrderStatus, OrderStatusEvent,
};
use crate::state::AppState;
use crate::store::orders::SortOrder;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/pending", get(pending_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/items", post(add_item).get(list_items))
        .route("/orders/:id/events", get(list_events))
        .route("/orders/:id/claim", post(claim_order))
        .route("/orders/:id/status", post(transition_order))
        .route("/orders/:id/pickup", post(pick_up_order))
        .route("/orders/:id/deliver", post(deliver_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/customers/:customer/orders", get(customer_orders))
        .route("/estimates", get(estimate))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    #[serde(flatten)]
    pub order: NewOrder,
    #[serde(default)]
    pub items: Vec<NewOrderItem>,
}

#[derive(Serialize)]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Deserialize)]
pub struct SortQuery {
    #[serde(default)]
    pub sort: SortOrder,
}

#[derive(Deserialize)]
pub struct DriverRequest {
    pub driver: String,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub status: OrderStatus,
    pub actor: Identity,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub actor: Identity,
}

#[derive(Deserialize)]
pub struct EstimateQuery {
    pub restaurant_lat: f64,
    pub restaurant_lng: f64,
    pub delivery_lat: f64,
    pub delivery_lng: f64,
    pub total: f64,
}

#[derive(Serialize)]
pub struct EstimateResponse {
    pub base_minutes: i64,
    pub travel_minutes: i64,
    pub estimated_minutes: i64,
    pub distance_miles: f64,
    pub driver_payout: f64,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<OrderDetail>, AppError> {
    let id = state.orders.create(payload.order).await?;

    let mut items = Vec::with_capacity(payload.items.len());
    for item in payload.items {
        items.push(state.orders.add_item(id, item).await?);
    }

    let order = state.orders.get(id).await?;
    Ok(Json(OrderDetail { order, items }))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<OrderDetail>, AppError> {
    let order = state.orders.get(id).await?;
    let items = state.orders.items(id).await?;
    Ok(Json(OrderDetail { order, items }))
}

async fn pending_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SortQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.pending(query.sort).await?))
}

async fn add_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<NewOrderItem>,
) -> Result<Json<OrderItem>, AppError> {
    Ok(Json(state.orders.add_item(id, payload).await?))
}

async fn list_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<OrderItem>>, AppError> {
    Ok(Json(state.orders.items(id).await?))
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<OrderStatusEvent>>, AppError> {
    Ok(Json(state.orders.events(id).await?))
}

async fn claim_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<DriverRequest>,
) -> Result<Json<Order>, AppError> {
    let outcome = state.dispatch.claim(id, &payload.driver).await?;
    Ok(Json(outcome.into_result(id)?))
}

async fn transition_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .orders
            .transition(id, payload.status, &payload.actor)
            .await?,
    ))
}

async fn pick_up_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<DriverRequest>,
) -> Result<Json<Order>, AppError> {
    let actor = Identity::driver(payload.driver);
    Ok(Json(
        state
            .orders
            .transition(id, OrderStatus::InProgress, &actor)
            .await?,
    ))
}

async fn deliver_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<DriverRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatch.complete(id, &payload.driver).await?))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.dispatch.cancel(id, &payload.actor).await?))
}

async fn customer_orders(
    State(state): State<Arc<AppState>>,
    Path(customer): Path<String>,
    Query(query): Query<SortQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.by_customer(&customer, query.sort).await?))
}

async fn estimate(Query(query): Query<EstimateQuery>) -> Result<Json<EstimateResponse>, AppError> {
    if !query.total.is_finite() || query.total < 0.0 {
        return Err(AppError::Validation("total must be >= 0".to_string()));
    }

    let restaurant = GeoPoint {
        lat: query.restaurant_lat,
        lng: query.restaurant_lng,
    };
    let delivery = GeoPoint {
        lat: query.delivery_lat,
        lng: query.delivery_lng,
    };
    if !restaurant.is_valid() || !delivery.is_valid() {
        return Err(AppError::Validation(
            "coordinates must be finite latitude/longitude pairs".to_string(),
        ));
    }

    let base = base_minutes(query.total);
    let travel = travel_minutes(Some(&restaurant), Some(&delivery));

    Ok(Json(EstimateResponse {
        base_minutes: base,
        travel_minutes: travel,
        estimated_minutes: base + travel,
        distance_miles: estimate_distance_miles(&restaurant, &delivery),
        driver_payout: driver_payout(query.total),
    }))
}
