use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/customers/:customer/notifications", get(check_notifications))
        .route(
            "/customers/:customer/notifications/ack",
            post(acknowledge_notifications),
        )
        .route(
            "/customers/:customer/notifications/ws",
            get(notification_socket),
        )
}

#[derive(Serialize)]
pub struct NotificationStatus {
    pub customer: String,
    pub has_unnotified: bool,
}

#[derive(Serialize)]
pub struct AckResponse {
    pub customer: String,
    pub marked: usize,
}

async fn check_notifications(
    State(state): State<Arc<AppState>>,
    Path(customer): Path<String>,
) -> Result<Json<NotificationStatus>, AppError> {
    let has_unnotified = state.notifications.has_unnotified(&customer).await?;
    Ok(Json(NotificationStatus {
        customer,
        has_unnotified,
    }))
}

async fn acknowledge_notifications(
    State(state): State<Arc<AppState>>,
    Path(customer): Path<String>,
) -> Result<Json<AckResponse>, AppError> {
    let marked = state.notifications.mark_notified(&customer).await?;
    Ok(Json(AckResponse { customer, marked }))
}

async fn notification_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(customer): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, customer))
}

/// One poll session per connected socket; closing the socket ends the poll.
/// A batch is acknowledged only once it has been written to the socket.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, customer: String) {
    let (mut sender, mut receiver) = socket.split();
    let (session, mut delivered_rx) = state
        .notifications
        .start_polling(&customer, state.notify_poll_interval);

    info!(customer = %customer, session = %session, "notification socket connected");

    let send_task = tokio::spawn(async move {
        while let Some(batch) = delivered_rx.recv().await {
            let json = match serde_json::to_string(&batch.orders) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize delivered orders for ws");
                    break;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
            batch.ack();
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.notifications.stop_polling(session);
    info!(customer = %customer, session = %session, "notification socket disconnected");
}
