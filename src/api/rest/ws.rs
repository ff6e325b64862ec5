use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::models::order::OrderUpdate;
use crate::state::AppState;

/// Narrows the live feed to one customer's and/or one driver's orders.
#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    pub customer: Option<String>,
    pub driver: Option<String>,
}

impl WatchQuery {
    fn matches(&self, update: &OrderUpdate) -> bool {
        let customer_ok = self
            .customer
            .as_deref()
            .is_none_or(|customer| customer == update.customer);
        let driver_ok = self
            .driver
            .as_deref()
            .is_none_or(|driver| update.driver.as_deref() == Some(driver));
        customer_ok && driver_ok
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(watch): Query<WatchQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state, watch))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, watch: WatchQuery) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = BroadcastStream::new(state.order_updates_tx.subscribe());

    info!(customer = ?watch.customer, driver = ?watch.driver, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(result) = updates.next().await {
            let update = match result {
                Ok(update) if watch.matches(&update) => update,
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "websocket subscriber lagged");
                    continue;
                }
            };

            let json = match serde_json::to_string(&update) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize order update for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("websocket client disconnected");
}
