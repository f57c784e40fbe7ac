use crate::service::{PublishRequest, PublishResponse, QueueService};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRef, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use ticket_queue::metrics::{health_check, metrics_endpoint};
use ticket_queue::{ClientAction, Metrics, Notification, TicketQueueError};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueueService>,
    pub metrics: Metrics,
}

impl FromRef<AppState> for Arc<QueueService> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.service)
    }
}

impl FromRef<AppState> for Metrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/publish", post(publish))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn publish(
    State(service): State<Arc<QueueService>>,
    Json(request): Json<PublishRequest>,
) -> std::result::Result<Json<PublishResponse>, (StatusCode, String)> {
    match service.publish(request).await {
        Ok(response) => Ok(Json(response)),
        Err(TicketQueueError::InvalidArgument(message)) => Err((StatusCode::BAD_REQUEST, message)),
        Err(e @ TicketQueueError::InvalidTopic(_)) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            error!("Error publishing join event: {}", e);
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(service): State<Arc<QueueService>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(socket: WebSocket, service: Arc<QueueService>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

    let writer = tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let text = match serde_json::to_string(&notification) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode notification: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientAction>(&text) {
                    Ok(action) => service.handle_action(action, &tx).await,
                    Err(e) => {
                        warn!("Invalid client action: {}", e);
                        Some(Notification::Error {
                            message: format!("invalid action: {}", e),
                        })
                    }
                };
                if let Some(reply) = reply {
                    let _ = tx.send(reply);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!("Client disconnected");
    service.registry.unregister_channel(&tx);
    writer.abort();
}
