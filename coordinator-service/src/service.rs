use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRef, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::sync::Arc;
use ticket_queue::audit::{MemoryRecorder, RocksDbRecorder, StateRecorder};
use ticket_queue::coordinator::{Coordinator, SelectionBoard, TcpWorkSource};
use ticket_queue::metrics::{health_check, metrics_endpoint};
use ticket_queue::{ClientAction, GroupKey, Metrics, Notification, Result, ServiceConfig, Stores};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

pub struct CoordinatorService {
    pub config: ServiceConfig,
    pub metrics: Metrics,
    pub recorder: Arc<dyn StateRecorder>,
    pub coordinator: Arc<Coordinator>,
}

impl CoordinatorService {
    pub fn new(config: ServiceConfig, ephemeral: bool) -> Result<Self> {
        let metrics = Metrics::new()?;
        let recorder: Arc<dyn StateRecorder> = if ephemeral {
            Arc::new(MemoryRecorder::new())
        } else {
            let path = Path::new(&config.state_dir).join(Stores::TRANSITIONS);
            info!("Audit log at {:?}", path);
            Arc::new(RocksDbRecorder::open(path)?)
        };

        let source = Arc::new(TcpWorkSource::new(config.workers.source_address.clone()));
        let coordinator = Arc::new(Coordinator::new(
            source,
            Arc::new(SelectionBoard::new(config.workers.selection_timeout())),
            Arc::clone(&recorder),
            metrics.clone(),
            &config.workers,
        ));

        Ok(Self {
            config,
            metrics,
            recorder,
            coordinator,
        })
    }

    /// Hand a seat pick to the worker serving that user.
    pub fn handle_action(&self, action: ClientAction) -> Notification {
        match action {
            ClientAction::Select {
                resource_id,
                category,
                user_identity,
                seat_id,
            } => {
                let group = GroupKey::new(resource_id, &category);
                let delivered = self.coordinator.board().submit(&group, &user_identity, seat_id);
                Notification::SeatSubmitted { group, delivered }
            }
            _ => Notification::Error {
                message: "only select actions are accepted here".to_string(),
            },
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CoordinatorService>,
    pub metrics: Metrics,
}

impl FromRef<AppState> for Arc<CoordinatorService> {
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
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(service): State<Arc<CoordinatorService>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(socket: WebSocket, service: Arc<CoordinatorService>) {
    let (mut sink, mut stream) = socket.split();

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ClientAction>(&text) {
            Ok(action) => service.handle_action(action),
            Err(e) => {
                warn!("Invalid client action: {}", e);
                Notification::Error {
                    message: format!("invalid action: {}", e),
                }
            }
        };
        let Ok(reply) = serde_json::to_string(&reply) else {
            continue;
        };
        if sink.send(Message::Text(reply)).await.is_err() {
            break;
        }
    }
}
