use crate::hub::Broadcaster;
use crate::metrics::Metrics;
use crate::state::StatusUpdate;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub hub: Arc<Broadcaster>,
}

pub fn build_router(metrics: Arc<Metrics>, hub: Arc<Broadcaster>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(HttpAppState { metrics, hub })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn ws_handler(State(state): State<HttpAppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

/// One task per connected client: refresh the log summary, register with
/// the broadcaster, forward `status_update` frames until the socket or
/// the channel closes. Dropping the subscription deregisters the client.
async fn handle_socket(mut socket: WebSocket, hub: Arc<Broadcaster>) {
    if let Err(err) = hub.refresh_logs().await {
        warn!(error = %err, "log aggregation failed, broadcasting an empty summary");
    }

    let mut subscription = hub.subscribe();
    debug!(subscriber = subscription.id(), "client connected");

    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                let Some(snapshot) = snapshot else { break };
                let frame = match serde_json::to_string(&StatusUpdate::new(&snapshot)) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "failed to encode snapshot");
                        continue;
                    }
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // Connect/disconnect carry no payload; drain anything else.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(subscriber = subscription.id(), "client disconnected");
}
