use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

// drive it with POST /trigger {"type": "<event type>", "event": {...}} and POST /reconnect
const LISTEN_ADDR: &str = "127.0.0.1:8080";
const KEEPALIVE_SECS: u64 = 10;

#[derive(Clone)]
struct MockState {
    tx: broadcast::Sender<String>,
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    event: Value,
}

fn default_version() -> String {
    "1".to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let (tx, _) = broadcast::channel(64);
    let state = Arc::new(MockState { tx });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/eventsub/subscriptions", post(create_subscription))
        .route("/chat/messages", post(send_chat_message))
        .route("/oauth2/validate", get(validate_token))
        .route("/oauth2/token", post(refresh_token))
        .route("/trigger", post(trigger))
        .route("/reconnect", post(reconnect))
        .with_state(state);

    let addr: SocketAddr = LISTEN_ADDR.parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("eventsub mock listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn envelope(message_type: &str, subscription_type: Option<&str>, payload: Value) -> String {
    let mut metadata = json!({
        "message_id": Uuid::new_v4().to_string(),
        "message_type": message_type,
    });
    if let Some(kind) = subscription_type {
        metadata["subscription_type"] = json!(kind);
        metadata["subscription_version"] = json!("1");
    }
    json!({ "metadata": metadata, "payload": payload }).to_string()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
) -> impl IntoResponse {
    let rx = state.tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    let session_id = Uuid::new_v4().to_string();
    let welcome = envelope(
        "session_welcome",
        None,
        json!({
            "session": {
                "id": session_id,
                "status": "connected",
                "keepalive_timeout_seconds": KEEPALIVE_SECS,
                "reconnect_url": null,
            }
        }),
    );
    if socket.send(Message::Text(welcome)).await.is_err() {
        return;
    }
    tracing::info!(session = %session_id, "client connected");

    let mut ticker = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let keepalive = envelope("session_keepalive", None, json!({}));
                if socket.send(Message::Text(keepalive)).await.is_err() {
                    break;
                }
            }
            msg = rx.recv() => {
                match msg {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "client lagging, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::info!(session = %session_id, "client disconnected");
}

async fn create_subscription(Json(body): Json<Value>) -> impl IntoResponse {
    tracing::info!(kind = %body["type"], "subscription created");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "data": [{ "id": Uuid::new_v4().to_string(), "status": "enabled", "type": body["type"] }] })),
    )
}

async fn send_chat_message(Json(body): Json<Value>) -> impl IntoResponse {
    tracing::info!(message = %body["message"], "chat message");
    (
        StatusCode::OK,
        Json(json!({ "data": [{ "message_id": Uuid::new_v4().to_string(), "is_sent": true }] })),
    )
}

async fn validate_token() -> impl IntoResponse {
    Json(json!({ "client_id": "mock", "expires_in": 3600 }))
}

async fn refresh_token() -> impl IntoResponse {
    tracing::info!("token refreshed");
    Json(json!({
        "access_token": format!("mock-{}", Uuid::new_v4().simple()),
        "refresh_token": format!("mock-{}", Uuid::new_v4().simple()),
        "expires_in": 3600,
        "token_type": "bearer",
    }))
}

async fn trigger(
    State(state): State<Arc<MockState>>,
    Json(req): Json<TriggerRequest>,
) -> impl IntoResponse {
    let payload = json!({
        "subscription": {
            "id": Uuid::new_v4().to_string(),
            "type": req.kind,
            "version": req.version,
            "status": "enabled",
        },
        "event": req.event,
    });
    let text = envelope("notification", Some(req.kind.as_str()), payload);
    let delivered = state.tx.send(text).unwrap_or(0);
    tracing::info!(kind = %req.kind, delivered, "notification triggered");
    Json(json!({ "delivered": delivered }))
}

async fn reconnect(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let text = envelope(
        "session_reconnect",
        None,
        json!({
            "session": {
                "id": Uuid::new_v4().to_string(),
                "status": "reconnecting",
                "keepalive_timeout_seconds": null,
                "reconnect_url": format!("ws://{}/ws", LISTEN_ADDR),
            }
        }),
    );
    let delivered = state.tx.send(text).unwrap_or(0);
    Json(json!({ "delivered": delivered }))
}
