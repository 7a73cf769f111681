//! WebSocket transport for web terminals.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, header},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use shell_broker_core::{AuthGate, Caller, EventSink, RequestContext};
use shell_broker_session::Broker;
use tracing::{debug, error, info};

use crate::{gateway::Gateway, protocol::ServerMessage};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub broker: Arc<Broker>,
    pub auth: Arc<dyn AuthGate>,
}

impl WsState {
    #[must_use]
    pub fn new(broker: Arc<Broker>, auth: Arc<dyn AuthGate>) -> Self {
        Self { broker, auth }
    }
}

/// Collect the credentials a request carries.
#[must_use]
pub fn request_context(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
) -> RequestContext {
    let mut ctx = RequestContext {
        bearer_token: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string()),
        query_token: query.get("token").cloned(),
        remote_addr,
        ..RequestContext::default()
    };
    for cookie in headers.get_all(header::COOKIE) {
        if let Ok(value) = cookie.to_str() {
            ctx.add_cookie_header(value);
        }
    }
    ctx
}

/// WebSocket upgrade handler.
///
/// The auth gate is consulted once, at upgrade time. Unauthenticated
/// sockets are accepted but every `connect` on them is refused.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let ctx = request_context(&headers, &query, Some(remote_addr));
    let caller = state.auth.authenticate(&ctx);
    ws.on_upgrade(move |socket| handle_socket(socket, state.broker, caller))
}

async fn handle_socket(socket: WebSocket, broker: Arc<Broker>, caller: Option<Caller>) {
    let (mut sender, mut receiver) = socket.split();
    let (events, mut rx) = EventSink::channel();
    let mut gateway = Gateway::new(broker, caller, events);
    let session_id = gateway.session_id();
    info!(%session_id, "WebSocket connected");

    // Forward broker events to the socket
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match ServerMessage::from(event).to_json() {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => gateway.handle_text(text.as_str()).await,
            Ok(Message::Binary(data)) => gateway.handle_binary(&data).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%session_id, "WebSocket error: {e}");
                break;
            }
        }
    }

    gateway.close().await;
    send_task.abort();
    info!(%session_id, "WebSocket disconnected");
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(WsState::new(broker, auth)));
/// ```
#[must_use]
pub fn create_ws_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state)
}
