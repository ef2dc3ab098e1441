//! WebSocket server handler using Axum.

use crate::auth::{bearer_token, Identity, TokenVerifier};
use crate::client::{ClientChannel, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::config::GatewayConfig;
use crate::error::{AuthError, GatewayError, Result, TransportError};
use crate::protocol::{ClientMessage, ConnectionResponse, ServerMessage};
use crate::registry::{SessionId, SessionRegistry};
use crate::session::ClientSession;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use common::{ConnectorConfig, FeedLink, UpstreamConnector};
use futures::{SinkExt, StreamExt};
use market_feed::TradeFeedHandler;
use metrics::counter;
use serde_json::{json, Value};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a finished connection may take to flush its last messages.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub verifier: TokenVerifier,
    pub config: GatewayConfig,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let verifier = TokenVerifier::new(&config.jwt_secret)?;
        Ok(Self {
            registry: Arc::new(SessionRegistry::new()),
            verifier,
            config,
        })
    }

    fn connector_config(&self, session_id: SessionId) -> ConnectorConfig {
        ConnectorConfig {
            connect_timeout: self.config.upstream_connect_timeout,
            ping_interval: self.config.ping_interval,
            label: session_id.to_string(),
            ..ConnectorConfig::default()
        }
    }
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.session_count(),
        "subscriptions": state.registry.subscription_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let credential = credential(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, credential))
}

/// Credential carried by the upgrade request.
///
/// `None` when no (or a blank) `authorization` header was sent. A header
/// that is not valid UTF-8 is a supplied but malformed credential.
fn credential(headers: &HeaderMap) -> Option<std::result::Result<String, AuthError>> {
    let value = headers.get(AUTHORIZATION)?;
    match value.to_str() {
        Ok(raw) => bearer_token(raw).map(|token| Ok(token.to_string())),
        Err(_) => Some(Err(AuthError::TokenMalformed(
            "authorization header is not valid UTF-8".to_string(),
        ))),
    }
}

/// Handle a WebSocket connection: authenticate once, then run the session.
async fn handle_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    credential: Option<std::result::Result<String, AuthError>>,
) {
    counter!("gateway_connections_total").increment(1);

    let Some(credential) = credential else {
        debug!("Connection without credential, closing");
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let verified = credential.and_then(|token| state.verifier.verify(&token));
    let identity = match verified {
        Ok(identity) => identity,
        Err(e) => {
            counter!("gateway_auth_failures_total").increment(1);
            warn!("Authentication failed: {}", e);
            let response: ServerMessage = ConnectionResponse::auth_failure(e.client_message()).into();
            if let Ok(json) = serde_json::to_string(&response) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    run_session(socket, state, identity).await;
}

async fn run_session(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let session_id = Uuid::new_v4();

    // Split the socket into sender and receiver
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded outbound queue drained by a writer task
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });
    let client = ClientChannel::new(tx);

    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
    let connector = UpstreamConnector::new(
        TradeFeedHandler::new(state.config.upstream_url.clone(), session_id.to_string()),
        state.connector_config(session_id),
        feed_tx,
    );

    let mut session = ClientSession::new(
        session_id,
        identity,
        connector,
        client.clone(),
        state.registry.clone(),
    );
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    session.activate(shutdown_tx);

    let period = state.config.ping_interval;
    let mut ping_interval = interval_at(Instant::now() + period, period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Session {} shutdown requested", session_id);
                break;
            }

            // Handle incoming WebSocket messages
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => match handle_message(&mut session, &client, msg).await {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => break,
                        Err(GatewayError::Transport(TransportError::Closed)) => break,
                        Err(e) => warn!("Error handling message from {}: {}", session_id, e),
                    },
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", session_id, e);
                        break;
                    }
                    None => break,
                }
            }

            // Upstream state changes and trades
            event = feed_rx.recv() => {
                let Some(event) = event else { break };
                match session.handle_feed_event(event) {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => break,
                    Err(e) => {
                        debug!("Session {} client gone: {}", session_id, e);
                        break;
                    }
                }
            }

            // Send ping periodically
            _ = ping_interval.tick() => {
                if client.send_raw(Message::Ping(Vec::new().into())) == Err(TransportError::Closed) {
                    break;
                }
            }
        }
    }

    // Cleanup
    session.terminate().await;
    drop(session);
    drop(client);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        warn!("Session {} writer did not drain in time", session_id);
        writer.abort();
    }

    info!("Client {} disconnected", session_id);
}

/// Handle a single WebSocket message.
async fn handle_message<L: FeedLink>(
    session: &mut ClientSession<L>,
    client: &ClientChannel,
    msg: Message,
) -> Result<ControlFlow<()>> {
    let parsed = match msg {
        Message::Text(text) => serde_json::from_str::<ClientMessage>(text.as_str()),
        Message::Binary(data) => serde_json::from_slice::<ClientMessage>(&data),
        // Pong replies are queued by the transport itself.
        Message::Ping(_) | Message::Pong(_) => return Ok(ControlFlow::Continue(())),
        Message::Close(_) => return Ok(ControlFlow::Break(())),
    };

    match parsed {
        Ok(client_msg) => session.handle_client_message(client_msg).await?,
        Err(e) => {
            debug!("Session {} sent an invalid message: {}", session.id(), e);
            client.send(&ConnectionResponse::error(format!("Invalid message: {}", e)).into())?;
        }
    }
    Ok(ControlFlow::Continue(()))
}
