//! Per-connection client session.
//!
//! A session binds one authenticated client to one upstream feed link. It
//! owns the subscription set, translates client commands into upstream
//! commands, and filters upstream trades down to what the client asked for.
//!
//! All methods take `&mut self` or `&self` on a value owned by the
//! connection task, so commands are handled one at a time and the
//! subscription set needs no lock.

use crate::auth::Identity;
use crate::client::ClientChannel;
use crate::error::{GatewayError, Result, TransportError};
use crate::protocol::{ClientMessage, ConnectionResponse, ServerMessage};
use crate::registry::{SessionHandle, SessionId, SessionRegistry};
use common::{CommandKind, ConnectionState, FeedEvent, FeedLink, ProductId, UpstreamError};
use market_feed::TickerEvent;
use metrics::counter;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Message sent when the upstream feed cannot be reached or drops.
pub const FEED_FAILED_MESSAGE: &str = "Market data feed connection failed";
/// Message sent when the upstream feed closes the connection.
pub const FEED_CLOSED_MESSAGE: &str = "Market data feed connection closed";

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Active,
    Terminated,
}

/// Client-facing wording for one command kind.
struct Wording {
    success: &'static str,
    failed: &'static str,
    not_ready: &'static str,
}

fn wording(kind: CommandKind) -> Wording {
    match kind {
        CommandKind::Subscribe => Wording {
            success: "Subscription successful",
            failed: "Subscription goes wrong",
            not_ready: "WebSocket is not open yet. Please retry the subscription.",
        },
        CommandKind::Unsubscribe => Wording {
            success: "Unsubscription successful",
            failed: "Unsubscription goes wrong",
            not_ready: "WebSocket is not open yet. Please retry the unsubscription.",
        },
    }
}

/// Drop duplicates, keeping first-seen order.
fn unique(products: Vec<ProductId>) -> Vec<ProductId> {
    let mut seen = HashSet::new();
    products
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// One authenticated client and its upstream feed link.
pub struct ClientSession<L: FeedLink> {
    id: SessionId,
    identity: Identity,
    state: SessionState,
    subscriptions: HashSet<ProductId>,
    upstream: L,
    client: ClientChannel,
    registry: Arc<SessionRegistry>,
    handle: Option<Arc<SessionHandle>>,
}

impl<L: FeedLink> ClientSession<L> {
    /// Create a session in the `Authenticating` state.
    pub fn new(
        id: SessionId,
        identity: Identity,
        upstream: L,
        client: ClientChannel,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            id,
            identity,
            state: SessionState::Authenticating,
            subscriptions: HashSet::new(),
            upstream,
            client,
            registry,
            handle: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscriptions(&self) -> &HashSet<ProductId> {
        &self.subscriptions
    }

    pub fn upstream(&self) -> &L {
        &self.upstream
    }

    /// Enter `Active`: register with the registry and start the upstream
    /// connection. `shutdown_tx` lets the registry end the session.
    pub fn activate(&mut self, shutdown_tx: mpsc::Sender<()>) {
        if self.state != SessionState::Authenticating {
            return;
        }

        let handle = Arc::new(SessionHandle::new(
            self.id,
            self.identity.clone(),
            shutdown_tx,
        ));
        self.registry.register(handle.clone());
        self.handle = Some(handle);
        self.state = SessionState::Active;
        self.upstream.open();

        info!(
            "Session {} active for user {} ({})",
            self.id, self.identity.user_id, self.identity.email
        );
    }

    /// Dispatch a parsed client message.
    pub async fn handle_client_message(&mut self, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::Subscribe(req) => self.handle_subscribe(req.channels).await,
            ClientMessage::Unsubscribe(req) => self.handle_unsubscribe(req.channels).await,
            ClientMessage::Ping => self.client.send(&ServerMessage::Pong),
        }
    }

    /// Subscribe to `products`.
    ///
    /// The set is only extended once the command has been attempted
    /// upstream; a `NotReady` link leaves it unchanged and nothing is queued.
    pub async fn handle_subscribe(&mut self, products: Vec<ProductId>) -> Result<()> {
        if !self.accepts_commands("subscribe") {
            return Ok(());
        }
        let products = unique(products);
        if products.is_empty() {
            return self.respond(ConnectionResponse::error("No channels to subscribe"));
        }

        debug!("Session {} subscribing to {:?}", self.id, products);
        let outcome = self
            .upstream
            .send_command(CommandKind::Subscribe, &products)
            .await;

        if !matches!(outcome, Err(UpstreamError::NotReady)) {
            self.subscriptions.extend(products.iter().cloned());
            self.publish_subscription_count();
        }

        self.respond_to_command(CommandKind::Subscribe, outcome)
    }

    /// Unsubscribe from `products`.
    ///
    /// Products leave the set before the upstream command is sent, so no
    /// event for them is forwarded afterwards whatever the command outcome.
    pub async fn handle_unsubscribe(&mut self, products: Vec<ProductId>) -> Result<()> {
        if !self.accepts_commands("unsubscribe") {
            return Ok(());
        }
        let products = unique(products);
        if products.is_empty() {
            return self.respond(ConnectionResponse::error("No channels to unsubscribe"));
        }

        debug!("Session {} unsubscribing from {:?}", self.id, products);
        for product in &products {
            self.subscriptions.remove(product);
        }
        self.publish_subscription_count();

        let outcome = self
            .upstream
            .send_command(CommandKind::Unsubscribe, &products)
            .await;

        self.respond_to_command(CommandKind::Unsubscribe, outcome)
    }

    /// Forward a trade if the client is subscribed to its product.
    /// Returns whether it was forwarded.
    pub fn handle_upstream_event(&self, event: TickerEvent) -> Result<bool> {
        if self.state != SessionState::Active || !self.subscriptions.contains(&event.product_id) {
            return Ok(false);
        }

        match self.client.send(&ServerMessage::Ticker(event)) {
            Ok(()) => {
                counter!("gateway_tickers_forwarded_total").increment(1);
                Ok(true)
            }
            Err(GatewayError::Transport(TransportError::Full)) => {
                debug!("Session {} buffer full, dropping ticker", self.id);
                counter!("gateway_tickers_dropped_total").increment(1);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// React to a report from the upstream link.
    ///
    /// Returns `Break` when the session must end: the link has reached a
    /// terminal state and there is no reconnect.
    pub fn handle_feed_event(&mut self, event: FeedEvent<TickerEvent>) -> Result<ControlFlow<()>> {
        match event {
            FeedEvent::Event(ticker) => {
                self.handle_upstream_event(ticker)?;
                Ok(ControlFlow::Continue(()))
            }
            FeedEvent::StateChanged(ConnectionState::Open) => {
                info!("Session {} upstream feed open", self.id);
                Ok(ControlFlow::Continue(()))
            }
            FeedEvent::StateChanged(ConnectionState::Connecting) => Ok(ControlFlow::Continue(())),
            FeedEvent::StateChanged(ConnectionState::Failed) => {
                warn!("Session {} upstream feed failed", self.id);
                let _ = self.respond(ConnectionResponse::error(FEED_FAILED_MESSAGE));
                Ok(ControlFlow::Break(()))
            }
            FeedEvent::StateChanged(ConnectionState::Closed) => {
                info!("Session {} upstream feed closed", self.id);
                let _ = self.respond(ConnectionResponse::error(FEED_CLOSED_MESSAGE));
                Ok(ControlFlow::Break(()))
            }
        }
    }

    /// Leave the registry, then close the upstream link. Idempotent.
    pub async fn terminate(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;

        self.registry.unregister(&self.id);
        self.handle = None;
        self.upstream.close().await;

        info!(
            "Session {} terminated ({} subscriptions dropped)",
            self.id,
            self.subscriptions.len()
        );
    }

    fn accepts_commands(&self, what: &str) -> bool {
        if self.state == SessionState::Active {
            true
        } else {
            debug!(
                "Session {} ignoring {} in state {:?}",
                self.id, what, self.state
            );
            false
        }
    }

    fn respond(&self, response: ConnectionResponse) -> Result<()> {
        self.client.send(&response.into())
    }

    fn respond_to_command(
        &self,
        kind: CommandKind,
        outcome: common::Result<common::Ack>,
    ) -> Result<()> {
        let wording = wording(kind);
        let response = match outcome {
            Ok(ack) => {
                debug!(
                    "Session {} {} acknowledged (request {})",
                    self.id,
                    kind.method(),
                    ack.request_id
                );
                ConnectionResponse::success(wording.success)
            }
            Err(UpstreamError::NotReady) => ConnectionResponse::error(wording.not_ready),
            Err(e) => {
                warn!("Session {} {} failed: {}", self.id, kind.method(), e);
                ConnectionResponse::error(wording.failed)
            }
        };
        self.respond(response)
    }

    fn publish_subscription_count(&self) {
        if let Some(handle) = &self.handle {
            handle.set_subscription_count(self.subscriptions.len());
        }
    }
}
