//! Commands, states and events exchanged with an upstream connection task.

use crate::error::Result;
use tokio::sync::oneshot;

/// Opaque upstream product / stream identifier (e.g. `btcusdt@trade`).
pub type ProductId = String;

/// Kind of subscription command sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
}

impl CommandKind {
    /// Upstream wire name of the command.
    pub fn method(&self) -> &'static str {
        match self {
            CommandKind::Subscribe => "SUBSCRIBE",
            CommandKind::Unsubscribe => "UNSUBSCRIBE",
        }
    }
}

/// Transport-level acknowledgement of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Request id the command was sent with.
    pub request_id: u64,
}

/// Lifecycle of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    /// `Closed` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Commands accepted by the connection task.
#[derive(Debug)]
pub enum ControlCommand {
    /// Send a subscription command and report the transport outcome.
    Send {
        kind: CommandKind,
        products: Vec<ProductId>,
        request_id: u64,
        ack: oneshot::Sender<Result<Ack>>,
    },
    /// Graceful shutdown.
    Shutdown,
}

/// Everything a connection task reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent<E> {
    /// The connection moved to a new state.
    StateChanged(ConnectionState),
    /// A decoded upstream event.
    Event(E),
}
