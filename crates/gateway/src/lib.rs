//! Authenticated WebSocket gateway for real-time trade tickers.
//!
//! This service:
//! - Accepts WebSocket connections carrying a bearer token
//! - Opens one dedicated upstream feed connection per authenticated client
//! - Relays subscribe/unsubscribe commands to that upstream connection
//! - Forwards only the trades each client is subscribed to
//!
//! ## Architecture
//!
//! ```text
//! client ──ws──▶ ws_server ──▶ ClientSession ──▶ UpstreamConnector ──wss──▶ feed
//!    ▲                              │  subscription set
//!    └──── ClientChannel ◀──────────┘  (tickers filtered per session)
//! ```
//!
//! Live sessions are tracked in a [`SessionRegistry`] for health reporting
//! and shutdown.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod ws_server;

pub use auth::{bearer_token, Identity, TokenVerifier};
pub use client::ClientChannel;
pub use config::GatewayConfig;
pub use error::{AuthError, GatewayError, Result, TransportError};
pub use protocol::{ClientMessage, ConnectionResponse, ResponseKind, ServerMessage};
pub use registry::{SessionHandle, SessionId, SessionRegistry};
pub use session::{ClientSession, SessionState};
pub use ws_server::{create_router, AppState};
