//! Upstream connection plumbing for the market-data gateway.
//!
//! - [`UpstreamConnector`]: one outbound WebSocket per owner, no reconnect
//! - [`WsHandler`]: codec trait a feed dialect implements
//! - [`FeedLink`]: owner-side interface the gateway session is written against

pub mod connector;
pub mod error;
pub mod messages;
pub mod ws_handler;

pub use connector::{ConnectorConfig, FeedLink, UpstreamConnector};
pub use error::{Result, UpstreamError};
pub use messages::{Ack, CommandKind, ConnectionState, ControlCommand, FeedEvent, ProductId};
pub use ws_handler::WsHandler;
