//! Trade-stream dialect of the upstream market-data feed.
//!
//! - [`protocol`]: `{method, params, id}` subscription commands
//! - [`trade`]: trade-execution parsing into [`TickerEvent`]
//! - [`handler`]: [`TradeFeedHandler`], the `WsHandler` used by the gateway

pub mod handler;
pub mod protocol;
pub mod trade;

pub use handler::TradeFeedHandler;
pub use protocol::build_command_message;
pub use trade::{parse_trade_event, Side, TickerEvent};
