//! Trade feed handler implementation.
//!
//! Plugs the trade-stream dialect into [`common::UpstreamConnector`]:
//! commands become `{method, params, id}` frames and only trade
//! executions are decoded into [`TickerEvent`]s.

use crate::protocol::build_command_message;
use crate::trade::{parse_trade_event, TickerEvent};
use common::error::Result;
use common::{CommandKind, ProductId, WsHandler};
use metrics::counter;
use tracing::debug;

/// Handler for one client's upstream trade feed connection.
pub struct TradeFeedHandler {
    /// Upstream WebSocket URL.
    url: String,
    /// Label for logging (owning session id).
    label: String,
}

impl TradeFeedHandler {
    /// Create a handler for the given upstream URL.
    pub fn new(url: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }
}

impl WsHandler for TradeFeedHandler {
    type Event = TickerEvent;

    fn url(&self) -> &str {
        &self.url
    }

    fn encode_command(
        &self,
        kind: CommandKind,
        products: &[ProductId],
        request_id: u64,
    ) -> Result<String> {
        Ok(build_command_message(kind, products, request_id)?)
    }

    fn decode(&self, text: &str) -> Option<TickerEvent> {
        match parse_trade_event(text) {
            Ok(event) => event,
            Err(e) => {
                debug!("[{}] Failed to parse upstream payload: {}", self.label, e);
                counter!("upstream_parse_errors_total").increment(1);
                None
            }
        }
    }
}
