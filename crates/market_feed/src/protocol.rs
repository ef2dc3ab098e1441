//! Upstream command wire format.

use common::{CommandKind, ProductId};
use serde::Serialize;

/// Subscription command sent to the feed.
///
/// `{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":1}`
#[derive(Debug, Serialize)]
struct CommandMessage<'a> {
    method: &'static str,
    params: &'a [ProductId],
    id: u64,
}

/// Build a subscribe/unsubscribe command for the feed.
///
/// # Arguments
/// * `kind` - Subscribe or unsubscribe
/// * `products` - Stream names to (un)subscribe
/// * `request_id` - Per-connection request id
pub fn build_command_message(
    kind: CommandKind,
    products: &[ProductId],
    request_id: u64,
) -> serde_json::Result<String> {
    serde_json::to_string(&CommandMessage {
        method: kind.method(),
        params: products,
        id: request_id,
    })
}
