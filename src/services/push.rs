//! Push transport seam.
//!
//! A transport delivers named events in both directions and reports its own
//! connect/disconnect signals on the same stream as inbound events.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

/// Event the server emits for every stored message.
pub const NEW_MESSAGE_EVENT: &str = "new_message";
/// Event the client emits to send a message over push.
pub const SEND_MESSAGE_EVENT: &str = "send_message";

/// Inbound signal from a push transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Disconnected { reason: String },
    Event {
        name: String,
        payload: serde_json::Value,
    },
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Emit a named event. Fails when the transport is not connected.
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()>;

    /// Close the connection and stop reconnecting.
    async fn close(&self);
}

/// A live transport plus the receiving end of its event stream.
pub struct PushConnection {
    pub transport: Arc<dyn PushTransport>,
    pub events: mpsc::UnboundedReceiver<PushEvent>,
}

impl PushConnection {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        events: mpsc::UnboundedReceiver<PushEvent>,
    ) -> Self {
        Self { transport, events }
    }
}
