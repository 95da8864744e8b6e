//! Coordinator channel abstraction.
//!
//! The session manager only talks to [`HubChannel`]; [`signalr::SignalRChannel`]
//! is the production implementation and tests substitute their own.

pub mod protocol;
pub mod signalr;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;

pub use signalr::SignalRChannel;

/// Callback for a named server-to-client event. Receives the raw arguments.
pub type InvocationHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Supplies the bearer token; queried on every (re)connect attempt.
pub type AccessTokenProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Transport-level lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection dropped and automatic reconnection started.
    Reconnecting,
    /// Transport is back. Group membership is not restored by the channel.
    Reconnected,
    /// Reconnection gave up or the server closed for good.
    Closed,
}

/// A persistent, authenticated, bidirectional channel to the coordinator.
#[async_trait]
pub trait HubChannel: Send + Sync + 'static {
    /// Registers `handler` for server event `event`. Registrations survive
    /// reconnects.
    fn on(&self, event: &str, handler: InvocationHandler);

    /// Subscribes to lifecycle events emitted after this call.
    fn lifecycle(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Opens the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), ChannelError>;

    /// Calls a hub method and waits for its completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not connected, the connection drops
    /// before completion, or the hub reports an error.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError>;

    /// Closes the channel. Emits no lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails.
    async fn stop(&self) -> Result<(), ChannelError>;
}
