//! Session manager: keeps the worker connected to the coordinator and joined
//! to its group.
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Joining ──▶ Joined ──▶ Reconnecting
//!      ▲   ▲            │             │          ▲            │
//!      │   └── 5s ◀─────┴─────────────┘          └─ rejoin ◀──┘ Reconnected
//!      └──────────── 5s ◀─────────── Closed / rejoin failed
//! ```
//!
//! The channel reconnects its transport on its own, but group membership is
//! per connection: every `Reconnected` is followed by a fresh `JoinGroup`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ferryx_common::DeployCommand;
use ferryx_common::contract::hub;

use crate::config::HubOptions;
use crate::error::ChannelError;
use crate::hub::{ChannelEvent, HubChannel, InvocationHandler};

/// Fixed delay between connect attempts.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Receives every well-formed deploy command pushed by the coordinator.
///
/// Called on the channel's delivery path; implementations must not block.
pub trait DeployEventSink: Send + Sync {
    fn deliver(&self, command: DeployCommand);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joining,
    Joined,
    Reconnecting,
    Stopped,
}

enum SessionEnd {
    Shutdown,
    Closed,
    RejoinFailed,
}

pub struct SessionManager<C> {
    channel: Arc<C>,
    group: String,
    retry_interval: Duration,
    state: watch::Sender<SessionState>,
}

impl<C: HubChannel> SessionManager<C> {
    /// Registers the deploy event handler on `channel`. Registration happens
    /// once and survives every reconnect.
    pub fn new(channel: Arc<C>, options: &HubOptions, sink: Arc<dyn DeployEventSink>) -> Self {
        channel.on(hub::DEPLOY_EVENT, deploy_event_handler(sink));
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            channel,
            group: options.group.clone(),
            retry_interval: CONNECT_RETRY_INTERVAL,
            state,
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drives the session until `shutdown` is cancelled, then stops the
    /// channel. Connectivity errors are logged and retried, never returned.
    pub async fn run(&self, shutdown: CancellationToken) {
        while let Some(mut lifecycle) = self.connect(&shutdown).await {
            match self.supervise(&mut lifecycle, &shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Closed => {
                    tracing::warn!(group = %self.group, "hub connection closed, starting over");
                }
                SessionEnd::RejoinFailed => {
                    tracing::warn!(group = %self.group, "rejoin failed, starting over");
                }
            }

            self.stop_channel().await;
            self.set(SessionState::Disconnected);
            if !self.backoff(&shutdown).await {
                break;
            }
        }

        self.stop_channel().await;
        self.set(SessionState::Stopped);
        tracing::info!("session stopped");
    }

    // ── Connect loop ─────────────────────────────────────────────────────────

    /// Retries until the channel is started and joined. Returns the lifecycle
    /// subscription taken before the successful start, or `None` on shutdown.
    async fn connect(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<broadcast::Receiver<ChannelEvent>> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            let lifecycle = self.channel.lifecycle();
            match self.start_and_join(shutdown).await {
                Ok(()) => return Some(lifecycle),
                Err(ChannelError::Cancelled) if shutdown.is_cancelled() => return None,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = self.retry_interval.as_secs(),
                        "hub connection failed"
                    );
                    self.set(SessionState::Disconnected);
                    if !self.backoff(shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn start_and_join(&self, shutdown: &CancellationToken) -> Result<(), ChannelError> {
        self.set(SessionState::Connecting);
        self.channel.start(shutdown).await?;

        self.set(SessionState::Joining);
        if let Err(e) = self.join(shutdown).await {
            self.stop_channel().await;
            return Err(e);
        }

        self.set(SessionState::Joined);
        tracing::info!(group = %self.group, "joined group");
        Ok(())
    }

    async fn join(&self, shutdown: &CancellationToken) -> Result<(), ChannelError> {
        let args = vec![Value::from(self.group.clone())];
        tokio::select! {
            result = self.channel.invoke(hub::JOIN_GROUP, args) => result.map(|_| ()),
            () = shutdown.cancelled() => Err(ChannelError::Cancelled),
        }
    }

    // ── Live session ─────────────────────────────────────────────────────────

    async fn supervise(
        &self,
        lifecycle: &mut broadcast::Receiver<ChannelEvent>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => return SessionEnd::Shutdown,
                event = lifecycle.recv() => event,
            };

            match event {
                Ok(ChannelEvent::Reconnecting) => {
                    self.set(SessionState::Reconnecting);
                    tracing::warn!("hub connection lost, channel is reconnecting");
                }
                Ok(ChannelEvent::Reconnected) => {
                    self.set(SessionState::Joining);
                    if let Err(e) = self.join(shutdown).await {
                        if shutdown.is_cancelled() {
                            return SessionEnd::Shutdown;
                        }
                        tracing::warn!(error = %e, group = %self.group, "rejoin after reconnect failed");
                        return SessionEnd::RejoinFailed;
                    }
                    self.set(SessionState::Joined);
                    tracing::info!(group = %self.group, "rejoined group after reconnect");
                }
                Ok(ChannelEvent::Closed) | Err(RecvError::Closed) => return SessionEnd::Closed,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "missed hub lifecycle events");
                }
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Sleeps for the retry interval. Returns `false` if shut down meanwhile.
    async fn backoff(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = tokio::time::sleep(self.retry_interval) => true,
        }
    }

    async fn stop_channel(&self) {
        if let Err(e) = self.channel.stop().await {
            tracing::warn!(error = %e, "failed to stop hub channel");
        }
    }

    fn set(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

/// Parses the first argument of a deploy event and forwards it to `sink`.
/// Malformed payloads are logged and dropped.
fn deploy_event_handler(sink: Arc<dyn DeployEventSink>) -> InvocationHandler {
    Arc::new(move |args: Vec<Value>| {
        let Some(payload) = args.into_iter().next() else {
            tracing::warn!(event = hub::DEPLOY_EVENT, "deploy event without payload dropped");
            return;
        };

        match serde_json::from_value::<DeployCommand>(payload) {
            Ok(command) => {
                tracing::info!(
                    env = %command.env,
                    deploy_target = %command.target,
                    tag = command.tag.as_deref().unwrap_or(""),
                    "NewDeploy received"
                );
                sink.deliver(command);
            }
            Err(e) => {
                tracing::warn!(error = %e, event = hub::DEPLOY_EVENT, "malformed deploy payload dropped");
            }
        }
    })
}
