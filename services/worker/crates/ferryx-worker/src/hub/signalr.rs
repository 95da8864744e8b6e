//! SignalR client for the coordinator's deploy hub.
//!
//! Implements the subset of the ASP.NET Core SignalR JSON hub protocol the
//! worker needs: negotiate, WebSocket transport, handshake, invocations with
//! completions, keep-alive pings, and automatic reconnection.
//!
//! ```text
//! start() ── connect ──▶ driver task ── pump ──▶ lost ──▶ Reconnecting
//!                             ▲                              │
//!                             └──── Reconnected ◀── connect ─┘ (0s, 2s, 10s, 30s)
//!                                                            │ exhausted
//!                                                            ▼
//!                                                          Closed
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::protocol::{self, HubMessage};
use super::{AccessTokenProvider, ChannelEvent, HubChannel, InvocationHandler};
use crate::error::ChannelError;

const MAX_NEGOTIATE_REDIRECTS: usize = 5;
const LIFECYCLE_CAPACITY: usize = 16;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingInvocation = (String, oneshot::Sender<Result<Value, ChannelError>>);

/// Timing knobs. Defaults match the SignalR .NET client.
#[derive(Debug, Clone)]
pub struct ChannelTimings {
    pub keep_alive: Duration,
    pub server_timeout: Duration,
    pub handshake_timeout: Duration,
    pub negotiate_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
}

impl Default for ChannelTimings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            negotiate_timeout: Duration::from_secs(30),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }
}

/// Production [`HubChannel`].
pub struct SignalRChannel {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    access_token: AccessTokenProvider,
    timings: ChannelTimings,
    http: reqwest::Client,
    handlers: RwLock<HashMap<String, InvocationHandler>>,
    link: Mutex<Link>,
    next_invocation: AtomicU64,
    lifecycle: broadcast::Sender<ChannelEvent>,
    driver: tokio::sync::Mutex<Option<Driver>>,
}

/// Outbound queue of the live connection plus invocations awaiting a
/// completion. Swapped together so an invocation is never stranded.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<String, PendingInvocation>,
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Connection {
    ws: WsStream,
    /// Records that arrived in the same frame as the handshake response.
    leftover: Vec<String>,
}

enum PumpEnd {
    Stopped,
    Lost(String),
    Closed(Option<String>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

struct Negotiated {
    endpoint: String,
    token: String,
    connection_token: Option<String>,
}

impl SignalRChannel {
    /// `endpoint` is the full hub URL, e.g. `https://coordinator/hubs/deploy`.
    pub fn new(endpoint: impl Into<String>, access_token: AccessTokenProvider) -> Self {
        Self::with_timings(endpoint, access_token, ChannelTimings::default())
    }

    pub fn with_timings(
        endpoint: impl Into<String>,
        access_token: AccessTokenProvider,
        timings: ChannelTimings,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                access_token,
                timings,
                http: reqwest::Client::new(),
                handlers: RwLock::new(HashMap::new()),
                link: Mutex::new(Link::default()),
                next_invocation: AtomicU64::new(1),
                lifecycle,
                driver: tokio::sync::Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl HubChannel for SignalRChannel {
    fn on(&self, event: &str, handler: InvocationHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.to_string(), handler);
    }

    fn lifecycle(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.lifecycle.subscribe()
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<(), ChannelError> {
        let mut driver = self.inner.driver.lock().await;
        if driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            return Err(ChannelError::AlreadyStarted);
        }

        let conn = tokio::select! {
            conn = self.inner.connect() => conn?,
            () = cancel.cancelled() => return Err(ChannelError::Cancelled),
        };

        let outbound = self.inner.attach();
        let run = CancellationToken::new();
        let task = tokio::spawn(Inner::drive(
            Arc::clone(&self.inner),
            conn,
            outbound,
            run.clone(),
        ));
        *driver = Some(Driver { cancel: run, task });
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ChannelError> {
        let id = self
            .inner
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut link = self.inner.link();
            let outbound = link.outbound.clone().ok_or(ChannelError::NotConnected)?;
            outbound
                .send(protocol::invocation(&id, method, &args))
                .map_err(|_| ChannelError::NotConnected)?;
            link.pending.insert(id, (method.to_string(), tx));
        }

        rx.await
            .unwrap_or_else(|_| Err(ChannelError::ConnectionLost(method.to_string())))
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let driver = self.inner.driver.lock().await.take();
        if let Some(Driver { cancel, task }) = driver {
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "hub connection task ended abnormally");
            }
        }
        self.inner.detach();
        Ok(())
    }
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a fresh outbound queue for a new connection.
    fn attach(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.link().outbound = Some(tx);
        rx
    }

    /// Drops the outbound queue and fails every pending invocation.
    fn detach(&self) {
        let pending = {
            let mut link = self.link();
            link.outbound = None;
            std::mem::take(&mut link.pending)
        };
        for (_, (method, tx)) in pending {
            let _ = tx.send(Err(ChannelError::ConnectionLost(method)));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.lifecycle.send(event);
    }

    // ── Connection setup ─────────────────────────────────────────────────────

    async fn connect(&self) -> Result<Connection, ChannelError> {
        let token = (self.access_token)();
        let negotiated = self.negotiate(token).await?;
        let url = websocket_url(
            &negotiated.endpoint,
            negotiated.connection_token.as_deref(),
            &negotiated.token,
        )?;

        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        ws.send(Message::Text(protocol::handshake_request().into()))
            .await?;

        let frame = tokio::time::timeout(self.timings.handshake_timeout, next_text(&mut ws))
            .await
            .map_err(|_| ChannelError::Handshake("timed out".to_string()))??;

        let mut records = protocol::records(&frame);
        let first = records
            .next()
            .ok_or_else(|| ChannelError::Handshake("empty response".to_string()))?;
        if let Some(error) = protocol::decode_handshake(first)?.error {
            return Err(ChannelError::Handshake(error));
        }
        let leftover = records.map(str::to_string).collect();

        tracing::debug!(endpoint = %negotiated.endpoint, "hub handshake complete");
        Ok(Connection { ws, leftover })
    }

    async fn negotiate(&self, token: String) -> Result<Negotiated, ChannelError> {
        let mut endpoint = self.endpoint.clone();
        let mut token = token;

        for _ in 0..=MAX_NEGOTIATE_REDIRECTS {
            let response: NegotiateResponse = self
                .http
                .post(negotiate_url(&endpoint)?)
                .bearer_auth(&token)
                .timeout(self.timings.negotiate_timeout)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if let Some(error) = response.error {
                return Err(ChannelError::NegotiateRejected(error));
            }
            if let Some(redirect) = response.url {
                endpoint = redirect;
                if let Some(redirect_token) = response.access_token {
                    token = redirect_token;
                }
                continue;
            }

            return Ok(Negotiated {
                endpoint,
                token,
                connection_token: response.connection_token.or(response.connection_id),
            });
        }

        Err(ChannelError::NegotiateRejected(
            "too many negotiate redirects".to_string(),
        ))
    }

    // ── Connection driver ────────────────────────────────────────────────────

    async fn drive(
        self: Arc<Self>,
        mut conn: Connection,
        mut outbound: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        loop {
            let end = self.pump(&mut conn, &mut outbound, &cancel).await;
            self.detach();

            match end {
                PumpEnd::Stopped => return,
                PumpEnd::Closed(error) => {
                    tracing::warn!(error = error.as_deref().unwrap_or("none"), "hub closed the connection");
                    self.emit(ChannelEvent::Closed);
                    return;
                }
                PumpEnd::Lost(reason) => {
                    tracing::warn!(%reason, "hub connection lost, reconnecting");
                }
            }

            self.emit(ChannelEvent::Reconnecting);
            match self.reconnect(&cancel).await {
                Some(next) => {
                    conn = next;
                    outbound = self.attach();
                    tracing::info!("hub connection re-established");
                    self.emit(ChannelEvent::Reconnected);
                }
                None if cancel.is_cancelled() => return,
                None => {
                    tracing::error!("hub reconnection attempts exhausted");
                    self.emit(ChannelEvent::Closed);
                    return;
                }
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<Connection> {
        for (attempt, delay) in self.timings.reconnect_delays.iter().enumerate() {
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(*delay) => {}
            }

            let result = tokio::select! {
                result = self.connect() => result,
                () = cancel.cancelled() => return None,
            };
            match result {
                Ok(conn) => return Some(conn),
                Err(e) => tracing::warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed"),
            }
        }
        None
    }

    async fn pump(
        &self,
        conn: &mut Connection,
        outbound: &mut mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> PumpEnd {
        for record in std::mem::take(&mut conn.leftover) {
            if let Some(end) = self.dispatch(&record) {
                return end;
            }
        }

        let keep_alive = self.timings.keep_alive;
        let mut ping = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        let server_timeout = tokio::time::sleep(self.timings.server_timeout);
        tokio::pin!(server_timeout);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = conn.ws.close(None).await;
                    return PumpEnd::Stopped;
                }
                Some(text) = outbound.recv() => {
                    if let Err(e) = conn.ws.send(Message::Text(text.into())).await {
                        return PumpEnd::Lost(e.to_string());
                    }
                    ping.reset();
                }
                _ = ping.tick() => {
                    if let Err(e) = conn.ws.send(Message::Text(protocol::ping().into())).await {
                        return PumpEnd::Lost(e.to_string());
                    }
                }
                () = &mut server_timeout => {
                    return PumpEnd::Lost("server timeout elapsed without a message".to_string());
                }
                frame = conn.ws.next() => {
                    server_timeout.as_mut().reset(Instant::now() + self.timings.server_timeout);
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for record in protocol::records(text.as_str()) {
                                if let Some(end) = self.dispatch(record) {
                                    return end;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return PumpEnd::Lost("websocket closed".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                    }
                }
            }
        }
    }

    /// Handles one inbound record. Returns `Some` when the connection ends.
    fn dispatch(&self, record: &str) -> Option<PumpEnd> {
        let message = match protocol::decode(record) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed hub message");
                return None;
            }
        };

        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                if invocation_id.is_some() {
                    tracing::debug!(%target, "hub expects a result; client results are not supported");
                }
                let handler = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&target)
                    .cloned();
                match handler {
                    Some(handler) => handler(arguments),
                    None => tracing::warn!(%target, "no handler registered for hub event"),
                }
                None
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let pending = self.link().pending.remove(&invocation_id);
                match pending {
                    Some((method, tx)) => {
                        let outcome = match error {
                            Some(message) => Err(ChannelError::Invocation { method, message }),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => tracing::debug!(%invocation_id, "completion for unknown invocation"),
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                if allow_reconnect {
                    Some(PumpEnd::Lost(
                        error.unwrap_or_else(|| "server requested reconnect".to_string()),
                    ))
                } else {
                    Some(PumpEnd::Closed(error))
                }
            }
            HubMessage::Other(kind) => {
                tracing::debug!(kind, "ignoring unsupported hub message");
                None
            }
        }
    }
}

/// Waits for the next text frame, skipping control frames.
async fn next_text(ws: &mut WsStream) -> Result<String, ChannelError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChannelError::Handshake("connection closed".to_string()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ChannelError> {
    Url::parse(endpoint).map_err(|e| ChannelError::Endpoint(format!("{endpoint}: {e}")))
}

/// `<endpoint>/negotiate?negotiateVersion=1`, keeping any existing query.
fn negotiate_url(endpoint: &str) -> Result<Url, ChannelError> {
    let mut url = parse_endpoint(endpoint)?;
    url.path_segments_mut()
        .map_err(|()| ChannelError::Endpoint(endpoint.to_string()))?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// WebSocket URL for `endpoint`: http→ws, https→wss, plus the connection
/// token and the URL-escaped access token.
fn websocket_url(
    endpoint: &str,
    connection_token: Option<&str>,
    access_token: &str,
) -> Result<Url, ChannelError> {
    let mut url = parse_endpoint(endpoint)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChannelError::Endpoint(format!(
                "unsupported scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ChannelError::Endpoint(endpoint.to_string()))?;

    {
        let mut query = url.query_pairs_mut();
        if let Some(id) = connection_token {
            query.append_pair("id", id);
        }
        query.append_pair("access_token", access_token);
    }
    Ok(url)
}
