//! In-process coordinator hub speaking the SignalR JSON protocol over axum
//! WebSockets. Each accepted connection is handed to the test, which drives
//! the server side explicitly.

#![allow(clippy::expect_used, dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const RS: char = '\u{1e}';
pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
struct HubState {
    negotiations: Arc<Mutex<Vec<Option<String>>>>,
    negotiate_error: Arc<Mutex<Option<String>>>,
    connections: Arc<Mutex<Option<mpsc::UnboundedSender<HubConnection>>>>,
}

pub struct FakeHub {
    pub addr: SocketAddr,
    state: HubState,
    accepted: mpsc::UnboundedReceiver<HubConnection>,
}

/// Server side of one WebSocket connection.
pub struct HubConnection {
    pub query: HashMap<String, String>,
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl FakeHub {
    pub async fn start() -> Self {
        let (tx, accepted) = mpsc::unbounded_channel();
        let state = HubState {
            connections: Arc::new(Mutex::new(Some(tx))),
            ..HubState::default()
        };

        let app = Router::new()
            .route("/hubs/deploy/negotiate", post(negotiate))
            .route("/hubs/deploy", get(upgrade))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake hub");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move { axum::serve(listener, app).await.expect("serve fake hub") });

        Self {
            addr,
            state,
            accepted,
        }
    }

    /// Base URL as configured on the worker (without the hub path).
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/hubs/deploy", self.addr)
    }

    pub fn reject_negotiate(&self, error: &str) {
        *self.state.negotiate_error.lock().expect("lock") = Some(error.to_string());
    }

    /// `Authorization` headers seen by the negotiate endpoint, in order.
    pub fn negotiations(&self) -> Vec<Option<String>> {
        self.state.negotiations.lock().expect("lock").clone()
    }

    pub async fn accept(&mut self) -> HubConnection {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("hub stopped")
    }

    /// Accepts a connection and completes the handshake.
    pub async fn accept_ready(&mut self) -> HubConnection {
        let mut conn = self.accept().await;
        conn.handshake().await;
        conn
    }
}

impl HubConnection {
    pub async fn next_record(&mut self) -> Value {
        let record = tokio::time::timeout(WAIT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client record")
            .expect("client disconnected");
        serde_json::from_str(&record).expect("client sent invalid JSON")
    }

    pub async fn handshake(&mut self) {
        let request = self.next_record().await;
        assert_eq!(request["protocol"], "json");
        assert_eq!(request["version"], 1);
        self.send_raw(&format!("{{}}{RS}"));
    }

    /// Next non-ping message from the client.
    pub async fn next_message(&mut self) -> Value {
        loop {
            let message = self.next_record().await;
            if message["type"] != 6 {
                return message;
            }
        }
    }

    /// Waits for a `JoinGroup` invocation and completes it successfully.
    pub async fn expect_join(&mut self) -> Value {
        let message = self.next_message().await;
        assert_eq!(message["type"], 1);
        assert_eq!(message["target"], "JoinGroup");
        let id = message["invocationId"].as_str().expect("invocation id").to_string();
        self.send(&json!({ "type": 3, "invocationId": id, "result": null }));
        message["arguments"][0].clone()
    }

    pub fn send(&self, message: &Value) {
        self.send_raw(&format!("{message}{RS}"));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.outgoing.send(text.to_string());
    }

    pub fn push_deploy(&self, command: &Value) {
        self.send(&json!({ "type": 1, "target": "NewDeploy", "arguments": [command] }));
    }
}

async fn negotiate(State(state): State<HubState>, headers: HeaderMap) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let count = {
        let mut seen = state.negotiations.lock().expect("lock");
        seen.push(auth);
        seen.len()
    };

    if let Some(error) = state.negotiate_error.lock().expect("lock").clone() {
        return Json(json!({ "error": error })).into_response();
    }
    Json(json!({
        "negotiateVersion": 1,
        "connectionId": format!("conn-{count}"),
        "connectionToken": format!("token-{count}"),
        "availableTransports": [{ "transport": "WebSockets", "transferFormats": ["Text"] }],
    }))
    .into_response()
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<HubState>,
) -> Response {
    ws.on_upgrade(move |socket| pump(socket, query, state))
}

async fn pump(socket: WebSocket, query: HashMap<String, String>, state: HubState) {
    let (in_tx, incoming) = mpsc::unbounded_channel();
    let (outgoing, mut out_rx) = mpsc::unbounded_channel::<String>();
    let conn = HubConnection {
        query,
        incoming,
        outgoing,
    };
    if let Some(tx) = state.connections.lock().expect("lock").as_ref() {
        let _ = tx.send(conn);
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    for record in text.as_str().split(RS).filter(|r| !r.is_empty()) {
                        let _ = in_tx.send(record.to_string());
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = out_rx.recv() => match out {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Test dropped the connection: hang up.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
