//! SurrealDB JSON-RPC over WebSocket.
//!
//! Each [`RpcSession`] owns one socket. A background IO task writes queued
//! requests, matches responses to callers by request id and routes live
//! notifications to the stream that opened them.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::driver::{Connector, LiveStream, Notification, Session, StatementResult};
use crate::error::{ExporterError, Result};
use crate::logging::redact_url;

/// Connection settings for [`SurrealConnector`].
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// WebSocket RPC endpoint, e.g. `ws://localhost:8000/rpc`
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

pub struct SurrealConnector {
    config: SurrealConfig,
}

impl SurrealConnector {
    pub fn new(config: SurrealConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SurrealConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>> {
        let session = RpcSession::connect(&self.config).await?;
        Ok(Arc::new(session))
    }
}

// ============================================================
// Wire types
// ============================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct LiveMessage {
    id: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    result: Option<Value>,
}

type Reply = std::result::Result<Value, RpcError>;

// How long a timed-out live request may still be answered before it is forgotten
const LATE_LIVE_GRACE: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct PendingCall {
    reply: oneshot::Sender<Reply>,
    // Registered under the returned live id before the caller is answered
    live: Option<mpsc::UnboundedSender<Notification>>,
}

/// State shared between a session and its IO task.
#[derive(Default)]
struct Shared {
    pending: DashMap<u64, PendingCall>,
    lives: DashMap<String, mpsc::UnboundedSender<Notification>>,
    closed: AtomicBool,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        let response: RpcResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Discarding malformed RPC message");
                return;
            }
        };

        match response.id.as_ref().and_then(request_id) {
            Some(id) => self.complete(id, response),
            None => match response.result {
                Some(result) => self.notify(result),
                None => debug!("Ignoring RPC message without id or result"),
            },
        }
    }

    fn complete(&self, id: u64, response: RpcResponse) {
        let Some((_, call)) = self.pending.remove(&id) else {
            debug!(id, "Response for unknown or expired request");
            return;
        };

        let reply = match response.error {
            Some(error) => Err(error),
            None => {
                let result = response.result.unwrap_or(Value::Null);
                if let (Some(tx), Some(live_id)) = (call.live, result.as_str()) {
                    self.lives.insert(live_id.to_string(), tx);
                }
                Ok(result)
            }
        };
        let _ = call.reply.send(reply);
    }

    fn notify(&self, payload: Value) {
        let message: LiveMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Ignoring unsolicited RPC result");
                return;
            }
        };

        let notification = Notification {
            live_id: message.id.clone(),
            action: message.action,
            result: message.result,
            before: None,
        };

        let delivered = match self.lives.get(&message.id) {
            Some(tx) => tx.send(notification).is_ok(),
            None => {
                debug!(live_id = %message.id, "Notification for unknown live query");
                return;
            }
        };
        if !delivered {
            self.lives.remove(&message.id);
        }
    }

    /// Fail pending calls and end every live stream.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.lives.clear();
    }
}

/// Request ids are sent as numbers but some servers echo them back as strings.
fn request_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ============================================================
// Session
// ============================================================

pub struct RpcSession {
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl RpcSession {
    /// Open the socket and sign in as a root user.
    pub async fn connect(config: &SurrealConfig) -> Result<Self> {
        debug!(endpoint = %redact_url(&config.endpoint), "Connecting to SurrealDB");

        let (ws, _) = tokio::time::timeout(
            config.timeout,
            tokio_tungstenite::connect_async(config.endpoint.as_str()),
        )
        .await
        .map_err(|_| ExporterError::Timeout(config.timeout))?
        .map_err(|e| ExporterError::Connection(e.to_string()))?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        tokio::spawn(io_loop(ws, outgoing_rx, shared.clone()));

        let session = Self {
            outgoing,
            shared,
            next_id: AtomicU64::new(1),
            timeout: config.timeout,
        };

        let params = json!([{ "user": config.username, "pass": config.password }]);
        session
            .call("signin", params, None)
            .await?
            .map_err(|e| ExporterError::Authentication(e.message))?;

        info!(endpoint = %redact_url(&config.endpoint), "Connected to SurrealDB");
        Ok(session)
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        live: Option<mpsc::UnboundedSender<Notification>>,
    ) -> Result<Reply> {
        if self.is_closed() {
            return Err(ExporterError::SessionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, mut rx) = oneshot::channel();
        let opens_live = live.is_some();
        self.shared.pending.insert(id, PendingCall { reply, live });

        // The IO task may have closed between the check and the insert
        if self.is_closed() {
            self.shared.pending.remove(&id);
            return Err(ExporterError::SessionClosed);
        }

        let payload = serde_json::to_string(&json!({ "id": id, "method": method, "params": params }))?;
        if self.outgoing.send(Message::Text(payload.into())).is_err() {
            self.shared.pending.remove(&id);
            return Err(ExporterError::SessionClosed);
        }

        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ExporterError::SessionClosed),
            Err(_) if opens_live => {
                self.kill_late_live(id, rx);
                Err(ExporterError::Timeout(self.timeout))
            }
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(ExporterError::Timeout(self.timeout))
            }
        }
    }

    /// A live query the server opens after its caller timed out has no
    /// stream to feed. Wait a little longer for its id and kill it.
    fn kill_late_live(&self, request: u64, rx: oneshot::Receiver<Reply>) {
        if let Some(mut call) = self.shared.pending.get_mut(&request) {
            call.live = None;
        }

        let shared = self.shared.clone();
        let outgoing = self.outgoing.clone();
        let kill_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            match tokio::time::timeout(LATE_LIVE_GRACE, rx).await {
                Ok(Ok(Ok(Value::String(live_id)))) => {
                    debug!(live_id = %live_id, "Killing live query opened after its request timed out");
                    let payload = json!({ "id": kill_id, "method": "kill", "params": [live_id] });
                    let _ = outgoing.send(Message::Text(payload.to_string().into()));
                }
                Ok(_) => {}
                Err(_) => {
                    shared.pending.remove(&request);
                }
            }
        });
    }
}

#[async_trait]
impl Session for RpcSession {
    async fn use_scope(&self, namespace: &str, database: &str) -> Result<()> {
        self.call("use", json!([namespace, database]), None)
            .await?
            .map_err(|e| ExporterError::Query {
                statement: format!("USE NS {} DB {}", namespace, database),
                message: e.message,
            })?;
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<StatementResult>> {
        let result = self
            .call("query", json!([statement]), None)
            .await?
            .map_err(|e| ExporterError::Query {
                statement: statement.to_string(),
                message: e.message,
            })?;
        Ok(serde_json::from_value(result)?)
    }

    async fn live(&self, table: &str) -> Result<LiveStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = self
            .call("live", json!([table, false]), Some(tx))
            .await?
            .map_err(|e| ExporterError::Live(format!("{} (code {})", e.message, e.code)))?;

        let id = result
            .as_str()
            .ok_or_else(|| ExporterError::Protocol(format!("live query id is not a string: {}", result)))?;
        Ok(LiveStream::new(id, rx))
    }

    async fn kill(&self, live_id: &str) -> Result<()> {
        self.shared.lives.remove(live_id);
        self.call("kill", json!([live_id]), None)
            .await?
            .map_err(|e| ExporterError::Live(e.message))?;
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        let result = self
            .call("version", json!([]), None)
            .await?
            .map_err(|e| ExporterError::Protocol(e.message))?;
        parse_version(&result)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// The `version` method answers `surrealdb-2.1.4`; keep the number.
fn parse_version(result: &Value) -> Result<String> {
    let raw = result
        .as_str()
        .ok_or_else(|| ExporterError::Protocol(format!("version is not a string: {}", result)))?;
    Ok(raw.strip_prefix("surrealdb-").unwrap_or(raw).to_string())
}

async fn io_loop(ws: WsStream, mut outgoing: mpsc::UnboundedReceiver<Message>, shared: Arc<Shared>) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "Failed to write to SurrealDB socket");
                        break;
                    }
                }
                // Session dropped
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => shared.dispatch(text),
                    Err(_) => warn!(bytes = data.len(), "Discarding non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "SurrealDB closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "SurrealDB socket error");
                    break;
                }
                None => break,
            },
        }
    }

    shared.close();
    debug!("SurrealDB session closed");
}
