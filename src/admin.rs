//! Admin event bus (4.8, C10): a `tokio_tungstenite`-based WebSocket
//! *server* that authenticates operators and streams channel-scoped
//! events (job_status, transactions, balance_updates, logs,
//! reactive_events, launch_updates) out to subscribers.
//!
//! Grounded on the connection-management shape of
//! `rpc::subscriber::LogSubscriber` (ping/pong staleness tracking,
//! per-connection background task) but inverted: that module dials out to
//! one upstream node, this one accepts many downstream clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::AdminSubscription;
use crate::utils::time::now_unix;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(60);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOX_CAPACITY: usize = 256;

/// Channels that require an admin identity to subscribe to; everything
/// else is readable by any authenticated client (4.8: "authz at
/// subscribe+publish via role check").
const ADMIN_ONLY_CHANNELS: &[&str] = &["job_status", "logs"];

pub struct AuthIdentity {
    pub identity_id: String,
    pub is_admin: bool,
}

/// Pluggable authentication strategy for the admin bus handshake (4.8/9).
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<AuthIdentity>;
}

/// A fixed token -> identity table, the simplest verifier that satisfies
/// the trait; a deployment wired to a real identity provider would swap
/// this for another `AuthVerifier` implementation without touching
/// `EventBus`.
pub struct StaticAuthVerifier {
    tokens: DashMap<String, AuthIdentity>,
}

impl StaticAuthVerifier {
    pub fn new() -> Self {
        Self { tokens: DashMap::new() }
    }

    pub fn insert(&self, token: impl Into<String>, identity_id: impl Into<String>, is_admin: bool) {
        self.tokens.insert(token.into(), AuthIdentity { identity_id: identity_id.into(), is_admin });
    }
}

impl Default for StaticAuthVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthVerifier for StaticAuthVerifier {
    async fn verify(&self, token: &str) -> Option<AuthIdentity> {
        self.tokens
            .get(token)
            .map(|e| AuthIdentity { identity_id: e.identity_id.clone(), is_admin: e.is_admin })
    }
}

struct ClientHandle {
    tx: mpsc::Sender<Value>,
    is_admin: bool,
    subscription: Mutex<AdminSubscription>,
}

/// Owns every live admin-bus connection and the channel-scoped fan-out.
/// `publish` never blocks on a slow subscriber (4.8: "non-blocking
/// per-subscriber publish; a slow subscriber drops, it never backpressures
/// the engine").
pub struct EventBus {
    verifier: Arc<dyn AuthVerifier>,
    clients: DashMap<String, ClientHandle>,
}

impl EventBus {
    pub fn new(verifier: Arc<dyn AuthVerifier>) -> Arc<Self> {
        Arc::new(Self { verifier, clients: DashMap::new() })
    }

    /// Binds and accepts connections until the process shuts down.
    pub async fn listen(self: &Arc<Self>, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(%bind_addr, "admin bus listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer).await {
                    debug!(%peer, error = %e, "admin bus connection ended");
                }
            });
        }
    }

    /// Publishes `data` to every subscriber of `channel`. Channel names
    /// match 4.8/6: job_status, transactions, balance_updates, logs,
    /// reactive_events, launch_updates.
    pub fn publish(&self, channel: &str, data: Value) {
        let envelope = json!({ "type": "event", "channel": channel, "data": data });
        for entry in self.clients.iter() {
            let handle = entry.value();
            let subscribed = handle.subscription.lock().channels.iter().any(|c| c == channel);
            if !subscribed {
                continue;
            }
            // try_send: a full outbox means the subscriber is slow; drop the
            // event rather than waiting on it.
            let _ = handle.tx.try_send(envelope.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.len()
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let query_token: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let cb_token = query_token.clone();
        let callback = move |req: &Request, response: Response| {
            if let Some(query) = req.uri().query() {
                for pair in query.split('&') {
                    if let Some(value) = pair.strip_prefix("token=") {
                        *cb_token.lock() = Some(value.to_string());
                    }
                }
            }
            Ok(response) as std::result::Result<Response, ErrorResponse>
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut write, mut read) = futures_util::StreamExt::split(ws_stream);

        let token = match query_token.lock().clone() {
            Some(t) => Some(t),
            None => match tokio::time::timeout(AUTH_TIMEOUT, futures_util::StreamExt::next(&mut read)).await {
                Ok(Some(Ok(Message::Text(text)))) => extract_first_message_token(&text),
                _ => None,
            },
        };

        let identity = match token.as_deref() {
            Some(t) => self.verifier.verify(t).await,
            None => None,
        };

        let identity = match identity {
            Some(i) => i,
            None => {
                use futures_util::SinkExt;
                let _ = write
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: "unauthorized".into(),
                    })))
                    .await;
                warn!(%peer, "admin bus: auth failed, connection closed");
                return Ok(());
            }
        };

        use futures_util::SinkExt;
        let client_id = Uuid::new_v4().to_string();
        write
            .send(Message::Text(json!({ "type": "auth_success", "isAdmin": identity.is_admin }).to_string()))
            .await
            .ok();

        let (tx, mut rx) = mpsc::channel::<Value>(OUTBOX_CAPACITY);
        self.clients.insert(
            client_id.clone(),
            ClientHandle {
                tx,
                is_admin: identity.is_admin,
                subscription: Mutex::new(AdminSubscription {
                    client_id: client_id.clone(),
                    identity_id: identity.identity_id.clone(),
                    channels: Vec::new(),
                    last_ping_at: now_unix(),
                }),
            },
        );
        info!(%peer, client_id, identity_id = %identity.identity_id, is_admin = identity.is_admin, "admin bus client connected");

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        let mut last_activity = crate::utils::time::now_instant();

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() > STALE_AFTER {
                        debug!(client_id, "admin bus: client stale, dropping");
                        break;
                    }
                    if write.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(envelope) => {
                            if write.send(Message::Text(envelope.to_string())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = futures_util::StreamExt::next(&mut read) => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = crate::utils::time::now_instant();
                            self.handle_client_message(&client_id, &text);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity = crate::utils::time::now_instant();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(client_id, error = %e, "admin bus: read error");
                            break;
                        }
                    }
                }
            }
        }

        self.clients.remove(&client_id);
        info!(%peer, client_id, "admin bus client disconnected");
        Ok(())
    }

    fn handle_client_message(&self, client_id: &str, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else { return };
        let Some(msg_type) = value.get("type").and_then(Value::as_str) else { return };
        let Some(handle) = self.clients.get(client_id) else { return };

        match msg_type {
            "ping" => {
                handle.subscription.lock().last_ping_at = now_unix();
                let _ = handle.tx.try_send(json!({ "type": "pong" }));
            }
            "subscribe" => {
                if let Some(channel) = value.get("channel").and_then(Value::as_str) {
                    if ADMIN_ONLY_CHANNELS.contains(&channel) && !handle.is_admin {
                        let _ = handle.tx.try_send(json!({
                            "type": "error",
                            "message": format!("channel '{channel}' requires admin"),
                        }));
                        return;
                    }
                    let mut sub = handle.subscription.lock();
                    if !sub.channels.iter().any(|c| c == channel) {
                        sub.channels.push(channel.to_string());
                    }
                }
            }
            "unsubscribe" => {
                if let Some(channel) = value.get("channel").and_then(Value::as_str) {
                    handle.subscription.lock().channels.retain(|c| c != channel);
                }
            }
            _ => {}
        }
    }
}

fn extract_first_message_token(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("auth") {
        return None;
    }
    value.get("token").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_resolves_known_token() {
        let verifier = StaticAuthVerifier::new();
        verifier.insert("secret", "operator-1", true);
        let identity = verifier.verify("secret").await.expect("should resolve");
        assert_eq!(identity.identity_id, "operator-1");
        assert!(identity.is_admin);
    }

    #[tokio::test]
    async fn static_verifier_rejects_unknown_token() {
        let verifier = StaticAuthVerifier::new();
        assert!(verifier.verify("nope").await.is_none());
    }

    #[test]
    fn extracts_token_from_auth_message() {
        let token = extract_first_message_token(r#"{"type":"auth","token":"abc123"}"#);
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn ignores_non_auth_first_message() {
        assert!(extract_first_message_token(r#"{"type":"ping"}"#).is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let verifier: Arc<dyn AuthVerifier> = Arc::new(StaticAuthVerifier::new());
        let bus = EventBus::new(verifier);
        bus.publish("job_status", json!({"token_id": "t1"}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
