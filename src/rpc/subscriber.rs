//! Multiplexed `logsSubscribe` client. One upstream WebSocket connection
//! serves any number of `mentions` filters, each keyed by the address being
//! watched; the reactive engine (C9) is the primary consumer, subscribing
//! one mint's ops/dev/pool addresses at a time, but the design is generic
//! over any caller that wants a notification stream for an address.
//!
//! Grounded on the teacher's `transport::websocket::manager::WebSocketManager`
//! (connect/ping/reconnect loop), generalized from a single hardcoded wallet
//! subscription into an address-keyed multiplexer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::rpc::types::{Commitment, LogNotification};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

pub struct LogSubscriber {
    ws_url: String,
    /// address -> outbound channel for notifications mentioning it.
    subs: Arc<DashMap<String, mpsc::UnboundedSender<LogNotification>>>,
    next_req_id: Arc<AtomicU64>,
}

impl LogSubscriber {
    /// Spawns the connection-management task and returns a handle. Dropping
    /// every `subscribe` receiver does not stop the task; call `shutdown`
    /// (via dropping the handle and its clones) to let it exit naturally
    /// once the process is tearing down.
    pub fn spawn(ws_url: String) -> Self {
        let subs: Arc<DashMap<String, mpsc::UnboundedSender<LogNotification>>> =
            Arc::new(DashMap::new());
        let handle = Self {
            ws_url,
            subs: subs.clone(),
            next_req_id: Arc::new(AtomicU64::new(1)),
        };

        let url = handle.ws_url.clone();
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                match run_connection(&url, subs.clone()).await {
                    Ok(()) => attempt = 0,
                    Err(e) => {
                        warn!(error = %e, "log subscriber connection ended");
                        attempt += 1;
                    }
                }
                let delay = crate::utils::time::exp_backoff(attempt, RECONNECT_BASE, RECONNECT_CAP);
                sleep(delay).await;
            }
        });

        handle
    }

    /// Subscribes to logs mentioning `address`, returning a receiver for
    /// notifications. Re-subscription after a reconnect is handled by the
    /// connection task itself (it re-issues every entry in `subs`).
    pub fn subscribe(&self, address: &str) -> mpsc::UnboundedReceiver<LogNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.insert(address.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, address: &str) {
        self.subs.remove(address);
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.subs.contains_key(address)
    }
}

async fn run_connection(
    url: &str,
    subs: Arc<DashMap<String, mpsc::UnboundedSender<LogNotification>>>,
) -> crate::error::Result<()> {
    info!(%url, "connecting log subscriber websocket");
    let (ws_stream, _) = connect_async(url).await?;
    info!("log subscriber websocket connected");

    let (mut write, mut read) = ws_stream.split();

    // subscription id (assigned by the server) -> address we filtered on.
    let mut sub_ids: HashMap<u64, String> = HashMap::new();
    // our request id -> address, so we can learn the subscription id from
    // the matching JSON-RPC response.
    let mut pending: HashMap<u64, String> = HashMap::new();
    let mut next_id: u64 = 1;

    for entry in subs.iter() {
        let address = entry.key().clone();
        let id = next_id;
        next_id += 1;
        pending.insert(id, address.clone());
        let msg = subscribe_request(id, &address);
        write.send(Message::Text(msg.to_string())).await?;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    let mut last_pong = crate::utils::time::now_instant();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > Duration::from_secs(60) {
                    warn!("log subscriber websocket stale, forcing reconnect");
                    return Err(crate::error::EngineError::NetworkUnreachable(
                        "no pong within 60s".into(),
                    ));
                }
                if write.send(Message::Ping(vec![])).await.is_err() {
                    return Err(crate::error::EngineError::NetworkUnreachable(
                        "ping send failed".into(),
                    ));
                }
            }
            // Pick up newly registered subscriptions that arrived after connect.
            _ = sleep(Duration::from_millis(500)) => {
                for entry in subs.iter() {
                    let address = entry.key().clone();
                    let already = sub_ids.values().any(|a| a == &address)
                        || pending.values().any(|a| a == &address);
                    if !already {
                        let id = next_id;
                        next_id += 1;
                        pending.insert(id, address.clone());
                        let msg = subscribe_request(id, &address);
                        if write.send(Message::Text(msg.to_string())).await.is_err() {
                            return Err(crate::error::EngineError::NetworkUnreachable(
                                "subscribe send failed".into(),
                            ));
                        }
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(&text, &mut sub_ids, &mut pending, &subs);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = crate::utils::time::now_instant();
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("log subscriber websocket closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        warn!("log subscriber websocket stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn subscribe_request(id: u64, address: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "logsSubscribe",
        "params": [
            { "mentions": [address] },
            { "commitment": Commitment::Confirmed.as_str() }
        ]
    })
}

fn handle_message(
    text: &str,
    sub_ids: &mut HashMap<u64, String>,
    pending: &mut HashMap<u64, String>,
    subs: &Arc<DashMap<String, mpsc::UnboundedSender<LogNotification>>>,
) {
    let json: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "failed to parse log subscriber message");
            return;
        }
    };

    // A subscribe confirmation: {"id": N, "result": <subscription id>}
    if let (Some(id), Some(result)) = (
        json.get("id").and_then(Value::as_u64),
        json.get("result").and_then(Value::as_u64),
    ) {
        if let Some(address) = pending.remove(&id) {
            sub_ids.insert(result, address);
        }
        return;
    }

    // A notification: {"method":"logsNotification","params":{"subscription":N,"result":{"value":{...}}}}
    if json.get("method").and_then(Value::as_str) != Some("logsNotification") {
        return;
    }

    let Some(params) = json.get("params") else { return };
    let Some(sub_id) = params.get("subscription").and_then(Value::as_u64) else { return };
    let Some(address) = sub_ids.get(&sub_id) else { return };
    let Some(value) = params.get("result").and_then(|r| r.get("value")) else { return };

    let signature = value.get("signature").and_then(Value::as_str).unwrap_or_default();
    let err = value.get("err").cloned().filter(|v| !v.is_null());
    let logs = value
        .get("logs")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if let Some(sender) = subs.get(address) {
        let _ = sender.send(LogNotification {
            signature: signature.to_string(),
            err,
            logs,
        });
    }
}
