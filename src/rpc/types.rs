use serde::{Deserialize, Serialize};

/// Outcome of `getSignatureStatus`, matching the five-way result the
/// executor's poll loop branches on (4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Pending,
    Confirmed,
    Finalized,
    Failed(String),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct Blockhash {
    pub hash: String,
    pub valid_until_height: u64,
}

/// A single entry from a `logsSubscribe` notification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogNotification {
    pub signature: String,
    pub err: Option<serde_json::Value>,
    pub logs: Vec<String>,
}

/// Commitment levels recognized by the gateway; `subscribe_logs` always uses
/// `Confirmed` per 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}
