use thiserror::Error;

/// Crate-wide error type. Wraps both the ambient transport/IO errors every
/// collaborator can raise and the typed kinds from the error-handling design
/// (`TransientRpc`, `BlockhashExpired`, ...) that the scheduler and executor
/// branch on directly.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pubkey parse error: {0}")]
    Pubkey(#[from] solana_sdk::pubkey::ParsePubkeyError),

    #[error("signature parse error: {0}")]
    Signature(#[from] solana_sdk::signature::ParseSignatureError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("initialization error: {0}")]
    Init(String),

    // --- Typed kinds from the error-handling design (section 7) ---
    #[error("transient RPC error: {0}")]
    TransientRpc(String),

    #[error("blockhash expired")]
    BlockhashExpired,

    #[error("permanent program error: {0}")]
    PermanentProgramError(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("signer refused: {0}")]
    SignerRefused(String),

    #[error("venue quote stale: {0}")]
    VenueQuoteStale(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("venue error: {0}")]
    Venue(String),

    #[error("trading error: {0}")]
    Trading(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The dispatch classification used by the executor and scheduler. Every
/// `EngineError` variant maps to exactly one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; no state change beyond the attempt counter.
    Transient,
    /// Retry, but `build()` must be called again before the next attempt.
    RetryRebuild,
    /// Stop immediately; surfaced to the caller as a terminal failure.
    Permanent,
    /// Not an engine failure: the token is ineligible for this tick.
    Ineligible,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::BlockhashExpired | EngineError::VenueQuoteStale(_) => {
                ErrorClass::RetryRebuild
            }
            EngineError::TransientRpc(_)
            | EngineError::Http(_)
            | EngineError::WebSocket(_)
            | EngineError::Io(_) => ErrorClass::Transient,
            EngineError::InsufficientFunds(_) => ErrorClass::Ineligible,
            EngineError::PermanentProgramError(_)
            | EngineError::SignerRefused(_)
            | EngineError::NetworkUnreachable(_) => ErrorClass::Permanent,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::RetryRebuild
        )
    }
}
