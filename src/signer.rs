pub mod delegated;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::venue::types::UnsignedTx;

pub use delegated::DelegatedSigner;
pub use local::LocalSigner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTx {
    pub base64: String,
}

/// Produces a signed transaction from an unsigned one for a given key
/// handle (4.3). `key_id` addresses either a locally-held keypair or a
/// custodial key behind the delegated signer; callers never know which.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, unsigned: UnsignedTx, key_id: &str) -> Result<SignedTx>;
}
