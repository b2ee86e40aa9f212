use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// An unsigned, base64-encoded transaction as returned by a venue backend.
/// The executor always treats this as opaque bytes it hands to the signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub base64: String,
    pub fee_payer: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub output_amount: u64,
    pub price_impact_bps: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimablePosition {
    pub claimable_sol: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenMeta {
    pub graduated: bool,
}
