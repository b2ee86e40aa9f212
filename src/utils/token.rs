use crate::error::{EngineError, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use spl_token::state::Account as TokenAccount;
use spl_token::state::Mint;

pub async fn get_token_balance(
    rpc_client: &RpcClient,
    wallet: &Pubkey,
    mint: &Pubkey,
) -> Result<u64> {
    let ata_address = spl_associated_token_account::get_associated_token_address(wallet, mint);

    match rpc_client.get_account(&ata_address).await {
        Ok(account) => {
            let token_account = TokenAccount::unpack(&account.data).map_err(|e| {
                EngineError::Parse(format!("failed to unpack token account: {e}"))
            })?;

            Ok(token_account.amount)
        }
        Err(_) => match rpc_client.get_token_account_balance(&ata_address).await {
            Ok(balance) => balance
                .amount
                .parse::<u64>()
                .map_err(|e| EngineError::Parse(format!("invalid balance amount: {e}"))),
            // Account not found reads as a zero balance rather than a failure: a
            // dev/ops wallet that has never received the mint is a normal state.
            Err(_) => Ok(0),
        },
    }
}

pub async fn get_decimals(rpc_client: &RpcClient, mint: &Pubkey) -> Result<u8> {
    let account = rpc_client
        .get_account(mint)
        .await
        .map_err(|e| EngineError::TransientRpc(format!("failed to fetch mint: {e}")))?;

    let mint_data = Mint::unpack(&account.data)
        .map_err(|e| EngineError::Parse(format!("failed to unpack mint: {e}")))?;

    Ok(mint_data.decimals)
}

/// Converts a raw token amount to its human (UI) quantity given decimals.
pub fn raw_to_ui(amount: u128, decimals: u8) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

/// Converts a human (UI) quantity to a raw token amount given decimals.
pub fn ui_to_raw(amount: f64, decimals: u8) -> u128 {
    (amount * 10f64.powi(decimals as i32)).round() as u128
}

/// Clamps a value into `[lo, hi]`, tolerating an inverted range by
/// collapsing to `lo` (used when a token's `max_buy_sol` is misconfigured
/// below `min_buy_sol`; the scheduler should not panic on it).
pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    if lo > hi {
        return lo;
    }
    value.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_ui_round_trip() {
        let raw = ui_to_raw(1.5, 6);
        assert_eq!(raw, 1_500_000);
        assert!((raw_to_ui(raw, 6) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn clamp_handles_inverted_range() {
        assert_eq!(clamp(5.0, 1.0, 10.0), 5.0);
        assert_eq!(clamp(0.0, 1.0, 10.0), 1.0);
        assert_eq!(clamp(50.0, 1.0, 10.0), 10.0);
        assert_eq!(clamp(50.0, 10.0, 1.0), 10.0);
    }
}
