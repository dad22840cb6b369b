//! Nonce-based speedup resolution. When the claimed hash was replaced by a
//! gas-bumped transaction, the replacement is found by searching the
//! sender's explorer history for the transaction that consumed the claimed
//! nonce.

use alloy::primitives::Address;
use alloy::providers::Provider;
use chrono::Utc;
use tracing::debug;

use verifier_core::chain::EvmChain;
use verifier_core::constants::TRANSACTION_AGE_GRACE_SECS;
use verifier_core::donation::{same_address, DonationIntent};
use verifier_core::error::{AlloyRpcErrorExt, VerificationError};
use verifier_core::rpc_clients::ExplorerTx;

const PAGE_SIZE: u32 = 1000;

/// Explicit page ceiling so termination never depends on explorer behavior.
const MAX_PAGES: u32 = 20;

/// Whether the sender's account state allows a nonce history search.
enum SearchGate {
    Run,
    /// Smart-contract wallets have no account nonce the explorer history
    /// can answer for; their claims keep waiting on the direct hash lookup.
    ContractWallet,
    /// Nothing has consumed the nonce yet; the claimed transaction may
    /// simply not be mined.
    NonceUnconsumed,
}

fn search_gate(code: &[u8], tx_count: u64, nonce: u64) -> SearchGate {
    if !code.is_empty() {
        return SearchGate::ContractWallet;
    }
    if tx_count <= nonce {
        return SearchGate::NonceUnconsumed;
    }
    SearchGate::Run
}

/// Outcome of scanning one newest-first explorer page for the claimed nonce.
enum PageScan {
    Hit(String),
    /// An outgoing transaction with a lower nonce appeared; later pages
    /// cannot contain the claimed one.
    BelowClaimed,
    NotHere,
}

fn scan_page(txs: &[ExplorerTx], from_address: &str, nonce: u64) -> PageScan {
    let outgoing: Vec<_> = txs
        .iter()
        .filter(|t| same_address(&t.from, from_address))
        .collect();

    if let Some(hit) = outgoing.iter().find(|t| t.nonce == nonce) {
        return PageScan::Hit(hit.hash.to_lowercase());
    }

    if outgoing.iter().any(|t| t.nonce < nonce) {
        return PageScan::BelowClaimed;
    }

    PageScan::NotHere
}

/// The nonce was consumed, yet the history search came up empty. Fresh
/// claims get the benefit of explorer indexing lag; stale ones are declared
/// superseded.
fn consumed_but_missing(age_secs: i64, from_address: &str, nonce: u64) -> VerificationError {
    if age_secs > TRANSACTION_AGE_GRACE_SECS as i64 {
        VerificationError::NonceAlreadyUsed {
            address: from_address.to_string(),
            nonce,
        }
    } else {
        VerificationError::Pending
    }
}

/// Finds the hash of the mined transaction that consumed `nonce`, or decides
/// what the missing claimed hash means.
pub(crate) async fn find_consuming_transaction(
    chain: &EvmChain,
    intent: &DonationIntent,
    nonce: u64,
) -> Result<String, VerificationError> {
    let not_found = || VerificationError::NotFound {
        hash: intent.transaction_id.clone(),
    };

    let from: Address =
        intent
            .from_address
            .parse()
            .map_err(|_| VerificationError::Config {
                message: format!("malformed sender address: {}", intent.from_address),
            })?;

    let code = chain
        .provider
        .get_code_at(from)
        .await
        .map_err(|e| e.to_verification_error(chain.network_id))?;
    let tx_count = chain
        .provider
        .get_transaction_count(from)
        .await
        .map_err(|e| e.to_verification_error(chain.network_id))?;

    match search_gate(&code, tx_count, nonce) {
        SearchGate::ContractWallet => {
            debug!(
                donation_id = intent.donation_id,
                from = %intent.from_address,
                "sender is a contract wallet, skipping nonce history search"
            );
            return Err(not_found());
        }
        SearchGate::NonceUnconsumed => return Err(not_found()),
        SearchGate::Run => {}
    }

    let Some(explorer) = &chain.explorer else {
        // The nonce was consumed but no explorer is configured to tell us by
        // what. Leave the claim pending rather than guessing.
        return Err(not_found());
    };

    for page in 1..=MAX_PAGES {
        let txs = explorer
            .account_txlist(&intent.from_address, page, PAGE_SIZE)
            .await?;

        match scan_page(&txs, &intent.from_address, nonce) {
            PageScan::Hit(hash) => return Ok(hash),
            PageScan::BelowClaimed => {
                return Err(VerificationError::NotFoundInHistory {
                    address: intent.from_address.clone(),
                    nonce,
                });
            }
            PageScan::NotHere => {}
        }

        if txs.len() < PAGE_SIZE as usize {
            break;
        }
    }

    let age_secs = (Utc::now() - intent.created_at).num_seconds();
    Err(consumed_but_missing(age_secs, &intent.from_address, nonce))
}
