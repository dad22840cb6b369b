//! Solana resolution over `jsonParsed` transactions: native system-program
//! transfers and SPL token transfers.

use std::sync::Arc;

use serde::Deserialize;
use verifier_core::chain::ChainRegistry;
use verifier_core::donation::{same_address, DonationIntent, TransactionFact};
use verifier_core::error::VerificationError;
use verifier_core::rpc_clients::solana::{ParsedTransactionWithMeta, TransactionMeta};
use verifier_core::tokens::TokenService;

const NATIVE_SYMBOL: &str = "SOL";
const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

#[derive(Debug, Deserialize)]
struct SystemTransferInfo {
    source: String,
    destination: String,
    lamports: u64,
}

/// `transferChecked` carries the amount pre-normalized; plain `transfer`
/// only has the raw token-unit string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplTransferInfo {
    #[serde(default)]
    authority: Option<String>,
    source: String,
    destination: String,
    #[serde(default)]
    mint: Option<String>,
    #[serde(default)]
    token_amount: Option<SplTokenAmount>,
    #[serde(default)]
    amount: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplTokenAmount {
    ui_amount: Option<f64>,
}

pub struct SolanaResolver {
    chains: Arc<ChainRegistry>,
    tokens: Arc<dyn TokenService>,
}

impl SolanaResolver {
    pub fn new(chains: Arc<ChainRegistry>, tokens: Arc<dyn TokenService>) -> Self {
        Self { chains, tokens }
    }

    pub async fn resolve(
        &self,
        intent: &DonationIntent,
    ) -> Result<TransactionFact, VerificationError> {
        let chain = self.chains.get_solana(intent.network_id)?;

        let tx = chain
            .rpc
            .get_transaction(&intent.transaction_id)
            .await?
            .ok_or_else(|| VerificationError::NotFound {
                hash: intent.transaction_id.clone(),
            })?;

        let meta = tx.meta.as_ref().ok_or(VerificationError::Pending)?;
        if meta.err.is_some() {
            return Err(VerificationError::OnChainFailure {
                hash: intent.transaction_id.clone(),
            });
        }
        let timestamp_secs = tx
            .block_time
            .ok_or(VerificationError::Pending)?
            .max(0) as u64;

        let transfer = if intent.currency.eq_ignore_ascii_case(NATIVE_SYMBOL) {
            self.native_transfer(&tx)?
        } else {
            self.spl_transfer(intent, &tx, meta)?
        };

        Ok(TransactionFact {
            hash: intent.transaction_id.clone(),
            from: transfer.0,
            to: transfer.1,
            amount: transfer.2,
            currency: intent.currency.to_uppercase(),
            timestamp_secs,
            nonce: None,
            safe_received_at: Vec::new(),
        })
    }

    fn native_transfer(
        &self,
        tx: &ParsedTransactionWithMeta,
    ) -> Result<(String, String, f64), VerificationError> {
        for instruction in &tx.transaction.message.instructions {
            let Some(parsed) = &instruction.parsed else {
                continue;
            };
            if instruction.program.as_deref() != Some("system") || parsed.kind != "transfer" {
                continue;
            }
            let info: SystemTransferInfo = serde_json::from_value(parsed.info.clone())
                .map_err(|e| VerificationError::Internal {
                    message: format!("malformed system transfer instruction: {e}"),
                })?;
            return Ok((
                info.source,
                info.destination,
                info.lamports as f64 / LAMPORTS_PER_SOL,
            ));
        }

        Err(VerificationError::NotFound {
            hash: tx.transaction.signatures.first().cloned().unwrap_or_default(),
        })
    }

    fn spl_transfer(
        &self,
        intent: &DonationIntent,
        tx: &ParsedTransactionWithMeta,
        meta: &TransactionMeta,
    ) -> Result<(String, String, f64), VerificationError> {
        let token = self
            .tokens
            .find_by_symbol(intent.network_id, &intent.currency)
            .ok_or_else(|| VerificationError::UnrecognizedToken {
                network_id: intent.network_id,
                symbol: intent.currency.clone(),
            })?;

        for instruction in &tx.transaction.message.instructions {
            let Some(parsed) = &instruction.parsed else {
                continue;
            };
            if instruction.program.as_deref() != Some("spl-token")
                || !matches!(parsed.kind.as_str(), "transfer" | "transferChecked")
            {
                continue;
            }
            let info: SplTransferInfo = serde_json::from_value(parsed.info.clone())
                .map_err(|e| VerificationError::Internal {
                    message: format!("malformed spl-token transfer instruction: {e}"),
                })?;

            // `transferChecked` names the mint; require it to be the claimed
            // token's. Plain `transfer` doesn't, so the destination's token
            // balance entry decides below.
            if let Some(mint) = &info.mint {
                if !same_address(mint, &token.address) {
                    continue;
                }
            }

            let Some(owner) = destination_owner(tx, meta, &info.destination, &token.address)
            else {
                continue;
            };

            let amount = match &info.token_amount {
                Some(token_amount) => token_amount.ui_amount.ok_or_else(|| {
                    VerificationError::Internal {
                        message: "transferChecked without uiAmount".to_string(),
                    }
                })?,
                None => {
                    let raw = info.amount.as_deref().unwrap_or("0");
                    let raw: f64 = raw.parse().map_err(|e| VerificationError::Internal {
                        message: format!("malformed token amount {raw}: {e}"),
                    })?;
                    raw / 10f64.powi(i32::from(token.decimals))
                }
            };

            let from = info.authority.unwrap_or(info.source);
            return Ok((from, owner, amount));
        }

        Err(VerificationError::NotFound {
            hash: intent.transaction_id.clone(),
        })
    }
}

/// The donation recipient is a wallet, but SPL transfers move between token
/// accounts. The wallet owning the destination token account is read from
/// the post-transaction token balances.
fn destination_owner(
    tx: &ParsedTransactionWithMeta,
    meta: &TransactionMeta,
    destination: &str,
    mint: &str,
) -> Option<String> {
    let keys = &tx.transaction.message.account_keys;
    meta.post_token_balances
        .iter()
        .filter(|balance| same_address(&balance.mint, mint))
        .find(|balance| {
            keys.get(balance.account_index)
                .is_some_and(|key| key.pubkey == destination)
        })
        .and_then(|balance| balance.owner.clone())
}
