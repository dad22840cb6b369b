//! Stellar resolution over Horizon: native `payment` operations, plus
//! `create_account` for donations that fund a previously-unused address.

use std::sync::Arc;

use verifier_core::chain::ChainRegistry;
use verifier_core::donation::{same_address, DonationIntent, TransactionFact};
use verifier_core::error::VerificationError;
use verifier_core::rpc_clients::horizon::HorizonOperation;

const NATIVE_SYMBOL: &str = "XLM";

pub struct StellarResolver {
    chains: Arc<ChainRegistry>,
}

impl StellarResolver {
    pub fn new(chains: Arc<ChainRegistry>) -> Self {
        Self { chains }
    }

    pub async fn resolve(
        &self,
        intent: &DonationIntent,
    ) -> Result<TransactionFact, VerificationError> {
        let chain = self.chains.get_stellar(intent.network_id)?;

        let tx = chain
            .horizon
            .get_transaction(&intent.transaction_id)
            .await?
            .ok_or_else(|| VerificationError::NotFound {
                hash: intent.transaction_id.clone(),
            })?;

        if !tx.successful {
            return Err(VerificationError::OnChainFailure {
                hash: intent.transaction_id.clone(),
            });
        }
        let timestamp_secs = tx.timestamp_secs()?;

        let operations = chain
            .horizon
            .get_operations(&intent.transaction_id)
            .await?;

        let (from, to, amount) = operations
            .iter()
            .find_map(|op| matching_transfer(op, &intent.to_address))
            .ok_or_else(|| VerificationError::NotFound {
                hash: intent.transaction_id.clone(),
            })?;

        Ok(TransactionFact {
            hash: tx.hash,
            from,
            to,
            amount: amount.parse().map_err(|e| VerificationError::Internal {
                message: format!("malformed Horizon amount {amount}: {e}"),
            })?,
            currency: NATIVE_SYMBOL.to_string(),
            timestamp_secs,
            nonce: None,
            safe_received_at: Vec::new(),
        })
    }
}

/// Both shapes move lumens to the donation address: a `payment` of the
/// native asset, or a `create_account` whose starting balance funds it.
fn matching_transfer(
    op: &HorizonOperation,
    to_address: &str,
) -> Option<(String, String, String)> {
    match op.kind.as_str() {
        "payment" => {
            if op.asset_type.as_deref() != Some("native") {
                return None;
            }
            let to = op.to.clone()?;
            if !same_address(&to, to_address) {
                return None;
            }
            Some((op.from.clone()?, to, op.amount.clone()?))
        }
        "create_account" => {
            let account = op.account.clone()?;
            if !same_address(&account, to_address) {
                return None;
            }
            Some((op.funder.clone()?, account, op.starting_balance.clone()?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(to: &str) -> HorizonOperation {
        serde_json::from_value(serde_json::json!({
            "type": "payment",
            "asset_type": "native",
            "from": "GAX3BRBNB5WTJ2GNEFFH7A4CZKT2FORYABDDBZR5FIIT3ZREPLBVQSGF",
            "to": to,
            "amount": "25.0000000"
        }))
        .unwrap()
    }

    #[test]
    fn payment_to_donation_address_matches() {
        let to = "GDUK2QZSCGI3MLGJKJANBGBHBUGI3HGEJSKQPXXT6DAVVMOAPAQFSHJW";
        let (from, matched_to, amount) = matching_transfer(&payment(to), to).unwrap();
        assert!(from.starts_with("GAX3"));
        assert_eq!(matched_to, to);
        assert_eq!(amount, "25.0000000");
    }

    #[test]
    fn payment_to_other_address_is_skipped() {
        let op = payment("GDUK2QZSCGI3MLGJKJANBGBHBUGI3HGEJSKQPXXT6DAVVMOAPAQFSHJW");
        assert!(matching_transfer(&op, "GAX3BRBNB5WTJ2GNEFFH7A4CZKT2FORYABDDBZR5FIIT3ZREPLBVQSGF").is_none());
    }

    #[test]
    fn create_account_funds_the_donation_address() {
        let to = "GDUK2QZSCGI3MLGJKJANBGBHBUGI3HGEJSKQPXXT6DAVVMOAPAQFSHJW";
        let op: HorizonOperation = serde_json::from_value(serde_json::json!({
            "type": "create_account",
            "funder": "GAX3BRBNB5WTJ2GNEFFH7A4CZKT2FORYABDDBZR5FIIT3ZREPLBVQSGF",
            "account": to,
            "starting_balance": "100.0000000"
        }))
        .unwrap();
        let (_, matched_to, amount) = matching_transfer(&op, to).unwrap();
        assert_eq!(matched_to, to);
        assert_eq!(amount, "100.0000000");
    }
}
