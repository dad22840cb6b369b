//! EVM canonicalizer. Normalizes native transfers, ERC-20 `transfer` calls,
//! Gnosis Safe executions, ERC-4337 EntryPoint-relayed transfers, and
//! disperse-style batch transactions into [`TransactionFact`] records.

mod speedup;

use std::sync::Arc;

use alloy::consensus::Transaction as _;
use alloy::network::TransactionResponse;
use alloy::primitives::utils::format_units;
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::Provider;
use alloy::rpc::types::{Log, Transaction, TransactionReceipt};
use alloy::sol;
use alloy::sol_types::SolCall;
use tracing::debug;

use verifier_core::chain::{ChainRegistry, EvmChain};
use verifier_core::constants::NATIVE_TOKEN_DECIMALS;
use verifier_core::donation::{same_address, DonationIntent, TransactionFact};
use verifier_core::error::{AlloyRpcErrorExt, VerificationError};
use verifier_core::tokens::{TokenInfo, TokenService};

use crate::validate::close_to;

sol! {
    #[derive(Debug)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

sol! {
    /// Emitted by the Gnosis Safe fallback handler on incoming ether.
    #[derive(Debug)]
    event SafeReceived(address indexed sender, uint256 value);
}

pub struct EvmResolver {
    chains: Arc<ChainRegistry>,
    tokens: Arc<dyn TokenService>,
}

/// Receipt-level inputs to log interpretation, separated from the provider
/// so the decoding paths are pure.
struct ReceiptContext<'a> {
    hash: String,
    timestamp_secs: u64,
    nonce: u64,
    logs: &'a [Log],
}

impl ReceiptContext<'_> {
    fn safe_received_addresses(&self) -> Vec<String> {
        self.logs
            .iter()
            .filter_map(|log| log.log_decode::<SafeReceived>().ok())
            .map(|decoded| decoded.inner.address.to_string().to_lowercase())
            .collect()
    }

    fn fact(&self, from: Address, to: Address, amount: f64, currency: &str) -> TransactionFact {
        TransactionFact {
            hash: self.hash.clone(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            currency: currency.to_string(),
            timestamp_secs: self.timestamp_secs,
            nonce: Some(self.nonce),
            safe_received_at: self.safe_received_addresses(),
        }
    }
}

/// Mined transaction with all resolution inputs loaded. The canonicalizer's
/// steps are strictly sequential because each load gates the next.
struct MinedTransaction {
    hash: TxHash,
    tx: Transaction,
    receipt: TransactionReceipt,
    timestamp_secs: u64,
}

impl MinedTransaction {
    fn context(&self) -> ReceiptContext<'_> {
        ReceiptContext {
            hash: format!("{:#x}", self.hash),
            timestamp_secs: self.timestamp_secs,
            nonce: self.tx.nonce(),
            logs: self.receipt.inner.logs(),
        }
    }
}

impl EvmResolver {
    pub fn new(chains: Arc<ChainRegistry>, tokens: Arc<dyn TokenService>) -> Self {
        Self { chains, tokens }
    }

    pub async fn resolve(
        &self,
        intent: &DonationIntent,
    ) -> Result<TransactionFact, VerificationError> {
        let chain = self.chains.get_evm(intent.network_id)?;
        let hash = self.claimed_hash(&chain, intent).await?;

        let direct = self.resolve_hash(&chain, intent, &hash).await;
        if let (Err(VerificationError::NotFound { .. }), Some(nonce)) = (&direct, intent.nonce) {
            let replacement = speedup::find_consuming_transaction(&chain, intent, nonce).await?;
            debug!(
                donation_id = intent.donation_id,
                claimed = %hash,
                mined = %replacement,
                nonce,
                "claimed hash superseded by nonce history search"
            );
            // One extra hop, never recursive beyond this.
            return self.resolve_hash(&chain, intent, &replacement).await;
        }
        direct
    }

    /// Disperse / airdrop fan-out: one fact per recognized-token `Transfer`
    /// log in the receipt.
    pub async fn resolve_batch(
        &self,
        intent: &DonationIntent,
    ) -> Result<Vec<TransactionFact>, VerificationError> {
        let chain = self.chains.get_evm(intent.network_id)?;
        let hash = self.claimed_hash(&chain, intent).await?;
        let mined = self.load_mined(&chain, &hash).await?;
        batch_facts(self.tokens.as_ref(), intent.network_id, &mined.context())
    }

    /// The hash to look up: the claimed one, or for a Safe donation whose
    /// multisig has not been linked yet, the execution hash fetched from the
    /// Safe transaction service.
    async fn claimed_hash(
        &self,
        chain: &EvmChain,
        intent: &DonationIntent,
    ) -> Result<String, VerificationError> {
        if !intent.transaction_id.is_empty() {
            return Ok(intent.transaction_id.clone());
        }

        if let (Some(safe_tx_hash), Some(service)) =
            (&intent.safe_transaction_id, &chain.safe_service)
        {
            if let Some(hash) = service.fetch_safe_tx_hash(safe_tx_hash).await? {
                return Ok(hash.to_lowercase());
            }
        }

        // Multisig not executed yet (or not even proposed). Wait.
        Err(VerificationError::Pending)
    }

    async fn resolve_hash(
        &self,
        chain: &EvmChain,
        intent: &DonationIntent,
        hash: &str,
    ) -> Result<TransactionFact, VerificationError> {
        let mined = self.load_mined(chain, hash).await?;

        if intent.currency.eq_ignore_ascii_case(&chain.native_symbol) {
            return native_fact(chain, &mined);
        }

        let token = self
            .tokens
            .find_by_symbol(intent.network_id, &intent.currency)
            .ok_or_else(|| VerificationError::UnrecognizedToken {
                network_id: intent.network_id,
                symbol: intent.currency.clone(),
            })?;
        let token_address: Address =
            token
                .address
                .parse()
                .map_err(|_| VerificationError::Config {
                    message: format!(
                        "token {} on network {} has malformed address {}",
                        token.symbol, intent.network_id, token.address
                    ),
                })?;

        let tx_to = mined.tx.to();
        let context = mined.context();

        if tx_to.is_some_and(|to| chain.is_entry_point(to)) {
            // Account-abstraction relay: the outer transaction's fields are
            // the bundler's, not the donor's. The real transfer is in an
            // inner call the EntryPoint makes, visible only through logs.
            return entry_point_fact(intent, &context, &token, token_address);
        }

        if intent.safe_transaction_id.is_some() {
            return safe_fact(&context, tx_to, &token, token_address);
        }

        match tx_to {
            Some(to) if to == token_address => {}
            other => {
                return Err(VerificationError::CurrencyMismatch {
                    tx_to: other.map(|a| a.to_string()).unwrap_or_default(),
                    token_address: token.address.clone(),
                    symbol: token.symbol.clone(),
                });
            }
        }

        let call = IERC20::transferCall::abi_decode(mined.tx.input()).map_err(|_| {
            VerificationError::CurrencyMismatch {
                tx_to: token.address.clone(),
                token_address: token.address.clone(),
                symbol: token.symbol.clone(),
            }
        })?;

        Ok(context.fact(
            mined.tx.from(),
            call.to,
            units_to_f64(call.amount, token.decimals)?,
            &token.symbol,
        ))
    }

    async fn load_mined(
        &self,
        chain: &EvmChain,
        hash: &str,
    ) -> Result<MinedTransaction, VerificationError> {
        let tx_hash: TxHash = hash.parse().map_err(|_| VerificationError::Config {
            message: format!("malformed transaction hash: {hash}"),
        })?;

        let tx = chain
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(|e| e.to_verification_error(chain.network_id))?
            .ok_or_else(|| VerificationError::NotFound {
                hash: hash.to_string(),
            })?;

        let receipt = chain
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| e.to_verification_error(chain.network_id))?
            .ok_or(VerificationError::Pending)?;

        if !receipt.status() {
            return Err(VerificationError::OnChainFailure {
                hash: hash.to_string(),
            });
        }

        let block_hash = receipt.block_hash.ok_or(VerificationError::Pending)?;
        let block = chain
            .provider
            .get_block_by_hash(block_hash)
            .await
            .map_err(|e| e.to_verification_error(chain.network_id))?
            .ok_or(VerificationError::Pending)?;

        Ok(MinedTransaction {
            hash: tx_hash,
            tx,
            receipt,
            timestamp_secs: block.header.timestamp,
        })
    }
}

fn native_fact(
    chain: &EvmChain,
    mined: &MinedTransaction,
) -> Result<TransactionFact, VerificationError> {
    let context = mined.context();
    // A contract-creation transaction has no recipient; the zero address
    // fails address validation downstream.
    let to = mined.tx.to().unwrap_or(Address::ZERO);
    Ok(context.fact(
        mined.tx.from(),
        to,
        units_to_f64(mined.tx.value(), NATIVE_TOKEN_DECIMALS)?,
        &chain.native_symbol,
    ))
}

/// EntryPoint-relayed transfer: scan the receipt for `Transfer` logs of the
/// claimed token whose recipient matches the donation, preferring candidates
/// whose sender and amount also match.
fn entry_point_fact(
    intent: &DonationIntent,
    context: &ReceiptContext<'_>,
    token: &TokenInfo,
    token_address: Address,
) -> Result<TransactionFact, VerificationError> {
    let mut best: Option<(u8, TransactionFact)> = None;

    for log in context.logs {
        let Ok(decoded) = log.log_decode::<IERC20::Transfer>() else {
            continue;
        };
        if decoded.inner.address != token_address {
            continue;
        }
        let event = &decoded.inner.data;
        if !same_address(&event.to.to_string(), &intent.to_address) {
            continue;
        }

        let amount = units_to_f64(event.value, token.decimals)?;
        let score = u8::from(same_address(&event.from.to_string(), &intent.from_address))
            + u8::from(close_to(amount, intent.amount));

        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((
                score,
                context.fact(event.from, event.to, amount, &token.symbol),
            ));
        }
    }

    best.map(|(_, fact)| fact)
        .ok_or_else(|| VerificationError::NotFound {
            hash: context.hash.clone(),
        })
}

/// Gnosis Safe execution: the outer call is `execTransaction` from an owner
/// or relayer, so the transfer lives in the emitted logs. The inner ERC-20
/// event is the second decoded entry.
fn safe_fact(
    context: &ReceiptContext<'_>,
    tx_to: Option<Address>,
    token: &TokenInfo,
    token_address: Address,
) -> Result<TransactionFact, VerificationError> {
    let transfers: Vec<_> = context
        .logs
        .iter()
        .filter_map(|log| log.log_decode::<IERC20::Transfer>().ok())
        .collect();

    // Safe module flows emit a bookkeeping transfer before the donation
    // transfer; a direct execTransaction token send emits only the one.
    // Either way the picked entry still has to pass from/to/amount
    // validation downstream.
    let transfer = transfers
        .get(1)
        .or_else(|| transfers.first())
        .ok_or_else(|| VerificationError::CurrencyMismatch {
            tx_to: tx_to.map(|a| a.to_string()).unwrap_or_default(),
            token_address: token.address.clone(),
            symbol: token.symbol.clone(),
        })?;

    if transfer.inner.address != token_address {
        return Err(VerificationError::CurrencyMismatch {
            tx_to: transfer.inner.address.to_string(),
            token_address: token.address.clone(),
            symbol: token.symbol.clone(),
        });
    }

    let event = &transfer.inner.data;
    Ok(context.fact(
        event.from,
        event.to,
        units_to_f64(event.value, token.decimals)?,
        &token.symbol,
    ))
}

/// One fact per `Transfer` log of a token the platform recognizes; logs of
/// unknown tokens are skipped, not errors.
fn batch_facts(
    tokens: &dyn TokenService,
    network_id: u64,
    context: &ReceiptContext<'_>,
) -> Result<Vec<TransactionFact>, VerificationError> {
    let mut facts = Vec::new();
    for log in context.logs {
        let Ok(decoded) = log.log_decode::<IERC20::Transfer>() else {
            continue;
        };
        let Some(token) = tokens.find_by_address(network_id, &decoded.inner.address.to_string())
        else {
            continue;
        };
        let event = &decoded.inner.data;
        facts.push(context.fact(
            event.from,
            event.to,
            units_to_f64(event.value, token.decimals)?,
            &token.symbol,
        ));
    }
    Ok(facts)
}

fn units_to_f64(value: U256, decimals: u8) -> Result<f64, VerificationError> {
    let formatted = format_units(value, decimals).map_err(|e| VerificationError::Internal {
        message: format!("cannot normalize token units: {e}"),
    })?;
    formatted
        .parse::<f64>()
        .map_err(|e| VerificationError::Internal {
            message: format!("cannot parse normalized amount {formatted}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use alloy::sol_types::SolEvent;
    use chrono::Utc;
    use verifier_core::donation::ChainType;
    use verifier_core::tokens::StaticTokenRegistry;

    use super::*;

    const TOKEN: &str = "0xddafbb505ad214d7b80b1f830fccc89b60fb7a83";
    const DONOR: &str = "0x6e8873085530406995170da467010565968c7c62";
    const PROJECT: &str = "0x5ac583feb2b1f288c0a51d6cdca2e8c814bfe93b";

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn usdc(network_id: u64) -> StaticTokenRegistry {
        StaticTokenRegistry::new([(
            network_id,
            TokenInfo {
                symbol: "USDC".into(),
                address: TOKEN.into(),
                decimals: 6,
            },
        )])
    }

    fn transfer_log(token: Address, from: Address, to: Address, value: U256) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: token,
                data: IERC20::Transfer { from, to, value }.encode_log_data(),
            },
            ..Default::default()
        }
    }

    fn context(logs: &[Log]) -> ReceiptContext<'_> {
        ReceiptContext {
            hash: "0x0f9fd2d02b9a31a0e723ccb9d4cc6e85a685b9c1e291b1e30bf00a2438763afe".into(),
            timestamp_secs: 1_712_250_000,
            nonce: 7,
            logs,
        }
    }

    fn intent() -> DonationIntent {
        DonationIntent {
            donation_id: 1,
            transaction_id: "0x0f9fd2d02b9a31a0e723ccb9d4cc6e85a685b9c1e291b1e30bf00a2438763afe"
                .into(),
            safe_transaction_id: None,
            network_id: 100,
            chain_type: ChainType::Evm,
            from_address: DONOR.into(),
            to_address: PROJECT.into(),
            amount: 12.5,
            currency: "USDC".into(),
            nonce: None,
            is_swap: false,
            imported: false,
            created_at: Utc::now(),
        }
    }

    fn token_info() -> TokenInfo {
        TokenInfo {
            symbol: "USDC".into(),
            address: TOKEN.into(),
            decimals: 6,
        }
    }

    #[test]
    fn normalizes_wei_to_ether() {
        let amount = units_to_f64(U256::from(40_000_000_000_000_000u64), 18).unwrap();
        assert!((amount - 0.04).abs() < 1e-12);
    }

    #[test]
    fn normalizes_token_units_by_configured_decimals() {
        let amount = units_to_f64(U256::from(1_250_000u64), 6).unwrap();
        assert!((amount - 1.25).abs() < 1e-12);
    }

    #[test]
    fn transfer_calldata_roundtrip() {
        let call = IERC20::transferCall {
            to: addr(PROJECT),
            amount: U256::from(42u64),
        };
        let decoded = IERC20::transferCall::abi_decode(&call.abi_encode()).unwrap();
        assert_eq!(decoded.to, addr(PROJECT));
        assert_eq!(decoded.amount, U256::from(42u64));
    }

    #[test]
    fn entry_point_transfer_comes_from_the_matching_log() {
        // One bundler-fee transfer to someone else, one real donation.
        let logs = vec![
            transfer_log(
                addr(TOKEN),
                addr(DONOR),
                addr("0x1111111111111111111111111111111111111111"),
                U256::from(90_000u64),
            ),
            transfer_log(addr(TOKEN), addr(DONOR), addr(PROJECT), U256::from(12_500_000u64)),
        ];

        let fact =
            entry_point_fact(&intent(), &context(&logs), &token_info(), addr(TOKEN)).unwrap();
        assert!(same_address(&fact.from, DONOR));
        assert!(same_address(&fact.to, PROJECT));
        assert!((fact.amount - 12.5).abs() < 1e-12);
    }

    #[test]
    fn entry_point_scoring_prefers_sender_and_amount_match() {
        let other_donor = addr("0x2222222222222222222222222222222222222222");
        // Two transfers to the project; only the second matches the claim.
        let logs = vec![
            transfer_log(addr(TOKEN), other_donor, addr(PROJECT), U256::from(1_000_000u64)),
            transfer_log(addr(TOKEN), addr(DONOR), addr(PROJECT), U256::from(12_500_000u64)),
        ];

        let fact =
            entry_point_fact(&intent(), &context(&logs), &token_info(), addr(TOKEN)).unwrap();
        assert!(same_address(&fact.from, DONOR));
        assert!((fact.amount - 12.5).abs() < 1e-12);
    }

    #[test]
    fn entry_point_without_matching_log_is_not_found() {
        let logs = vec![transfer_log(
            addr(TOKEN),
            addr(DONOR),
            addr("0x1111111111111111111111111111111111111111"),
            U256::from(12_500_000u64),
        )];

        let result = entry_point_fact(&intent(), &context(&logs), &token_info(), addr(TOKEN));
        assert!(matches!(result, Err(VerificationError::NotFound { .. })));
    }

    #[test]
    fn safe_execution_reads_the_second_decoded_transfer() {
        let safe = addr("0x3333333333333333333333333333333333333333");
        let logs = vec![
            transfer_log(addr(TOKEN), safe, addr(DONOR), U256::from(1u64)),
            transfer_log(addr(TOKEN), safe, addr(PROJECT), U256::from(12_500_000u64)),
        ];

        let fact = safe_fact(&context(&logs), Some(safe), &token_info(), addr(TOKEN)).unwrap();
        assert!(same_address(&fact.from, &safe.to_string()));
        assert!(same_address(&fact.to, PROJECT));
        assert!((fact.amount - 12.5).abs() < 1e-12);
    }

    #[test]
    fn safe_execution_with_a_single_transfer_uses_it() {
        let safe = addr("0x3333333333333333333333333333333333333333");
        let logs = vec![transfer_log(
            addr(TOKEN),
            safe,
            addr(PROJECT),
            U256::from(12_500_000u64),
        )];

        let fact = safe_fact(&context(&logs), Some(safe), &token_info(), addr(TOKEN)).unwrap();
        assert!(same_address(&fact.from, &safe.to_string()));
        assert!(same_address(&fact.to, PROJECT));
        assert!((fact.amount - 12.5).abs() < 1e-12);
    }

    #[test]
    fn safe_execution_on_wrong_token_is_a_currency_mismatch() {
        let other_token = addr("0x4444444444444444444444444444444444444444");
        let logs = vec![transfer_log(
            other_token,
            addr(DONOR),
            addr(PROJECT),
            U256::from(12_500_000u64),
        )];

        let result = safe_fact(&context(&logs), None, &token_info(), addr(TOKEN));
        assert!(matches!(
            result,
            Err(VerificationError::CurrencyMismatch { .. })
        ));
    }

    #[test]
    fn disperse_fans_out_one_fact_per_recognized_transfer() {
        let unknown_token = addr("0x4444444444444444444444444444444444444444");
        let recipients = [
            addr(PROJECT),
            addr("0x1111111111111111111111111111111111111111"),
            addr("0x2222222222222222222222222222222222222222"),
        ];

        let mut logs: Vec<Log> = recipients
            .iter()
            .map(|to| transfer_log(addr(TOKEN), addr(DONOR), *to, U256::from(2_000_000u64)))
            .collect();
        logs.push(transfer_log(
            unknown_token,
            addr(DONOR),
            addr(PROJECT),
            U256::from(5u64),
        ));

        let registry = usdc(100);
        let facts = batch_facts(&registry, 100, &context(&logs)).unwrap();

        assert_eq!(facts.len(), 3);
        for (fact, to) in facts.iter().zip(recipients) {
            assert!(same_address(&fact.to, &to.to_string()));
            assert!((fact.amount - 2.0).abs() < 1e-12);
            assert_eq!(fact.currency, "USDC");
            assert_eq!(fact.nonce, Some(7));
        }
    }

    #[test]
    fn safe_received_logs_are_collected_from_the_receipt() {
        let safe = addr(PROJECT);
        let logs = vec![Log {
            inner: alloy::primitives::Log {
                address: safe,
                data: SafeReceived {
                    sender: addr(DONOR),
                    value: U256::from(1u64),
                }
                .encode_log_data(),
            },
            ..Default::default()
        }];

        let received = context(&logs).safe_received_addresses();
        assert_eq!(received, vec![PROJECT.to_string()]);
    }
}
