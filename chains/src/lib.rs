//! Chain-family transaction resolution. One resolver per chain family, all
//! normalizing into [`TransactionFact`], selected once at the entry point by
//! the intent's chain type.

pub mod evm;
pub mod solana;
pub mod stellar;
pub mod validate;

use std::sync::Arc;

use verifier_core::chain::ChainRegistry;
use verifier_core::donation::{ChainType, DonationIntent, TransactionFact};
use verifier_core::error::VerificationError;
use verifier_core::tokens::TokenService;

/// Capability to confirm a donation claim against actual ledger state.
///
/// `resolve` produces exactly one fact; `resolve_batch` is the disperse /
/// airdrop shape where one physical transaction fans out into one fact per
/// recognized token transfer.
pub trait TransactionResolver: Send + Sync {
    fn resolve(
        &self,
        intent: &DonationIntent,
    ) -> impl Future<Output = Result<TransactionFact, VerificationError>> + Send;

    fn resolve_batch(
        &self,
        intent: &DonationIntent,
    ) -> impl Future<Output = Result<Vec<TransactionFact>, VerificationError>> + Send;
}

pub struct ChainResolver {
    evm: evm::EvmResolver,
    solana: solana::SolanaResolver,
    stellar: stellar::StellarResolver,
}

impl ChainResolver {
    pub fn new(chains: Arc<ChainRegistry>, tokens: Arc<dyn TokenService>) -> Self {
        Self {
            evm: evm::EvmResolver::new(chains.clone(), tokens.clone()),
            solana: solana::SolanaResolver::new(chains.clone(), tokens),
            stellar: stellar::StellarResolver::new(chains),
        }
    }
}

impl TransactionResolver for ChainResolver {
    async fn resolve(
        &self,
        intent: &DonationIntent,
    ) -> Result<TransactionFact, VerificationError> {
        match intent.chain_type {
            ChainType::Evm => self.evm.resolve(intent).await,
            ChainType::Solana => self.solana.resolve(intent).await,
            ChainType::Stellar => self.stellar.resolve(intent).await,
        }
    }

    async fn resolve_batch(
        &self,
        intent: &DonationIntent,
    ) -> Result<Vec<TransactionFact>, VerificationError> {
        match intent.chain_type {
            ChainType::Evm => self.evm.resolve_batch(intent).await,
            // No batch-disbursement contract pattern exists on these chains;
            // a batch request degenerates to a single fact.
            ChainType::Solana | ChainType::Stellar => Ok(vec![self.resolve(intent).await?]),
        }
    }
}
