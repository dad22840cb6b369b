use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The full verification error taxonomy. Every kind is typed so the queue
/// can decide retry-vs-terminal mechanically, without matching on message
/// strings.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationError {
    /// Transaction exists but is not yet mined, or its receipt is not yet
    /// available. Retried on a later cycle.
    #[error("transaction not yet mined or receipt unavailable")]
    Pending,

    /// Transaction was mined but reverted. Terminal.
    #[error("transaction {hash} reverted on-chain")]
    OnChainFailure { hash: String },

    /// The transaction's recipient is not the expected token contract, so it
    /// cannot be a transfer of the claimed currency. Terminal.
    #[error("transaction recipient {tx_to} is not the {symbol} token contract {token_address}")]
    CurrencyMismatch {
        tx_to: String,
        token_address: String,
        symbol: String,
    },

    /// No token configured for the claimed (network, symbol). Terminal.
    #[error("no token configured for symbol {symbol} on network {network_id}")]
    UnrecognizedToken { network_id: u64, symbol: String },

    /// Direct hash lookup missed. Transient within the grace window.
    #[error("transaction {hash} not found")]
    NotFound { hash: String },

    /// The claimed nonce is below everything in the sender's history, so it
    /// was never consumed on this chain. Terminal.
    #[error("nonce {nonce} was never used by {address}")]
    NotFoundInHistory { address: String, nonce: u64 },

    /// The sender's transaction count passed the claimed nonce, but no
    /// matching transaction exists: the nonce was consumed by something
    /// else and the claim is stale. Terminal.
    #[error("nonce {nonce} of {address} was consumed by a different transaction")]
    NonceAlreadyUsed { address: String, nonce: u64 },

    #[error("transfer recipient {actual} does not match donation recipient {expected}")]
    ToAddressMismatch { expected: String, actual: String },

    #[error("transfer sender {actual} does not match donation sender {expected}")]
    FromAddressMismatch { expected: String, actual: String },

    /// Swap donation without a `SafeReceived` log at the donation recipient.
    #[error("no SafeReceived evidence at {expected} for swap donation")]
    SwapToAddressMismatch { expected: String },

    #[error("transfer amount {actual} outside tolerance of declared {expected}")]
    AmountMismatch { expected: f64, actual: f64 },

    /// The chain transaction predates the donation record by more than the
    /// allowed clock-skew grace. Terminal.
    #[error("transaction at {tx_timestamp_secs} predates donation recorded at {donation_timestamp_secs}")]
    TransactionOlderThanDonation {
        tx_timestamp_secs: u64,
        donation_timestamp_secs: i64,
    },

    /// JSON-RPC / transport failure. Transient.
    #[error("RPC error on network {network_id}: {message}")]
    Rpc { network_id: u64, message: String },

    /// Block-explorer API failure. Transient.
    #[error("explorer error on network {network_id}: {message}")]
    Explorer { network_id: u64, message: String },

    /// Missing or inconsistent registry/chain configuration. Terminal: a
    /// config problem never fixes itself by retrying the donation.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl VerificationError {
    /// Terminal errors flip the donation to `failed`; everything else leaves
    /// it `pending` for a later cycle.
    pub fn is_terminal(&self) -> bool {
        match self {
            VerificationError::OnChainFailure { .. }
            | VerificationError::CurrencyMismatch { .. }
            | VerificationError::UnrecognizedToken { .. }
            | VerificationError::NotFoundInHistory { .. }
            | VerificationError::NonceAlreadyUsed { .. }
            | VerificationError::ToAddressMismatch { .. }
            | VerificationError::FromAddressMismatch { .. }
            | VerificationError::SwapToAddressMismatch { .. }
            | VerificationError::AmountMismatch { .. }
            | VerificationError::TransactionOlderThanDonation { .. }
            | VerificationError::Config { .. } => true,

            VerificationError::Pending
            | VerificationError::NotFound { .. }
            | VerificationError::Rpc { .. }
            | VerificationError::Explorer { .. }
            | VerificationError::Internal { .. } => false,
        }
    }
}

/// Conversion seam for alloy transport errors, in the style of the engine's
/// `AlloyRpcErrorToEngineError`.
pub trait AlloyRpcErrorExt {
    fn to_verification_error(&self, network_id: u64) -> VerificationError;
}

impl AlloyRpcErrorExt for AlloyRpcError<TransportErrorKind> {
    fn to_verification_error(&self, network_id: u64) -> VerificationError {
        VerificationError::Rpc {
            network_id,
            message: self.to_string(),
        }
    }
}

pub trait ReqwestErrorExt {
    fn to_explorer_error(self, network_id: u64) -> VerificationError;
    fn to_rpc_error(self, network_id: u64) -> VerificationError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn to_explorer_error(self, network_id: u64) -> VerificationError {
        VerificationError::Explorer {
            network_id,
            message: self.to_string(),
        }
    }

    fn to_rpc_error(self, network_id: u64) -> VerificationError {
        VerificationError::Rpc {
            network_id,
            message: self.to_string(),
        }
    }
}
