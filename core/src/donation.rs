use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VerificationError;

/// Chain family a donation settles on. Dispatch happens exactly once, at the
/// resolver entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainType {
    Evm,
    Solana,
    Stellar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DonationStatus {
    Pending,
    Verified,
    Failed,
}

impl DonationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DonationStatus::Verified | DonationStatus::Failed)
    }
}

/// The claim under verification, owned by the CRUD layer and read-only here.
///
/// `transaction_id` is the lower-cased claimed hash; it may be empty while a
/// Gnosis Safe approval has not executed yet, in which case
/// `safe_transaction_id` carries the Safe message hash used to resolve it
/// lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationIntent {
    pub donation_id: u64,
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_transaction_id: Option<String>,
    pub network_id: u64,
    pub chain_type: ChainType,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    pub is_swap: bool,
    /// Set for backup-import and draft-matching donations; bypasses the
    /// temporal ordering check.
    pub imported: bool,
    /// Donation record creation time, not transaction time.
    pub created_at: DateTime<Utc>,
}

/// What actually happened on-chain, in one canonical shape across all chain
/// families. Produced whole or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFact {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub currency: String,
    pub timestamp_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Contract addresses that emitted a Gnosis `SafeReceived` log in the
    /// same receipt. Evidence for the swap-router validation branch; empty
    /// for non-EVM facts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safe_received_at: Vec<String>,
}

/// State transition the verification run decided on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum VerificationOutcome {
    Verified {
        fact: TransactionFact,
        /// True iff the resolved hash differs from the claimed one; the
        /// stored hash is then superseded (never deleted).
        speedup_detected: bool,
    },
    StillPending,
    Failed {
        reason: VerificationError,
    },
}

/// Case-insensitive address equality, shared by every chain family.
/// EVM addresses differ only in checksum casing; Solana and Stellar keys are
/// case-sensitive in principle but never differ only by case in practice.
pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
