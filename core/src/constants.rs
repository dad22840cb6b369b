use alloy::primitives::{Address, address};

/// ERC-4337 EntryPoint v0.6 singleton.
pub const ENTRY_POINT_V06: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

/// ERC-4337 EntryPoint v0.7 singleton.
pub const ENTRY_POINT_V07: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

pub const NATIVE_TOKEN_DECIMALS: u8 = 18;

/// Relative amount tolerance for the validation contract: the resolved
/// on-chain amount must satisfy |1 - fact/claimed| < this value.
pub const AMOUNT_RELATIVE_TOLERANCE: f64 = 0.001;

/// A chain transaction may predate its donation record by at most this much
/// (clock skew between the chain and the platform).
pub const TRANSACTION_AGE_GRACE_SECS: u64 = 3600;
