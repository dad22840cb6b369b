//! The validation contract: a pure comparison of what happened on-chain
//! against what the donation claims, identical for every chain family.

use verifier_core::constants::{AMOUNT_RELATIVE_TOLERANCE, TRANSACTION_AGE_GRACE_SECS};
use verifier_core::donation::{same_address, DonationIntent, TransactionFact};
use verifier_core::error::VerificationError;

/// Relative amount comparison. Absolute tolerances do not work across
/// donations spanning nine orders of magnitude, so the ratio is compared.
pub fn close_to(actual: f64, expected: f64) -> bool {
    (1.0 - actual / expected).abs() < AMOUNT_RELATIVE_TOLERANCE
}

pub fn validate(fact: &TransactionFact, intent: &DonationIntent) -> Result<(), VerificationError> {
    if !same_address(&fact.to, &intent.to_address) {
        return Err(VerificationError::ToAddressMismatch {
            expected: intent.to_address.clone(),
            actual: fact.to.clone(),
        });
    }

    if intent.is_swap {
        // A swap routes through a router contract, so the sender is the
        // router, not the donor. The Safe at the donation address vouching
        // for receipt is the evidence instead.
        if !fact
            .safe_received_at
            .iter()
            .any(|address| same_address(address, &intent.to_address))
        {
            return Err(VerificationError::SwapToAddressMismatch {
                expected: intent.to_address.clone(),
            });
        }
    } else if !same_address(&fact.from, &intent.from_address) {
        return Err(VerificationError::FromAddressMismatch {
            expected: intent.from_address.clone(),
            actual: fact.from.clone(),
        });
    }

    if !close_to(fact.amount, intent.amount) {
        return Err(VerificationError::AmountMismatch {
            expected: intent.amount,
            actual: fact.amount,
        });
    }

    // Imported donations (backups, matched drafts) reference transactions
    // that legitimately predate the record.
    if !intent.imported {
        let donation_secs = intent.created_at.timestamp();
        if donation_secs - fact.timestamp_secs as i64 > TRANSACTION_AGE_GRACE_SECS as i64 {
            return Err(VerificationError::TransactionOlderThanDonation {
                tx_timestamp_secs: fact.timestamp_secs,
                donation_timestamp_secs: donation_secs,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use verifier_core::donation::ChainType;

    use super::*;

    fn intent() -> DonationIntent {
        DonationIntent {
            donation_id: 1,
            transaction_id: "0xf00d".into(),
            safe_transaction_id: None,
            network_id: 1,
            chain_type: ChainType::Evm,
            from_address: "0x6e8873085530406995170da467010565968c7c62".into(),
            to_address: "0x5ac583feb2b1f288c0a51d6cdca2e8c814bfe93b".into(),
            amount: 0.04,
            currency: "ETH".into(),
            nonce: None,
            is_swap: false,
            imported: false,
            created_at: Utc.timestamp_opt(1_712_250_000, 0).unwrap(),
        }
    }

    fn fact() -> TransactionFact {
        TransactionFact {
            hash: "0xf00d".into(),
            from: "0x6E8873085530406995170Da467010565968C7C62".into(),
            to: "0x5Ac583Feb2b1f288C0A51d6Cdca2e8c814BFE93B".into(),
            amount: 0.04,
            currency: "ETH".into(),
            timestamp_secs: 1_712_250_010,
            nonce: None,
            safe_received_at: Vec::new(),
        }
    }

    #[test]
    fn accepts_matching_transfer_despite_checksum_casing() {
        assert!(validate(&fact(), &intent()).is_ok());
    }

    #[test]
    fn close_to_tolerance_boundary() {
        assert!(close_to(1000.1, 1000.0));
        assert!(!close_to(0.0008436, 0.0008658));
        assert!(close_to(0.04, 0.04));
        assert!(!close_to(0.05, 0.04));
    }

    #[test]
    fn rejects_wrong_recipient() {
        let mut fact = fact();
        fact.to = "0x0000000000000000000000000000000000000001".into();
        assert!(matches!(
            validate(&fact, &intent()),
            Err(VerificationError::ToAddressMismatch { .. })
        ));
    }

    #[test]
    fn rejects_wrong_sender() {
        let mut fact = fact();
        fact.from = "0x0000000000000000000000000000000000000001".into();
        assert!(matches!(
            validate(&fact, &intent()),
            Err(VerificationError::FromAddressMismatch { .. })
        ));
    }

    #[test]
    fn rejects_amount_outside_tolerance() {
        let mut fact = fact();
        fact.amount = 0.041;
        assert!(matches!(
            validate(&fact, &intent()),
            Err(VerificationError::AmountMismatch { .. })
        ));
    }

    #[test]
    fn swap_ignores_sender_but_requires_safe_received_evidence() {
        let mut intent = intent();
        intent.is_swap = true;

        let mut fact = fact();
        fact.from = "0x1111111111111111111111111111111111111111".into();
        assert!(matches!(
            validate(&fact, &intent),
            Err(VerificationError::SwapToAddressMismatch { .. })
        ));

        fact.safe_received_at = vec![intent.to_address.clone()];
        assert!(validate(&fact, &intent).is_ok());
    }

    #[test]
    fn rejects_transaction_much_older_than_donation() {
        let mut fact = fact();
        fact.timestamp_secs = 1_712_250_000 - 7200;
        assert!(matches!(
            validate(&fact, &intent()),
            Err(VerificationError::TransactionOlderThanDonation { .. })
        ));
    }

    #[test]
    fn imported_donation_bypasses_age_check() {
        let mut intent = intent();
        intent.imported = true;
        let mut fact = fact();
        fact.timestamp_secs = 1_712_250_000 - 86_400;
        assert!(validate(&fact, &intent).is_ok());
    }

    #[test]
    fn transaction_newer_than_donation_is_fine() {
        let mut fact = fact();
        fact.timestamp_secs = 1_712_250_000 + 600;
        assert!(validate(&fact, &intent()).is_ok());
    }
}
