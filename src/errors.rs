//! Error taxonomy for wallet operations.
//!
//! Lock-contention and timeout errors may be retried locally with bounded
//! backoff. `AlreadySpent` and `SpendRejected` are terminal for the attempt
//! and never retried automatically: a silently retried spend can leave the
//! wallet unsure whether a serial was consumed.

use thiserror::Error;

/// Rejection reasons surfaced by the consensus/validation layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientConfirmations,
    SerialAlreadySpent,
    StaleAccumulator,
    BelowDustThreshold,
    ShieldedDisabled,
    Other(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::InsufficientConfirmations => write!(f, "insufficient confirmations"),
            RejectReason::SerialAlreadySpent => write!(f, "serial already spent on-chain"),
            RejectReason::StaleAccumulator => write!(f, "accumulator snapshot is stale"),
            RejectReason::BelowDustThreshold => write!(f, "amount below dust threshold"),
            RejectReason::ShieldedDisabled => {
                write!(f, "shielded functionality is not enabled on the network yet")
            }
            RejectReason::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("serial already spent")]
    AlreadySpent,

    #[error("spend rejected by network: {0}")]
    SpendRejected(RejectReason),

    #[error("resource busy: a concurrent operation holds the lock")]
    Busy,

    #[error("operation timed out")]
    TimedOut,

    #[error("no responsive coordinator available")]
    PeerUnavailable,

    #[error("amount {0} does not match any supported denomination")]
    InvalidDenomination(u64),

    #[error("proof built against an outdated accumulator snapshot")]
    AccumulatorStale,

    #[error("anonymity set too small: only {0} commitments accumulated")]
    AnonymitySetTooSmall(usize),

    #[error("wallet is locked; unlock it first")]
    Locked,

    #[error("coordinator returned a tampered proposal: {0}")]
    ProposalTampered(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for WalletError {
    fn from(e: bincode::Error) -> Self {
        WalletError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_messages_are_specific() {
        let msg = WalletError::SpendRejected(RejectReason::SerialAlreadySpent).to_string();
        assert!(msg.contains("serial already spent"));

        let msg = WalletError::SpendRejected(RejectReason::ShieldedDisabled).to_string();
        assert!(msg.contains("not enabled"));
    }

    #[test]
    fn invalid_denomination_carries_amount() {
        let msg = WalletError::InvalidDenomination(12345).to_string();
        assert!(msg.contains("12345"));
    }
}
