//! Error taxonomy for the payout state machine and the rule evaluator.
//!
//! Three kinds drive the sequencer: a *before* error means the broadcast
//! cannot possibly have landed on chain (the bridge row stays at 0 and the
//! in-flight entry is restored), an *ignore* error is a precondition
//! violation that must never retry, and everything else after signing is an
//! *after* error (the row moves to PAID_CRASH, nothing is rolled back).

use thiserror::Error;

/// Errors raised while sending a payout.
#[derive(Debug, Error)]
pub enum SendError {
    /// Observed before the broadcast could have had a side effect:
    /// validation, balance, stale nonce, fee failure. Safe to retry on the
    /// next sweep.
    #[error("send aborted before broadcast: {0}")]
    Before(String),

    /// Precondition violation that must not retry (already paid, wrong
    /// status). The in-flight entry is dropped silently.
    #[error("send ignored: {0}")]
    Ignore(String),

    /// The broadcast may have landed on chain. The bridge row is marked
    /// PAID_CRASH with the best-known tx hash; nothing is rolled back.
    #[error("send failed after broadcast: {0}")]
    After(String),
}

impl SendError {
    pub fn before(msg: impl Into<String>) -> Self {
        SendError::Before(msg.into())
    }

    pub fn ignore(msg: impl Into<String>) -> Self {
        SendError::Ignore(msg.into())
    }

    pub fn after(msg: impl Into<String>) -> Self {
        SendError::After(msg.into())
    }

    /// Whether the in-flight rollback thunk may be invoked for this error.
    pub fn is_before(&self) -> bool {
        matches!(self, SendError::Before(_))
    }
}

/// Errors raised while deriving a payout from a source deposit.
///
/// All of these are recoverable from the matcher's point of view: the
/// transfer gets the op_status error sentinel and the sweep continues.
#[derive(Debug, Error, PartialEq)]
pub enum EvaluateError {
    /// Security code malformed, or source nonce above the 4-digit range.
    #[error("invalid security code: {0}")]
    SecurityCodeInvalid(String),

    /// No dealer/ebc/chain mapping, or no rule for the chain/symbol pair.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// Derived response amount outside the rule's price range.
    #[error("amount out of range: {0}")]
    AmountOutOfRange(String),

    /// Token unknown to the registry on either side.
    #[error("token not found: {0}")]
    TokenNotFound(String),
}

/// Classes of broadcast-layer errors, matched on provider error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorClass {
    /// The vended nonce is already spent on chain. Surfaces as a before
    /// error so the sequencer rolls back and the nonce manager refreshes.
    NonceExpired,
    /// Definitely rejected at the node before inclusion.
    Rejected,
    /// Anything else; assume the tx may have landed.
    Unknown,
}

/// Classify a broadcast error string.
///
/// Mirrors the node error vocabulary: geth says "nonce too low", erigon
/// "invalid nonce", ethers-era stacks tag NONCE_EXPIRED.
pub fn classify_send_error(error: &str) -> SendErrorClass {
    let e = error.to_lowercase();

    if e.contains("nonce_expired")
        || e.contains("nonce too low")
        || e.contains("invalid nonce")
        || e.contains("already known")
    {
        return SendErrorClass::NonceExpired;
    }

    if e.contains("insufficient funds")
        || e.contains("exceeds block gas limit")
        || e.contains("intrinsic gas too low")
        || e.contains("transaction underpriced")
    {
        return SendErrorClass::Rejected;
    }

    SendErrorClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_nonce_expired() {
        assert_eq!(
            classify_send_error("NONCE_EXPIRED: tx dropped"),
            SendErrorClass::NonceExpired
        );
        assert_eq!(
            classify_send_error("nonce too low: next nonce 42"),
            SendErrorClass::NonceExpired
        );
    }

    #[test]
    fn test_classify_rejected() {
        assert_eq!(
            classify_send_error("insufficient funds for gas * price + value"),
            SendErrorClass::Rejected
        );
        assert_eq!(
            classify_send_error("replacement transaction underpriced"),
            SendErrorClass::Rejected
        );
    }

    #[test]
    fn test_classify_unknown_is_conservative() {
        assert_eq!(
            classify_send_error("connection reset by peer"),
            SendErrorClass::Unknown
        );
    }

    #[test]
    fn test_before_error_allows_rollback() {
        assert!(SendError::before("balance").is_before());
        assert!(!SendError::ignore("already paid").is_before());
        assert!(!SendError::after("rpc died mid-send").is_before());
    }
}
