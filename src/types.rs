#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a bridge transaction row.
///
/// Monotonic except for the payout attempt: 0 -> 90 -> {0|95|97|98|99}.
/// Once a row reaches 90 it is "in operation" and no other writer may
/// rebuild it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum BridgeStatus {
    /// Created by the source sweep, awaiting payout.
    Created = 0,
    /// DB lock held, payout being attempted.
    ReadyPaid = 90,
    /// Broadcast accepted, awaiting receipt.
    PaidSuccess = 95,
    /// Broadcast landed but the transaction reverted on chain.
    OnchainFailed = 97,
    /// Broadcast crashed after a possible side effect.
    PaidCrash = 98,
    /// Destination transfer matched; the row is closed.
    BridgeSuccess = 99,
}

impl BridgeStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(BridgeStatus::Created),
            90 => Some(BridgeStatus::ReadyPaid),
            95 => Some(BridgeStatus::PaidSuccess),
            97 => Some(BridgeStatus::OnchainFailed),
            98 => Some(BridgeStatus::PaidCrash),
            99 => Some(BridgeStatus::BridgeSuccess),
            _ => None,
        }
    }

    /// Statuses the destination sweep may still close.
    ///
    /// 95 is included: a broadcast-accepted row whose receipt was never
    /// observed must close when the maker's outbound transfer shows up.
    pub fn closable() -> [i16; 4] {
        [
            BridgeStatus::Created.as_i16(),
            BridgeStatus::PaidSuccess.as_i16(),
            BridgeStatus::OnchainFailed.as_i16(),
            BridgeStatus::PaidCrash.as_i16(),
        ]
    }
}

impl fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i16())
    }
}

/// Matcher progress marker on a transfer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum OpStatus {
    Unprocessed = 0,
    SourceBuilt = 1,
    /// Evaluation error sentinel; the row is skipped by later sweeps.
    Error = 9,
    Matched = 99,
}

impl OpStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// On-chain confirmation state of an ingested transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum TransferStatus {
    Pending = 0,
    Success = 2,
    Failed = 3,
}

impl TransferStatus {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Bridge protocol dialect, derived from the transfer `version` field.
///
/// `-0` suffixed versions are user->maker deposits (source side), `-1` are
/// maker->user payouts (destination side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeVersion {
    V1,
    V2,
}

impl BridgeVersion {
    pub fn from_version_str(version: &str) -> Option<Self> {
        match version.split('-').next() {
            Some("1") => Some(BridgeVersion::V1),
            Some("2") => Some(BridgeVersion::V2),
            _ => None,
        }
    }

    /// The source-side (user->maker) version string for this dialect.
    pub fn source_version(self) -> &'static str {
        match self {
            BridgeVersion::V1 => "1-0",
            BridgeVersion::V2 => "2-0",
        }
    }

    /// The destination-side (maker->user) version string for this dialect.
    pub fn dest_version(self) -> &'static str {
        match self {
            BridgeVersion::V1 => "1-1",
            BridgeVersion::V2 => "2-1",
        }
    }
}

/// Normalize an address for identity comparisons: trimmed and lowercased.
///
/// Everything keyed by address (response makers, the per-sender mutex map,
/// nonce managers) goes through this.
pub fn normalize_address(addr: &str) -> String {
    addr.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_status_roundtrip() {
        for s in [
            BridgeStatus::Created,
            BridgeStatus::ReadyPaid,
            BridgeStatus::PaidSuccess,
            BridgeStatus::OnchainFailed,
            BridgeStatus::PaidCrash,
            BridgeStatus::BridgeSuccess,
        ] {
            assert_eq!(BridgeStatus::from_i16(s.as_i16()), Some(s));
        }
        assert_eq!(BridgeStatus::from_i16(96), None);
    }

    #[test]
    fn test_closable_includes_paid_success() {
        assert!(BridgeStatus::closable().contains(&95));
        assert!(!BridgeStatus::closable().contains(&90));
        assert!(!BridgeStatus::closable().contains(&99));
    }

    #[test]
    fn test_version_dispatch() {
        assert_eq!(BridgeVersion::from_version_str("1-0"), Some(BridgeVersion::V1));
        assert_eq!(BridgeVersion::from_version_str("2-1"), Some(BridgeVersion::V2));
        assert_eq!(BridgeVersion::from_version_str("3-0"), None);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(" 0xABcD00000000000000000000000000000000EF12 "),
            "0xabcd00000000000000000000000000000000ef12"
        );
    }
}
