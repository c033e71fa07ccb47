#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Note: We use String for amount fields to avoid BigDecimal/sqlx version conflicts.
// The database stores raw amounts as NUMERIC(78,0) and display amounts as
// NUMERIC(78,18). When inserting, we cast text to NUMERIC in the SQL query
// (e.g., $1::NUMERIC); when reading, the query casts NUMERIC to TEXT.

/// A decoded on-chain transfer, written by the external ingester.
///
/// `value` is the raw integer that carries the security code; `amount` is
/// the display-decimal form. Versions `1-0`/`2-0` are user->maker deposits,
/// `1-1`/`2-1` maker->user payouts.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub hash: String,
    pub chain_id: String,
    pub sender: String,
    pub receiver: String,
    pub token: String,
    pub symbol: String,
    pub amount: String,
    pub value: String,
    pub nonce: i64,
    pub timestamp: DateTime<Utc>,
    pub fee_amount: Option<String>,
    pub fee_token: Option<String>,
    pub version: String,
    /// V1 swap calldata (cross-address recipient), when present
    pub calldata: Option<String>,
    pub status: i16,
    pub op_status: i16,
}

/// The durable match record between a deposit and its payout obligation.
///
/// Logical identity is `(source_chain, source_id)`; `target_id` is set iff a
/// broadcast was attempted and may point at a failed transaction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BridgeTransaction {
    pub id: i64,
    pub source_chain: String,
    pub source_id: String,
    pub source_address: String,
    pub source_maker: String,
    pub source_amount: String,
    pub source_symbol: String,
    pub source_token: String,
    pub source_nonce: i64,
    pub source_time: DateTime<Utc>,
    pub target_chain: String,
    pub target_id: Option<String>,
    pub target_address: String,
    pub target_amount: String,
    pub target_symbol: String,
    pub target_token: String,
    pub target_maker: Option<String>,
    pub target_time: Option<DateTime<Utc>>,
    pub target_nonce: Option<i64>,
    pub target_fee: Option<String>,
    pub target_fee_symbol: Option<String>,
    pub rule_id: Option<String>,
    pub ebc_address: Option<String>,
    pub dealer_address: Option<String>,
    pub withholding_fee: Option<String>,
    pub trade_fee: Option<String>,
    /// Addresses permitted to fulfill; always contains the deposit receiver
    pub response_maker: Vec<String>,
    pub status: i16,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For upserting bridge transactions from the source sweep
#[derive(Debug, Clone)]
pub struct NewBridgeTransaction {
    pub source_chain: String,
    pub source_id: String,
    pub source_address: String,
    pub source_maker: String,
    pub source_amount: String,
    pub source_symbol: String,
    pub source_token: String,
    pub source_nonce: i64,
    pub source_time: DateTime<Utc>,
    pub target_chain: String,
    pub target_address: String,
    pub target_amount: String,
    pub target_symbol: String,
    pub target_token: String,
    pub rule_id: Option<String>,
    pub ebc_address: Option<String>,
    pub dealer_address: Option<String>,
    pub withholding_fee: Option<String>,
    pub trade_fee: Option<String>,
    pub response_maker: Vec<String>,
    pub version: String,
}

/// Fields written when the destination sweep closes a bridge row
#[derive(Debug, Clone)]
pub struct BridgeClose {
    pub target_id: String,
    pub target_time: DateTime<Utc>,
    pub target_nonce: i64,
    pub target_maker: String,
    pub target_fee: Option<String>,
    pub target_fee_symbol: Option<String>,
}

/// Durable record that a broadcast was attempted for a source deposit
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SerialRelation {
    pub id: i64,
    pub source_id: String,
    pub target_tx_hash: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}
