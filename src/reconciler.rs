//! Startup reconciliation of interrupted payouts.
//!
//! A crash between broadcast and commit leaves bridge rows at READY_PAID.
//! The serial relation is the recovery anchor: with one, a broadcast was
//! attempted and the row moves forward to PAID_SUCCESS (or ONCHAIN_FAILED
//! when the chain reports a revert); without one, nothing ever left the
//! process and the row returns to payable.

#![allow(dead_code)]

use eyre::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::account::AccountManager;
use crate::db;
use crate::rules::TokenRegistry;
use crate::store::{PayoutTask, Store};
use crate::types::BridgeStatus;

pub async fn reconcile_on_startup(
    db: &PgPool,
    store: &Arc<Store>,
    accounts: &AccountManager,
    tokens: &TokenRegistry,
) -> Result<()> {
    let stuck = db::get_bridges_by_status(db, BridgeStatus::ReadyPaid.as_i16()).await?;
    if !stuck.is_empty() {
        warn!(count = stuck.len(), "Found bridge rows stuck at READY_PAID");
    }

    for bridge in stuck {
        match db::get_serial(db, &bridge.source_id).await? {
            None => {
                // No anchor: the broadcast never happened.
                db::reconcile_bridge_status(db, bridge.id, BridgeStatus::Created.as_i16(), None)
                    .await?;
                info!(
                    bridge_id = bridge.id,
                    source_id = %bridge.source_id,
                    "Reset interrupted payout to payable (no serial anchor)"
                );
            }
            Some(serial) => {
                // A broadcast was attempted; consult the chain best-effort
                // for the recorded hash.
                let account = accounts
                    .get(&bridge.target_chain, &serial.sender)
                    .or_else(|| accounts.resolve(&bridge.target_chain, &bridge.response_maker));
                let to_status = match account {
                    Some(account) => {
                        match account.check_transaction_receipt(&serial.target_tx_hash).await {
                            Ok(Some(receipt)) if !receipt.success => {
                                BridgeStatus::OnchainFailed.as_i16()
                            }
                            Ok(_) => BridgeStatus::PaidSuccess.as_i16(),
                            Err(e) => {
                                warn!(
                                    bridge_id = bridge.id,
                                    error = %e,
                                    "Receipt probe failed, assuming broadcast accepted"
                                );
                                BridgeStatus::PaidSuccess.as_i16()
                            }
                        }
                    }
                    None => BridgeStatus::PaidSuccess.as_i16(),
                };
                db::reconcile_bridge_status(db, bridge.id, to_status, Some(&serial.target_tx_hash))
                    .await?;
                info!(
                    bridge_id = bridge.id,
                    source_id = %bridge.source_id,
                    target_id = %serial.target_tx_hash,
                    status = to_status,
                    "Recovered interrupted payout from serial anchor"
                );
                // The destination sweep closes the row once the payout
                // transfer is ingested.
            }
        }
    }

    // Payable rows survive restarts in the DB only; rebuild the in-flight
    // queue for the sequencer.
    let payable = db::get_bridges_by_status(db, BridgeStatus::Created.as_i16()).await?;
    let mut requeued = 0usize;
    for bridge in payable {
        if db::serial_exists(db, &bridge.source_id).await? {
            continue;
        }
        store.add_transaction(PayoutTask::from_bridge(&bridge, tokens));
        requeued += 1;
    }
    if requeued > 0 {
        info!(requeued, "Requeued payable bridge rows");
    }

    Ok(())
}
