//! The matcher: periodic sweeps that turn raw transfers into bridge rows
//! and close them when the maker's outbound payout appears.
//!
//! Each protocol version runs two independent sweeps. The source sweep
//! derives payout obligations from confirmed deposits; the destination
//! sweep pairs maker->user transfers with their obligation, first through
//! the memory cache, then the DB.

#![allow(dead_code)]

pub mod cache;

use eyre::Result;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::{self, BridgeClose, NewBridgeTransaction, Transfer};
use crate::metrics;
use crate::rules::evaluator::{EvaluatedPayout, RuleEvaluator};
use crate::rules::TokenRegistry;
use crate::store::{PayoutTask, Store};
use crate::types::{normalize_address, BridgeStatus, BridgeVersion, OpStatus, TransferStatus};
use cache::{CachedBridge, CachedDest, MatchKey, MemoryMatchCache};

/// Sweep cadence and batch limits per protocol version.
#[derive(Debug, Clone, Copy)]
pub struct SweepSchedule {
    pub source_interval: Duration,
    pub dest_interval: Duration,
    pub source_batch: i64,
    pub dest_batch: i64,
}

impl SweepSchedule {
    pub fn for_version(version: BridgeVersion) -> Self {
        match version {
            BridgeVersion::V1 => SweepSchedule {
                source_interval: Duration::from_secs(5 * 60),
                dest_interval: Duration::from_secs(7 * 60),
                source_batch: 500,
                dest_batch: 500,
            },
            BridgeVersion::V2 => SweepSchedule {
                source_interval: Duration::from_secs(3 * 60),
                dest_interval: Duration::from_secs(6 * 60),
                source_batch: 1000,
                dest_batch: 1000,
            },
        }
    }
}

/// Shared sweep implementation for both versions.
pub struct Matcher {
    db: PgPool,
    evaluator: Arc<RuleEvaluator>,
    cache: Arc<MemoryMatchCache>,
    store: Arc<Store>,
    tokens: Arc<TokenRegistry>,
}

impl Matcher {
    pub fn new(
        db: PgPool,
        evaluator: Arc<RuleEvaluator>,
        cache: Arc<MemoryMatchCache>,
        store: Arc<Store>,
        tokens: Arc<TokenRegistry>,
    ) -> Self {
        Self {
            db,
            evaluator,
            cache,
            store,
            tokens,
        }
    }

    // ============ Source sweep ============

    /// Build bridge rows from confirmed, unprocessed deposits.
    pub async fn source_sweep(&self, version: BridgeVersion) -> Result<()> {
        let schedule = SweepSchedule::for_version(version);
        let transfers =
            db::get_source_transfers(&self.db, version.source_version(), schedule.source_batch)
                .await?;
        if transfers.is_empty() {
            return Ok(());
        }
        debug!(version = ?version, count = transfers.len(), "Source sweep batch");

        for transfer in transfers {
            if let Err(e) = self.process_source_transfer(&transfer).await {
                error!(
                    chain = %transfer.chain_id,
                    hash = %transfer.hash,
                    error = %e,
                    "Failed to process source transfer"
                );
            }
        }
        Ok(())
    }

    async fn process_source_transfer(&self, transfer: &Transfer) -> Result<()> {
        // A row already in operation must never be rebuilt.
        if let Some(existing) =
            db::get_bridge_by_source(&self.db, &transfer.chain_id, &transfer.hash).await?
        {
            if existing.status >= BridgeStatus::ReadyPaid.as_i16() {
                debug!(
                    source_id = %transfer.hash,
                    status = existing.status,
                    "Bridge row in operation, skipping rebuild"
                );
                return Ok(());
            }
        }

        let payout = match self.evaluator.evaluate(transfer) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    chain = %transfer.chain_id,
                    hash = %transfer.hash,
                    error = %e,
                    "Deposit failed evaluation, marking error sentinel"
                );
                db::set_transfer_op_status(
                    &self.db,
                    &transfer.chain_id,
                    &transfer.hash,
                    OpStatus::Error.as_i16(),
                )
                .await?;
                metrics::EVALUATION_ERRORS
                    .with_label_values(&[&transfer.chain_id])
                    .inc();
                return Ok(());
            }
        };

        let new = build_bridge_row(transfer, &payout);

        let mut tx = self.db.begin().await?;
        let bridge_id = db::upsert_bridge_transaction(&mut tx, &new).await?;
        let Some(_bridge_id) = bridge_id else {
            // Conflict guard refused: the row went into operation between
            // our read and the upsert.
            tx.rollback().await?;
            return Ok(());
        };
        db::set_transfer_op_status_tx(
            &mut tx,
            &transfer.chain_id,
            &transfer.hash,
            OpStatus::SourceBuilt.as_i16(),
        )
        .await?;
        tx.commit().await?;

        metrics::BRIDGE_ROWS_BUILT
            .with_label_values(&[&transfer.chain_id])
            .inc();

        // Fast path for the destination sweep.
        let match_key = MatchKey::new(
            &new.target_chain,
            &new.target_symbol,
            &new.target_address,
            &new.target_amount,
        );
        self.cache.publish_bridge(
            match_key.clone(),
            CachedBridge {
                source_chain: new.source_chain.clone(),
                source_id: new.source_id.clone(),
                source_time: new.source_time,
                response_makers: new.response_maker.clone(),
            },
        );

        // Queue the payout for the sequencer.
        self.store
            .add_transaction(payout_task(transfer, &payout, &self.tokens));

        info!(
            source_id = %transfer.hash,
            target_chain = %payout.target_chain,
            target_amount = %payout.target_amount,
            "Bridge transaction built"
        );

        // The payout may already be on chain: a destination transfer that
        // arrived before this row was built is waiting in the cache. Close
        // the match now instead of on the next destination sweep.
        self.close_waiting_dests(&match_key).await;
        Ok(())
    }

    /// Re-run cached destination transfers against a freshly built bridge
    /// row. Entries that no longer qualify are dropped from the cache.
    async fn close_waiting_dests(&self, key: &MatchKey) {
        for waiting in self.cache.waiting_dests(key) {
            match db::get_transfer_by_hash(&self.db, &waiting.chain_id, &waiting.hash).await {
                Ok(Some(dest))
                    if dest.op_status == OpStatus::Unprocessed.as_i16()
                        && (dest.status == TransferStatus::Success.as_i16()
                            || dest.status == TransferStatus::Failed.as_i16()) =>
                {
                    if let Err(e) = self.process_dest_transfer(&dest).await {
                        warn!(
                            chain = %waiting.chain_id,
                            hash = %waiting.hash,
                            error = %e,
                            "Failed to close waiting destination transfer"
                        );
                    }
                }
                Ok(_) => {
                    // Gone or already matched; nothing left to wait for.
                    self.cache.remove_dest(key, &waiting.chain_id, &waiting.hash);
                }
                Err(e) => {
                    warn!(
                        chain = %waiting.chain_id,
                        hash = %waiting.hash,
                        error = %e,
                        "Failed to load waiting destination transfer"
                    );
                }
            }
        }
    }

    // ============ Destination sweep ============

    /// Close bridge rows whose payout has appeared on the destination chain.
    pub async fn dest_sweep(&self, version: BridgeVersion) -> Result<()> {
        let schedule = SweepSchedule::for_version(version);
        let transfers =
            db::get_dest_transfers(&self.db, version.dest_version(), schedule.dest_batch).await?;
        if transfers.is_empty() {
            return Ok(());
        }
        debug!(version = ?version, count = transfers.len(), "Destination sweep batch");

        for transfer in transfers {
            if let Err(e) = self.process_dest_transfer(&transfer).await {
                error!(
                    chain = %transfer.chain_id,
                    hash = %transfer.hash,
                    error = %e,
                    "Failed to process destination transfer"
                );
            }
        }
        Ok(())
    }

    async fn process_dest_transfer(&self, transfer: &Transfer) -> Result<()> {
        let sender = normalize_address(&transfer.sender);
        let receiver = normalize_address(&transfer.receiver);
        let key = MatchKey::new(
            &transfer.chain_id,
            &transfer.symbol,
            &receiver,
            &transfer.value,
        );

        // Path A: memory cache (content + permitted sender + time window).
        let mut bridge = None;
        if let Some(cached) = self.cache.find_bridge(&key, &sender, transfer.timestamp) {
            bridge = db::get_bridge_by_source(&self.db, &cached.source_chain, &cached.source_id)
                .await?;
        }

        // Path B: the DB, recorded payout hash first, then content.
        if bridge.is_none() {
            bridge = db::get_bridge_by_target(&self.db, &transfer.chain_id, &transfer.hash).await?;
        }
        if bridge.is_none() {
            bridge = db::find_closable_by_content(
                &self.db,
                &transfer.chain_id,
                &transfer.symbol,
                &receiver,
                &transfer.value,
                &sender,
            )
            .await?;
        }

        let Some(bridge) = bridge else {
            // Arrived before its bridge row; remember it for later sweeps.
            self.cache.insert_dest(
                key,
                CachedDest {
                    chain_id: transfer.chain_id.clone(),
                    hash: transfer.hash.clone(),
                    seen_at: transfer.timestamp,
                },
            );
            return Ok(());
        };

        if !BridgeStatus::closable().contains(&bridge.status) {
            return Ok(());
        }

        let new_status = if transfer.status == TransferStatus::Failed.as_i16() {
            BridgeStatus::OnchainFailed.as_i16()
        } else {
            BridgeStatus::BridgeSuccess.as_i16()
        };
        let close = BridgeClose {
            target_id: transfer.hash.clone(),
            target_time: transfer.timestamp,
            target_nonce: transfer.nonce,
            target_maker: sender.clone(),
            target_fee: transfer.fee_amount.clone(),
            target_fee_symbol: transfer.fee_token.clone(),
        };

        let mut tx = self.db.begin().await?;
        let closed = db::close_bridge_transaction(&mut tx, bridge.id, &close, new_status).await?;
        if closed != 1 {
            // Lost the race to a concurrent close; the winner stands.
            tx.rollback().await?;
            return Ok(());
        }
        let flipped = db::mark_transfers_matched(
            &mut tx,
            (bridge.source_chain.as_str(), bridge.source_id.as_str()),
            (transfer.chain_id.as_str(), transfer.hash.as_str()),
        )
        .await?;
        if flipped != 2 {
            warn!(
                bridge_id = bridge.id,
                flipped,
                "Close would not flip exactly two transfers, rolling back"
            );
            tx.rollback().await?;
            return Ok(());
        }
        tx.commit().await?;

        self.cache.remove_bridge(&bridge.source_chain, &bridge.source_id);
        self.cache.remove_dest(&key, &transfer.chain_id, &transfer.hash);
        // The obligation is settled; nothing left to schedule.
        self.store.remove_transaction(
            &(
                bridge.target_chain.clone(),
                normalize_address(&bridge.target_token),
            ),
            &bridge.source_id,
        );

        metrics::BRIDGE_ROWS_CLOSED
            .with_label_values(&[&transfer.chain_id, if new_status == 99 { "success" } else { "failed" }])
            .inc();
        info!(
            bridge_id = bridge.id,
            source_id = %bridge.source_id,
            target_id = %transfer.hash,
            status = new_status,
            "Bridge transaction closed"
        );
        Ok(())
    }
}

fn build_bridge_row(transfer: &Transfer, payout: &EvaluatedPayout) -> NewBridgeTransaction {
    NewBridgeTransaction {
        source_chain: transfer.chain_id.clone(),
        source_id: transfer.hash.clone(),
        source_address: normalize_address(&transfer.sender),
        source_maker: normalize_address(&transfer.receiver),
        source_amount: transfer.value.clone(),
        source_symbol: payout.source_symbol.clone(),
        source_token: payout.source_token.clone(),
        source_nonce: transfer.nonce,
        source_time: transfer.timestamp,
        target_chain: payout.target_chain.clone(),
        target_address: payout.target_address.clone(),
        target_amount: payout.target_amount.to_string(),
        target_symbol: payout.target_symbol.clone(),
        target_token: payout.target_token.clone(),
        rule_id: Some(payout.rule_id.clone()),
        ebc_address: (!payout.ebc_address.is_empty()).then(|| payout.ebc_address.clone()),
        dealer_address: (!payout.dealer_address.is_empty()).then(|| payout.dealer_address.clone()),
        withholding_fee: Some(payout.withholding_fee.to_string()),
        trade_fee: Some(payout.trade_fee.to_string()),
        response_maker: payout.response_makers.clone(),
        version: transfer.version.clone(),
    }
}

fn payout_task(transfer: &Transfer, payout: &EvaluatedPayout, tokens: &TokenRegistry) -> PayoutTask {
    let source_decimals = tokens
        .by_chain_symbol(&transfer.chain_id, &payout.source_symbol)
        .map(|t| t.decimals)
        .unwrap_or(18);
    PayoutTask {
        source_id: transfer.hash.clone(),
        source_chain: transfer.chain_id.clone(),
        source_symbol: payout.source_symbol.clone(),
        source_amount: transfer.value.clone(),
        source_decimals,
        target_chain: payout.target_chain.clone(),
        target_token: payout.target_token.clone(),
        target_symbol: payout.target_symbol.clone(),
        target_address: payout.target_address.clone(),
        target_amount: payout.target_amount.to_string(),
        target_decimals: payout.target_decimals,
        is_native: crate::store::is_native_asset(&payout.target_token),
        response_makers: payout.response_makers.clone(),
    }
}

/// Runs the four sweep loops (two versions, two directions) until shutdown.
pub struct MatcherManager {
    matcher: Arc<Matcher>,
    consecutive_failures: u32,
}

impl MatcherManager {
    pub fn new(matcher: Arc<Matcher>) -> Self {
        Self {
            matcher,
            consecutive_failures: 0,
        }
    }

    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let v1 = SweepSchedule::for_version(BridgeVersion::V1);
        let v2 = SweepSchedule::for_version(BridgeVersion::V2);

        let mut v1_source = tokio::time::interval(v1.source_interval);
        let mut v1_dest = tokio::time::interval(v1.dest_interval);
        let mut v2_source = tokio::time::interval(v2.source_interval);
        let mut v2_dest = tokio::time::interval(v2.dest_interval);
        for i in [&mut v1_source, &mut v1_dest, &mut v2_source, &mut v2_dest] {
            i.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        info!(
            v1_source_secs = v1.source_interval.as_secs(),
            v1_dest_secs = v1.dest_interval.as_secs(),
            v2_source_secs = v2.source_interval.as_secs(),
            v2_dest_secs = v2.dest_interval.as_secs(),
            "Matcher manager starting sweep loops"
        );

        loop {
            let matcher = Arc::clone(&self.matcher);
            tokio::select! {
                _ = v1_source.tick() => {
                    self.run_sweep("v1-source", async move { matcher.source_sweep(BridgeVersion::V1).await }).await
                }
                _ = v1_dest.tick() => {
                    self.run_sweep("v1-dest", async move { matcher.dest_sweep(BridgeVersion::V1).await }).await
                }
                _ = v2_source.tick() => {
                    self.run_sweep("v2-source", async move { matcher.source_sweep(BridgeVersion::V2).await }).await
                }
                _ = v2_dest.tick() => {
                    self.run_sweep("v2-dest", async move { matcher.dest_sweep(BridgeVersion::V2).await }).await
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping matcher");
                    return Ok(());
                }
            }
        }
    }

    async fn run_sweep(&mut self, name: &str, sweep: impl std::future::Future<Output = Result<()>>) {
        match sweep.await {
            Ok(()) => {
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.consecutive_failures += 1;
                metrics::SWEEP_ERRORS.with_label_values(&[name]).inc();
                error!(
                    sweep = name,
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Sweep failed, will retry on next tick"
                );
            }
        }
    }
}
