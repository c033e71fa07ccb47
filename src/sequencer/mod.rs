//! The sequencer: drains the in-flight payout set and executes payouts
//! under the 0 -> 90 -> {0|95|97|98|99} status machine.
//!
//! The single-transfer machine holds its DB transaction open across the
//! broadcast. That is deliberate: the row moves 0 -> 95 or 0 -> 98
//! atomically with the broadcast outcome, and a crash in between leaves 90
//! for the startup reconciler plus the serial-relation anchor.

#![allow(dead_code)]

use alloy::primitives::U256;
use eyre::Result;
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::account::{AccountManager, EvmAccount, SenderAccount};
use crate::alerts::{AlertChannel, Alerts};
use crate::db;
use crate::errors::SendError;
use crate::metrics;
use crate::rates::{validating_value_matches, RateProvider};
use crate::store::{PayoutTask, QueueKey, SerialSink, Store};
use crate::types::{normalize_address, BridgeStatus};

/// How long the detached receipt watcher polls before alerting and leaving
/// the row at PAID_SUCCESS for the destination sweep.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct Sequencer {
    db: PgPool,
    store: Arc<Store>,
    accounts: Arc<AccountManager>,
    alerts: Arc<dyn Alerts>,
    rates: Arc<dyn RateProvider>,
    max_value_loss_bps: u32,
    poll_interval: Duration,
}

impl Sequencer {
    pub fn new(
        db: PgPool,
        store: Arc<Store>,
        accounts: Arc<AccountManager>,
        alerts: Arc<dyn Alerts>,
        rates: Arc<dyn RateProvider>,
        max_value_loss_bps: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            store,
            accounts,
            alerts,
            rates,
            max_value_loss_bps,
            poll_interval,
        }
    }

    /// Drain loop; polls the store until shutdown.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut cycle = 0u64;
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Sequencer starting drain loop"
        );

        loop {
            cycle += 1;
            if cycle % 12 == 1 {
                let keys = self.store.pending_keys();
                let pending: usize = keys.iter().map(|(_, n)| n).sum();
                for ((chain, _), n) in &keys {
                    metrics::INFLIGHT_PAYOUTS
                        .with_label_values(&[chain])
                        .set(*n as f64);
                }
                info!(cycle, pending, "Sequencer heartbeat");
            }

            tokio::select! {
                _ = self.drain() => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping sequencer");
                    return Ok(());
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One pass over every queue: group by resolved maker account, batch
    /// where the chain has a router, singles otherwise.
    pub async fn drain(&self) {
        for (key, _) in self.store.pending_keys() {
            let tasks = self.store.peek_all(&key);

            let mut groups: HashMap<String, (Arc<EvmAccount>, Vec<PayoutTask>)> = HashMap::new();
            let mut unassigned = 0usize;
            for task in tasks {
                match self.accounts.resolve(&task.target_chain, &task.response_makers) {
                    Some(account) => {
                        groups
                            .entry(normalize_address(&account.address()))
                            .or_insert_with(|| (account, Vec::new()))
                            .1
                            .push(task);
                    }
                    None => unassigned += 1,
                }
            }
            if unassigned > 0 {
                debug!(
                    chain = %key.0,
                    token = %key.1,
                    unassigned,
                    "Payouts without a permitted maker account stay queued"
                );
            }

            for (_, (account, tasks)) in groups {
                if tasks.len() > 1 && account.supports_batch() {
                    let ids: Vec<String> = tasks.iter().map(|t| t.source_id.clone()).collect();
                    if let Err(e) = self
                        .batch_send_by_transfer(&key, Arc::clone(&account), tasks)
                        .await
                    {
                        self.report(&format!("batch {:?}", ids), &e).await;
                    }
                } else {
                    for task in tasks {
                        let source_id = task.source_id.clone();
                        if let Err(e) = self.single_send_by_transfer(&key, &source_id).await {
                            self.report(&source_id, &e).await;
                        }
                    }
                }
            }
        }
    }

    /// Error policy from the sequencer's point of view: ignore errors are
    /// silent, everything else is logged and alerted (one-shot).
    async fn report(&self, context: &str, e: &SendError) {
        match e {
            SendError::Ignore(msg) => {
                debug!(context, %msg, "Payout skipped");
            }
            SendError::Before(msg) => {
                warn!(context, %msg, "Payout aborted before broadcast");
                metrics::PAYOUT_ERRORS.with_label_values(&["before"]).inc();
                self.alerts
                    .send_message(
                        &format!("payout aborted ({}): {}", context, msg),
                        &[AlertChannel::Telegram],
                    )
                    .await;
            }
            SendError::After(msg) => {
                error!(context, %msg, "Payout failed after broadcast");
                metrics::PAYOUT_ERRORS.with_label_values(&["after"]).inc();
                self.alerts
                    .send_message(
                        &format!("PAID_CRASH ({}): {}", context, msg),
                        &[AlertChannel::Telegram],
                    )
                    .await;
            }
        }
    }

    // ============ Single payout ============

    /// Pop one source id from the in-flight set and pay it out under the
    /// sender's exclusive section.
    pub async fn single_send_by_transfer(
        &self,
        key: &QueueKey,
        source_id: &str,
    ) -> Result<(), SendError> {
        if self
            .store
            .get_serial_record(source_id)
            .await
            .map_err(|e| SendError::before(format!("serial lookup failed: {}", e)))?
        {
            self.store.remove_transaction(key, source_id);
            return Err(SendError::ignore(format!(
                "{} already has a serial record",
                source_id
            )));
        }

        let task = self
            .store
            .get_transaction(key, source_id)
            .ok_or_else(|| SendError::ignore(format!("{} not in flight", source_id)))?;

        let account = self
            .accounts
            .resolve(&task.target_chain, &task.response_makers)
            .ok_or_else(|| {
                SendError::before(format!(
                    "no permitted maker account on chain {}",
                    task.target_chain
                ))
            })?;

        let sender = account.address();
        let store = Arc::clone(&self.store);
        let ids = vec![source_id.to_string()];
        self.store
            .account_run_exclusive(&sender, move || async move {
                let (mut detached, rollback) =
                    store.remove_transactions_and_set_serial(key, &ids);
                let Some(task) = detached.pop() else {
                    return Err(SendError::ignore("claimed by another worker"));
                };
                match self.exec_single_transfer(&task, account).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if e.is_before() {
                            rollback.rollback();
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    /// The single-payout state machine. T1 is held open across the
    /// broadcast; the caller owns in-flight rollback.
    async fn exec_single_transfer(
        &self,
        task: &PayoutTask,
        account: Arc<EvmAccount>,
    ) -> Result<(), SendError> {
        self.check_value_bound(task).await?;

        let amount = U256::from_str(&task.target_amount)
            .map_err(|_| SendError::before(format!("invalid amount {}", task.target_amount)))?;
        self.check_funds(&account, task, amount).await?;

        // T1
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| SendError::before(format!("begin failed: {}", e)))?;

        let bridge = db::get_bridge_for_update(&mut tx, &task.source_chain, &task.source_id)
            .await
            .map_err(|e| SendError::before(format!("bridge load failed: {}", e)))?
            .ok_or_else(|| {
                SendError::before(format!("bridge row missing for {}", task.source_id))
            })?;

        if bridge.status != BridgeStatus::Created.as_i16() {
            return Err(SendError::ignore(format!(
                "bridge {} status {} is not payable",
                bridge.id, bridge.status
            )));
        }
        if bridge.target_id.is_some() {
            return Err(SendError::ignore(format!(
                "bridge {} already has a payout attempt",
                bridge.id
            )));
        }
        if bridge.target_chain != task.target_chain
            || bridge.target_symbol != task.target_symbol
            || bridge.target_amount != task.target_amount
            || normalize_address(&bridge.target_address) != normalize_address(&task.target_address)
        {
            return Err(SendError::before(format!(
                "queued intent diverges from bridge row {} (amount {} vs {})",
                bridge.id, task.target_amount, bridge.target_amount
            )));
        }

        let locked = db::update_bridge_status_guarded(
            &mut tx,
            bridge.id,
            BridgeStatus::Created.as_i16(),
            BridgeStatus::ReadyPaid.as_i16(),
        )
        .await
        .map_err(|e| SendError::before(format!("status update failed: {}", e)))?;
        if locked != 1 {
            return Err(SendError::ignore("row left payable state"));
        }

        // Broadcast while T1 holds the row at READY_PAID.
        let source_ids = vec![task.source_id.clone()];
        let serial: &dyn SerialSink = self.store.as_ref();
        let result = if task.is_native {
            account
                .transfer(serial, &source_ids, &task.target_address, amount)
                .await
        } else {
            account
                .transfer_token(
                    serial,
                    &source_ids,
                    &task.target_token,
                    &task.target_address,
                    amount,
                )
                .await
        };

        match result {
            Ok(broadcast) => {
                db::mark_bridge_paid(
                    &mut tx,
                    bridge.id,
                    BridgeStatus::PaidSuccess.as_i16(),
                    Some(&broadcast.tx_hash),
                    Some(&broadcast.from),
                )
                .await
                .map_err(|e| SendError::after(format!("paid-success write failed: {}", e)))?;
                tx.commit()
                    .await
                    .map_err(|e| SendError::after(format!("commit failed: {}", e)))?;

                metrics::PAYOUTS_BROADCAST
                    .with_label_values(&[&task.target_chain, "single"])
                    .inc();
                info!(
                    bridge_id = bridge.id,
                    source_id = %task.source_id,
                    tx_hash = %broadcast.tx_hash,
                    nonce = broadcast.nonce,
                    "Payout broadcast"
                );
                self.spawn_receipt_watch(vec![bridge.id], account, broadcast.tx_hash);
                Ok(())
            }
            Err(e) if e.is_before() => {
                // T1 rolls back on drop; the row stays at 0.
                drop(tx);
                Err(e)
            }
            Err(e) => {
                // The broadcast may have landed. Record the crash with the
                // best-known hash from the serial anchor.
                let known_hash = db::get_serial(&self.db, &task.source_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|s| s.target_tx_hash);
                db::mark_bridge_paid(
                    &mut tx,
                    bridge.id,
                    BridgeStatus::PaidCrash.as_i16(),
                    known_hash.as_deref(),
                    Some(&account.address()),
                )
                .await
                .map_err(|e2| SendError::after(format!("paid-crash write failed: {} (after {})", e2, e)))?;
                tx.commit()
                    .await
                    .map_err(|e2| SendError::after(format!("crash commit failed: {} (after {})", e2, e)))?;
                metrics::PAYOUTS_CRASHED
                    .with_label_values(&[&task.target_chain])
                    .inc();
                Err(e)
            }
        }
    }

    // ============ Batch payout ============

    /// Pay a same-(chain, token, sender) group through the router contract.
    pub async fn batch_send_by_transfer(
        &self,
        key: &QueueKey,
        account: Arc<EvmAccount>,
        tasks: Vec<PayoutTask>,
    ) -> Result<(), SendError> {
        let mut eligible = Vec::new();
        for task in tasks {
            if self
                .store
                .get_serial_record(&task.source_id)
                .await
                .map_err(|e| SendError::before(format!("serial lookup failed: {}", e)))?
            {
                self.store.remove_transaction(key, &task.source_id);
                continue;
            }
            if let Err(e) = self.check_value_bound(&task).await {
                warn!(source_id = %task.source_id, error = %e, "Payout fails value bound, left queued");
                continue;
            }
            eligible.push(task);
        }
        if eligible.is_empty() {
            return Ok(());
        }

        let sender = account.address();
        let store = Arc::clone(&self.store);
        self.store
            .account_run_exclusive(&sender, move || async move {
                let ids: Vec<String> = eligible.iter().map(|t| t.source_id.clone()).collect();
                let (detached, rollback) = store.remove_transactions_and_set_serial(key, &ids);
                if detached.is_empty() {
                    return Err(SendError::ignore("batch claimed by another worker"));
                }
                match self.exec_batch_transfer(&detached, account).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if e.is_before() {
                            rollback.rollback();
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    /// The single machine lifted over a set of rows: all go to 90 under a
    /// row-count check, one router broadcast, all demoted together on crash.
    async fn exec_batch_transfer(
        &self,
        tasks: &[PayoutTask],
        account: Arc<EvmAccount>,
    ) -> Result<(), SendError> {
        let mut amounts = Vec::with_capacity(tasks.len());
        let mut tos = Vec::with_capacity(tasks.len());
        let mut source_ids = Vec::with_capacity(tasks.len());
        let mut total = U256::ZERO;
        for task in tasks {
            let amount = U256::from_str(&task.target_amount)
                .map_err(|_| SendError::before(format!("invalid amount {}", task.target_amount)))?;
            total += amount;
            amounts.push(amount);
            tos.push(task.target_address.clone());
            source_ids.push(task.source_id.clone());
        }
        self.check_funds(&account, &tasks[0], total).await?;

        // T1
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| SendError::before(format!("begin failed: {}", e)))?;

        let mut bridge_ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            let bridge = db::get_bridge_for_update(&mut tx, &task.source_chain, &task.source_id)
                .await
                .map_err(|e| SendError::before(format!("bridge load failed: {}", e)))?
                .ok_or_else(|| {
                    // Before, not ignore: ignore would strand the whole
                    // detached batch with no rollback and no alert.
                    SendError::before(format!("bridge row missing for {}", task.source_id))
                })?;
            if bridge.status != BridgeStatus::Created.as_i16() || bridge.target_id.is_some() {
                return Err(SendError::ignore(format!(
                    "bridge {} is not payable, batch aborted",
                    bridge.id
                )));
            }
            bridge_ids.push(bridge.id);
        }

        let locked = db::update_bridge_many_status_guarded(
            &mut tx,
            &bridge_ids,
            BridgeStatus::Created.as_i16(),
            BridgeStatus::ReadyPaid.as_i16(),
        )
        .await
        .map_err(|e| SendError::before(format!("batch status update failed: {}", e)))?;
        if locked != bridge_ids.len() as u64 {
            // Row-count check failed: some row changed under us.
            return Err(SendError::ignore(format!(
                "batch expected {} lockable rows, got {}",
                bridge_ids.len(),
                locked
            )));
        }

        let serial: &dyn SerialSink = self.store.as_ref();
        let result = if tasks[0].is_native {
            account.transfers(serial, &source_ids, &tos, &amounts).await
        } else {
            account
                .transfer_tokens(serial, &source_ids, &tasks[0].target_token, &tos, &amounts)
                .await
        };

        match result {
            Ok(broadcast) => {
                for id in &bridge_ids {
                    db::mark_bridge_paid(
                        &mut tx,
                        *id,
                        BridgeStatus::PaidSuccess.as_i16(),
                        Some(&broadcast.tx_hash),
                        Some(&broadcast.from),
                    )
                    .await
                    .map_err(|e| SendError::after(format!("paid-success write failed: {}", e)))?;
                }
                tx.commit()
                    .await
                    .map_err(|e| SendError::after(format!("commit failed: {}", e)))?;

                metrics::PAYOUTS_BROADCAST
                    .with_label_values(&[&tasks[0].target_chain, "batch"])
                    .inc();
                info!(
                    batch = bridge_ids.len(),
                    tx_hash = %broadcast.tx_hash,
                    "Batch payout broadcast"
                );
                self.spawn_receipt_watch(bridge_ids, account, broadcast.tx_hash);
                Ok(())
            }
            Err(e) if e.is_before() => {
                drop(tx);
                Err(e)
            }
            Err(e) => {
                let known_hash = db::get_serial(&self.db, &source_ids[0])
                    .await
                    .ok()
                    .flatten()
                    .map(|s| s.target_tx_hash);
                for id in &bridge_ids {
                    db::mark_bridge_paid(
                        &mut tx,
                        *id,
                        BridgeStatus::PaidCrash.as_i16(),
                        known_hash.as_deref(),
                        Some(&account.address()),
                    )
                    .await
                    .map_err(|e2| SendError::after(format!("paid-crash write failed: {} (after {})", e2, e)))?;
                }
                tx.commit()
                    .await
                    .map_err(|e2| SendError::after(format!("crash commit failed: {} (after {})", e2, e)))?;
                metrics::PAYOUTS_CRASHED
                    .with_label_values(&[&tasks[0].target_chain])
                    .inc();
                Err(e)
            }
        }
    }

    // ============ Shared checks ============

    async fn check_value_bound(&self, task: &PayoutTask) -> Result<(), SendError> {
        validating_value_matches(
            self.rates.as_ref(),
            &task.source_symbol,
            &task.source_amount,
            task.source_decimals,
            &task.target_symbol,
            &task.target_amount,
            task.target_decimals,
            self.max_value_loss_bps,
        )
        .await
        .map_err(|e| SendError::before(format!("value check failed: {}", e)))
    }

    async fn check_funds(
        &self,
        account: &EvmAccount,
        task: &PayoutTask,
        amount: U256,
    ) -> Result<(), SendError> {
        let balance = if task.is_native {
            account.get_balance().await
        } else {
            account.get_token_balance(&task.target_token).await
        }
        .map_err(|e| SendError::before(format!("balance fetch failed: {}", e)))?;

        if balance < amount {
            return Err(SendError::before(format!(
                "insufficient {} balance on chain {}: have {}, need {}",
                task.target_symbol, task.target_chain, balance, amount
            )));
        }
        Ok(())
    }

    /// Detached receipt watcher. Detached on purpose: cancelling the payout
    /// caller must not abandon a broadcast that already left the process.
    fn spawn_receipt_watch(&self, bridge_ids: Vec<i64>, account: Arc<EvmAccount>, tx_hash: String) {
        let db = self.db.clone();
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            match account
                .wait_for_transaction_confirmation(&tx_hash, RECEIPT_TIMEOUT)
                .await
            {
                Ok(receipt) => {
                    let to_status = if receipt.success {
                        BridgeStatus::BridgeSuccess.as_i16()
                    } else {
                        BridgeStatus::OnchainFailed.as_i16()
                    };
                    for id in &bridge_ids {
                        match db::finalize_bridge_receipt(
                            &db,
                            *id,
                            BridgeStatus::PaidSuccess.as_i16(),
                            to_status,
                            &receipt.from,
                        )
                        .await
                        {
                            Ok(1) => {}
                            Ok(_) => debug!(bridge_id = id, "Receipt finalize found row already moved"),
                            Err(e) => error!(bridge_id = id, error = %e, "Receipt finalize failed"),
                        }
                    }
                    info!(
                        tx_hash = %tx_hash,
                        success = receipt.success,
                        rows = bridge_ids.len(),
                        "Payout receipt observed"
                    );
                }
                Err(e) => {
                    // Rows stay at PAID_SUCCESS; the destination sweep will
                    // close them when the transfer is ingested.
                    error!(tx_hash = %tx_hash, error = %e, "Receipt watch failed");
                    alerts
                        .send_message(
                            &format!("receipt watch failed for {}: {}", tx_hash, e),
                            &[AlertChannel::Telegram],
                        )
                        .await;
                }
            }
        });
    }
}
