#![allow(dead_code)]

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::error;

pub mod models;

pub use models::*;

use crate::types::BridgeStatus;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// SQL SELECT columns for the transfers table (casting NUMERIC to TEXT)
const TRANSFER_SELECT: &str = r#"id, hash, chain_id, sender, receiver, token, symbol,
    amount::TEXT as amount, value::TEXT as value, nonce, timestamp,
    fee_amount::TEXT as fee_amount, fee_token, version, calldata, status, op_status"#;

/// SQL SELECT columns for the bridge_transactions table (casting NUMERIC to TEXT)
const BRIDGE_SELECT: &str = r#"id, source_chain, source_id, source_address, source_maker,
    source_amount::TEXT as source_amount, source_symbol, source_token, source_nonce, source_time,
    target_chain, target_id, target_address, target_amount::TEXT as target_amount, target_symbol,
    target_token, target_maker, target_time, target_nonce, target_fee::TEXT as target_fee,
    target_fee_symbol, rule_id, ebc_address, dealer_address,
    withholding_fee::TEXT as withholding_fee, trade_fee::TEXT as trade_fee,
    response_maker, status, version, created_at, updated_at"#;

// ============ Matcher: sweep selection ============

/// Source-side transfers awaiting matching: confirmed, unprocessed, of the
/// given deposit version, no older than 24h, newest first.
pub async fn get_source_transfers(
    pool: &PgPool,
    version: &str,
    limit: i64,
) -> Result<Vec<Transfer>> {
    let query = format!(
        r#"SELECT {} FROM transfers
           WHERE status = 2 AND op_status = 0 AND version = $1
             AND timestamp >= NOW() - INTERVAL '24 hours'
           ORDER BY id DESC
           LIMIT $2"#,
        TRANSFER_SELECT
    );
    let rows = sqlx::query_as::<_, Transfer>(&query)
        .bind(version)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| {
            error!("SQL error getting source transfers: {:?}", e);
            e
        })
        .wrap_err("Failed to get source transfers")?;

    Ok(rows)
}

/// Destination-side transfers awaiting matching. Failed transfers are
/// included: a reverted payout still closes its bridge row to 97.
pub async fn get_dest_transfers(pool: &PgPool, version: &str, limit: i64) -> Result<Vec<Transfer>> {
    let query = format!(
        r#"SELECT {} FROM transfers
           WHERE status IN (2, 3) AND op_status = 0 AND version = $1
           ORDER BY id DESC
           LIMIT $2"#,
        TRANSFER_SELECT
    );
    let rows = sqlx::query_as::<_, Transfer>(&query)
        .bind(version)
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get destination transfers")?;

    Ok(rows)
}

/// A single transfer row by identity; used when the source sweep revisits a
/// destination transfer the match cache remembered.
pub async fn get_transfer_by_hash(
    pool: &PgPool,
    chain_id: &str,
    hash: &str,
) -> Result<Option<Transfer>> {
    let query = format!(
        "SELECT {} FROM transfers WHERE chain_id = $1 AND hash = $2",
        TRANSFER_SELECT
    );
    let row = sqlx::query_as::<_, Transfer>(&query)
        .bind(chain_id)
        .bind(hash)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get transfer by hash")?;

    Ok(row)
}

/// Update a transfer's matcher progress marker. Returns rows affected.
pub async fn set_transfer_op_status(
    pool: &PgPool,
    chain_id: &str,
    hash: &str,
    op_status: i16,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE transfers SET op_status = $1, updated_at = NOW()
           WHERE chain_id = $2 AND hash = $3"#,
    )
    .bind(op_status)
    .bind(chain_id)
    .bind(hash)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to set op_status for transfer {}", hash))?;

    Ok(result.rows_affected())
}

/// Transaction-scoped variant of [`set_transfer_op_status`], used when the
/// marker must commit atomically with a bridge row write.
pub async fn set_transfer_op_status_tx(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: &str,
    hash: &str,
    op_status: i16,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE transfers SET op_status = $1, updated_at = NOW()
           WHERE chain_id = $2 AND hash = $3"#,
    )
    .bind(op_status)
    .bind(chain_id)
    .bind(hash)
    .execute(&mut **tx)
    .await
    .wrap_err_with(|| format!("Failed to set op_status for transfer {}", hash))?;

    Ok(result.rows_affected())
}

// ============ Bridge transactions ============

pub async fn get_bridge_by_source(
    pool: &PgPool,
    source_chain: &str,
    source_id: &str,
) -> Result<Option<BridgeTransaction>> {
    let query = format!(
        "SELECT {} FROM bridge_transactions WHERE source_chain = $1 AND source_id = $2",
        BRIDGE_SELECT
    );
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(source_chain)
        .bind(source_id)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get bridge transaction by source")?;

    Ok(row)
}

/// Upsert a bridge row from the source sweep, inside the caller's
/// transaction. The conflict arm refuses rows already in operation
/// (status >= 90); returns the row id, or None when the guard refused.
pub async fn upsert_bridge_transaction(
    tx: &mut Transaction<'_, Postgres>,
    new: &NewBridgeTransaction,
) -> Result<Option<i64>> {
    let row = sqlx::query(
        r#"
        INSERT INTO bridge_transactions (source_chain, source_id, source_address, source_maker,
            source_amount, source_symbol, source_token, source_nonce, source_time,
            target_chain, target_address, target_amount, target_symbol, target_token,
            rule_id, ebc_address, dealer_address, withholding_fee, trade_fee,
            response_maker, status, version)
        VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, $9, $10, $11, $12::NUMERIC, $13, $14,
                $15, $16, $17, $18::NUMERIC, $19::NUMERIC, $20, 0, $21)
        ON CONFLICT (source_chain, source_id) DO UPDATE SET
            source_address = EXCLUDED.source_address,
            source_maker = EXCLUDED.source_maker,
            source_amount = EXCLUDED.source_amount,
            source_symbol = EXCLUDED.source_symbol,
            source_token = EXCLUDED.source_token,
            source_nonce = EXCLUDED.source_nonce,
            source_time = EXCLUDED.source_time,
            target_chain = EXCLUDED.target_chain,
            target_address = EXCLUDED.target_address,
            target_amount = EXCLUDED.target_amount,
            target_symbol = EXCLUDED.target_symbol,
            target_token = EXCLUDED.target_token,
            rule_id = EXCLUDED.rule_id,
            ebc_address = EXCLUDED.ebc_address,
            dealer_address = EXCLUDED.dealer_address,
            withholding_fee = EXCLUDED.withholding_fee,
            trade_fee = EXCLUDED.trade_fee,
            response_maker = EXCLUDED.response_maker,
            version = EXCLUDED.version,
            updated_at = NOW()
        WHERE bridge_transactions.status < 90
        RETURNING id
        "#,
    )
    .bind(&new.source_chain)
    .bind(&new.source_id)
    .bind(&new.source_address)
    .bind(&new.source_maker)
    .bind(&new.source_amount)
    .bind(&new.source_symbol)
    .bind(&new.source_token)
    .bind(new.source_nonce)
    .bind(new.source_time)
    .bind(&new.target_chain)
    .bind(&new.target_address)
    .bind(&new.target_amount)
    .bind(&new.target_symbol)
    .bind(&new.target_token)
    .bind(&new.rule_id)
    .bind(&new.ebc_address)
    .bind(&new.dealer_address)
    .bind(&new.withholding_fee)
    .bind(&new.trade_fee)
    .bind(&new.response_maker)
    .bind(&new.version)
    .fetch_optional(&mut **tx)
    .await
    .wrap_err_with(|| {
        format!(
            "Failed to upsert bridge transaction ({}, {})",
            new.source_chain, new.source_id
        )
    })?;

    Ok(row.map(|r| r.get("id")))
}

pub async fn get_bridge_by_target(
    pool: &PgPool,
    target_chain: &str,
    target_id: &str,
) -> Result<Option<BridgeTransaction>> {
    let query = format!(
        "SELECT {} FROM bridge_transactions WHERE target_chain = $1 AND target_id = $2",
        BRIDGE_SELECT
    );
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(target_chain)
        .bind(target_id)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to get bridge transaction by target")?;

    Ok(row)
}

/// Content match for the destination sweep: an open bridge row expecting
/// this exact payout from a permitted maker.
pub async fn find_closable_by_content(
    pool: &PgPool,
    target_chain: &str,
    target_symbol: &str,
    target_address: &str,
    target_amount: &str,
    sender: &str,
) -> Result<Option<BridgeTransaction>> {
    let query = format!(
        r#"SELECT {} FROM bridge_transactions
           WHERE status = ANY($1)
             AND target_chain = $2 AND target_symbol = $3
             AND target_address = $4 AND target_amount = $5::NUMERIC
             AND $6 = ANY(response_maker)
           ORDER BY id ASC
           LIMIT 1"#,
        BRIDGE_SELECT
    );
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(BridgeStatus::closable().to_vec())
        .bind(target_chain)
        .bind(target_symbol)
        .bind(target_address)
        .bind(target_amount)
        .bind(sender)
        .fetch_optional(pool)
        .await
        .wrap_err("Failed to find closable bridge transaction")?;

    Ok(row)
}

/// Close a bridge row with the destination-side fields, inside the caller's
/// transaction. Guarded on the closable statuses; returns rows affected so
/// the caller can detect a lost race and roll back.
pub async fn close_bridge_transaction(
    tx: &mut Transaction<'_, Postgres>,
    bridge_id: i64,
    close: &BridgeClose,
    new_status: i16,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE bridge_transactions
           SET target_id = $1, target_time = $2, target_nonce = $3, target_maker = $4,
               target_fee = $5::NUMERIC, target_fee_symbol = $6, status = $7, updated_at = NOW()
           WHERE id = $8 AND status = ANY($9)"#,
    )
    .bind(&close.target_id)
    .bind(close.target_time)
    .bind(close.target_nonce)
    .bind(&close.target_maker)
    .bind(&close.target_fee)
    .bind(&close.target_fee_symbol)
    .bind(new_status)
    .bind(bridge_id)
    .bind(BridgeStatus::closable().to_vec())
    .execute(&mut **tx)
    .await
    .wrap_err_with(|| format!("Failed to close bridge transaction {}", bridge_id))?;

    Ok(result.rows_affected())
}

/// Flip op_status to matched on the source and destination transfer rows in
/// one statement. Must affect exactly 2 rows; the caller aborts otherwise.
pub async fn mark_transfers_matched(
    tx: &mut Transaction<'_, Postgres>,
    source: (&str, &str),
    dest: (&str, &str),
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE transfers SET op_status = 99, updated_at = NOW()
           WHERE ((chain_id = $1 AND hash = $2) OR (chain_id = $3 AND hash = $4))
             AND op_status != 99"#,
    )
    .bind(source.0)
    .bind(source.1)
    .bind(dest.0)
    .bind(dest.1)
    .execute(&mut **tx)
    .await
    .wrap_err("Failed to mark transfers matched")?;

    Ok(result.rows_affected())
}

// ============ Sequencer: payout state machine ============

/// Load a bridge row with a row lock, inside the payout transaction.
pub async fn get_bridge_for_update(
    tx: &mut Transaction<'_, Postgres>,
    source_chain: &str,
    source_id: &str,
) -> Result<Option<BridgeTransaction>> {
    let query = format!(
        "SELECT {} FROM bridge_transactions WHERE source_chain = $1 AND source_id = $2 FOR UPDATE",
        BRIDGE_SELECT
    );
    let row = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(source_chain)
        .bind(source_id)
        .fetch_optional(&mut **tx)
        .await
        .wrap_err("Failed to lock bridge transaction")?;

    Ok(row)
}

/// Guarded status transition for one row. Returns rows affected.
pub async fn update_bridge_status_guarded(
    tx: &mut Transaction<'_, Postgres>,
    bridge_id: i64,
    from_status: i16,
    to_status: i16,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE bridge_transactions SET status = $1, updated_at = NOW()
           WHERE id = $2 AND status = $3"#,
    )
    .bind(to_status)
    .bind(bridge_id)
    .bind(from_status)
    .execute(&mut **tx)
    .await
    .wrap_err_with(|| format!("Failed to update bridge {} status", bridge_id))?;

    Ok(result.rows_affected())
}

/// Guarded batch status transition; the caller checks the row count equals
/// the batch size before proceeding.
pub async fn update_bridge_many_status_guarded(
    tx: &mut Transaction<'_, Postgres>,
    bridge_ids: &[i64],
    from_status: i16,
    to_status: i16,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE bridge_transactions SET status = $1, updated_at = NOW()
           WHERE id = ANY($2) AND status = $3"#,
    )
    .bind(to_status)
    .bind(bridge_ids)
    .bind(from_status)
    .execute(&mut **tx)
    .await
    .wrap_err("Failed to update bridge batch status")?;

    Ok(result.rows_affected())
}

/// Record a broadcast outcome on a row: PAID_SUCCESS (95) or PAID_CRASH (98)
/// with the best-known payout hash and sender.
pub async fn mark_bridge_paid(
    tx: &mut Transaction<'_, Postgres>,
    bridge_id: i64,
    status: i16,
    target_id: Option<&str>,
    target_maker: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"UPDATE bridge_transactions
           SET status = $1, target_id = COALESCE($2, target_id),
               target_maker = COALESCE($3, target_maker), updated_at = NOW()
           WHERE id = $4"#,
    )
    .bind(status)
    .bind(target_id)
    .bind(target_maker)
    .bind(bridge_id)
    .execute(&mut **tx)
    .await
    .wrap_err_with(|| format!("Failed to mark bridge {} paid (status {})", bridge_id, status))?;

    Ok(())
}

/// Post-receipt finalization, outside any held transaction.
pub async fn finalize_bridge_receipt(
    pool: &PgPool,
    bridge_id: i64,
    from_status: i16,
    to_status: i16,
    target_maker: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE bridge_transactions
           SET status = $1, target_maker = $2, updated_at = NOW()
           WHERE id = $3 AND status = $4"#,
    )
    .bind(to_status)
    .bind(target_maker)
    .bind(bridge_id)
    .bind(from_status)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to finalize bridge {} receipt", bridge_id))?;

    Ok(result.rows_affected())
}

/// Startup-reconciler transition for a row stuck at READY_PAID: either back
/// to 0 (no serial anchor, broadcast never happened) or forward to 95/97
/// with the recorded payout hash. Guarded on status 90.
pub async fn reconcile_bridge_status(
    pool: &PgPool,
    bridge_id: i64,
    to_status: i16,
    target_id: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"UPDATE bridge_transactions
           SET status = $1, target_id = COALESCE($2, target_id), updated_at = NOW()
           WHERE id = $3 AND status = 90"#,
    )
    .bind(to_status)
    .bind(target_id)
    .bind(bridge_id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to reconcile bridge {}", bridge_id))?;

    Ok(result.rows_affected())
}

/// All rows at one status; used by the startup reconciler (90) and /status.
pub async fn get_bridges_by_status(pool: &PgPool, status: i16) -> Result<Vec<BridgeTransaction>> {
    let query = format!(
        "SELECT {} FROM bridge_transactions WHERE status = $1 ORDER BY id ASC",
        BRIDGE_SELECT
    );
    let rows = sqlx::query_as::<_, BridgeTransaction>(&query)
        .bind(status)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get bridge transactions by status")?;

    Ok(rows)
}

/// Status histogram for /status.
pub async fn count_bridges_by_status(pool: &PgPool) -> Result<Vec<(i16, i64)>> {
    let rows: Vec<(i16, i64)> = sqlx::query_as(
        r#"SELECT status, COUNT(*) FROM bridge_transactions GROUP BY status ORDER BY status"#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to count bridge transactions")?;

    Ok(rows)
}

// ============ Serial relations ============

pub async fn serial_exists(pool: &PgPool, source_id: &str) -> Result<bool> {
    let row: (bool,) =
        sqlx::query_as(r#"SELECT EXISTS(SELECT 1 FROM serial_relations WHERE source_id = $1)"#)
            .bind(source_id)
            .fetch_one(pool)
            .await
            .wrap_err("Failed to check serial relation existence")?;

    Ok(row.0)
}

pub async fn get_serial(pool: &PgPool, source_id: &str) -> Result<Option<SerialRelation>> {
    let row = sqlx::query_as::<_, SerialRelation>(
        r#"SELECT id, source_id, target_tx_hash, sender, created_at
           FROM serial_relations WHERE source_id = $1"#,
    )
    .bind(source_id)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get serial relation")?;

    Ok(row)
}

/// Persist the broadcast anchor for a set of source deposits. Written before
/// the nonce is committed and the raw transaction sent; must be durable when
/// this returns.
pub async fn insert_serial_relations(
    pool: &PgPool,
    source_ids: &[String],
    target_tx_hash: &str,
    sender: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin serial tx")?;
    for source_id in source_ids {
        sqlx::query(
            r#"INSERT INTO serial_relations (source_id, target_tx_hash, sender)
               VALUES ($1, $2, $3)
               ON CONFLICT (source_id) DO UPDATE SET target_tx_hash = EXCLUDED.target_tx_hash"#,
        )
        .bind(source_id)
        .bind(target_tx_hash)
        .bind(sender)
        .execute(&mut *tx)
        .await
        .wrap_err_with(|| format!("Failed to insert serial relation for {}", source_id))?;
    }
    tx.commit().await.wrap_err("Failed to commit serial relations")?;

    Ok(())
}
