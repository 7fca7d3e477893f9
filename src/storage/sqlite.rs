//! SQLite Ledger
//!
//! Durable deposits, withdrawals and balances. Uses connection pooling via
//! r2d2; every state transition is a single guarded statement or one
//! IMMEDIATE transaction, so several gateway processes can share the file.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::traits::{
    BroadcastOutcome, DepositLedger, InsertOutcome, LedgerError, LedgerResult, SettleOutcome,
    WithdrawalLedger,
};
use crate::types::{DepositRecord, DepositStatus, WithdrawalRecord, WithdrawalStatus};

const DEPOSIT_COLUMNS: &str = "id, tx_hash, user_identity, amount, amount_units, from_address, \
     status, confirmation_count, required_confirmations, block_timestamp, created_at, settled_at";

const WITHDRAWAL_COLUMNS: &str = "id, user_identity, amount, destination_address, status, \
     tx_hash, requested_at, processed_at, claim_token, claimed_at, signed_tx_id, signed_expires_at, \
     attempts, error";

/// SQLite-backed ledger with connection pooling
pub struct SqliteLedger {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLedger {
    /// Open (or create) the ledger at `db_path` and run migrations
    pub fn new<P: AsRef<Path>>(db_path: P) -> LedgerResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Connection(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
        });
        let pool = Pool::builder().max_size(10).build(manager)?;

        let ledger = Self { pool };
        ledger.run_migrations()?;
        Ok(ledger)
    }

    /// Create an in-memory ledger (for testing)
    pub fn in_memory() -> LedgerResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;

        let ledger = Self { pool };
        ledger.run_migrations()?;
        Ok(ledger)
    }

    fn conn(&self) -> LedgerResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> LedgerResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL UNIQUE,
                user_identity TEXT NOT NULL,
                amount TEXT NOT NULL,
                amount_units TEXT NOT NULL,
                from_address TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                confirmation_count INTEGER NOT NULL DEFAULT 0,
                required_confirmations INTEGER NOT NULL,
                block_timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                settled_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(status);

            CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                user_identity TEXT NOT NULL,
                amount TEXT NOT NULL,
                destination_address TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                tx_hash TEXT UNIQUE,
                requested_at INTEGER NOT NULL,
                processed_at INTEGER,
                claim_token TEXT,
                claimed_at INTEGER,
                signed_tx_id TEXT,
                signed_expires_at INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_withdrawals_status
                ON withdrawals(status, requested_at);

            CREATE TABLE IF NOT EXISTS balances (
                user_identity TEXT PRIMARY KEY,
                balance_units TEXT NOT NULL DEFAULT '0',
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    fn row_to_deposit(row: &rusqlite::Row) -> rusqlite::Result<DepositRecord> {
        Ok(DepositRecord {
            id: row.get("id")?,
            tx_hash: row.get("tx_hash")?,
            user_identity: row.get("user_identity")?,
            amount: parse_text(row, "amount")?,
            amount_units: parse_text(row, "amount_units")?,
            from_address: row.get("from_address")?,
            status: parse_text::<DepositStatus>(row, "status")?,
            confirmation_count: row.get::<_, i64>("confirmation_count")? as u32,
            required_confirmations: row.get::<_, i64>("required_confirmations")? as u32,
            block_timestamp: row.get::<_, i64>("block_timestamp")? as u64,
            created_at: row.get::<_, i64>("created_at")? as u64,
            settled_at: row.get::<_, Option<i64>>("settled_at")?.map(|v| v as u64),
        })
    }

    fn row_to_withdrawal(row: &rusqlite::Row) -> rusqlite::Result<WithdrawalRecord> {
        Ok(WithdrawalRecord {
            id: row.get("id")?,
            user_identity: row.get("user_identity")?,
            amount: parse_text(row, "amount")?,
            destination_address: row.get("destination_address")?,
            status: parse_text::<WithdrawalStatus>(row, "status")?,
            tx_hash: row.get("tx_hash")?,
            requested_at: row.get::<_, i64>("requested_at")? as u64,
            processed_at: row.get::<_, Option<i64>>("processed_at")?.map(|v| v as u64),
            claim_token: row.get("claim_token")?,
            claimed_at: row.get::<_, Option<i64>>("claimed_at")?.map(|v| v as u64),
            signed_tx_id: row.get("signed_tx_id")?,
            signed_expires_at: row
                .get::<_, Option<i64>>("signed_expires_at")?
                .map(|v| v as u64),
            attempts: row.get::<_, i64>("attempts")? as u32,
            error: row.get("error")?,
        })
    }

    fn query_deposits(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> LedgerResult<Vec<DepositRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM deposits {}", DEPOSIT_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(args, Self::row_to_deposit)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn query_withdrawals(
        &self,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> LedgerResult<Vec<WithdrawalRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM withdrawals {}", WITHDRAWAL_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(args, Self::row_to_withdrawal)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // Synchronous helpers for the trait implementations

    fn insert_deposit_sync(&self, record: &DepositRecord) -> LedgerResult<InsertOutcome> {
        let conn = self.conn()?;

        let inserted = conn.execute(
            r#"
            INSERT INTO deposits (
                id, tx_hash, user_identity, amount, amount_units, from_address,
                status, confirmation_count, required_confirmations, block_timestamp,
                created_at, settled_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(tx_hash) DO NOTHING
            "#,
            params![
                record.id,
                record.tx_hash,
                record.user_identity,
                record.amount.to_string(),
                record.amount_units.to_string(),
                record.from_address,
                record.status.to_string(),
                record.confirmation_count as i64,
                record.required_confirmations as i64,
                record.block_timestamp as i64,
                record.created_at as i64,
                record.settled_at.map(|v| v as i64),
            ],
        )?;

        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    fn update_confirmations_sync(&self, id: &str, observed: u32) -> LedgerResult<u32> {
        let conn = self.conn()?;
        let stored: Option<i64> = conn
            .query_row(
                "UPDATE deposits SET confirmation_count = MAX(confirmation_count, ?2)
                 WHERE id = ?1 RETURNING confirmation_count",
                params![id, observed as i64],
                |row| row.get(0),
            )
            .optional()?;

        stored
            .map(|c| c as u32)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    fn settle_deposit_sync(&self, id: &str, settled_at: u64) -> LedgerResult<SettleOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, i64, i64, String, String)> = tx
            .query_row(
                "SELECT status, confirmation_count, required_confirmations, amount_units, user_identity
                 FROM deposits WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let Some((status, have, need, amount_units, user)) = row else {
            return Err(LedgerError::NotFound(id.to_string()));
        };
        if status == DepositStatus::Completed.to_string() {
            return Ok(SettleOutcome::AlreadySettled);
        }
        if have < need {
            return Err(LedgerError::InsufficientConfirmations {
                id: id.to_string(),
                have: have as u32,
                need: need as u32,
            });
        }

        let updated = tx.execute(
            "UPDATE deposits SET status = 'completed', settled_at = ?2
             WHERE id = ?1 AND status = 'pending'
               AND confirmation_count >= required_confirmations",
            params![id, settled_at as i64],
        )?;
        if updated == 0 {
            return Ok(SettleOutcome::AlreadySettled);
        }

        // Base units outgrow SQLite's INTEGER on 18-decimal tokens, so the sum
        // is done here under the IMMEDIATE lock and stored as TEXT.
        let amount = parse_units(&amount_units)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT balance_units FROM balances WHERE user_identity = ?1",
                params![user],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.as_deref().map(parse_units).transpose()?.unwrap_or(0);
        let balance = current.checked_add(amount).ok_or_else(|| {
            LedgerError::InvalidData(format!("balance overflow for {}", user))
        })?;

        tx.execute(
            "INSERT INTO balances (user_identity, balance_units, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_identity) DO UPDATE SET
                balance_units = excluded.balance_units,
                updated_at = excluded.updated_at",
            params![user, balance.to_string(), settled_at as i64],
        )?;

        tx.commit()?;
        Ok(SettleOutcome::Settled)
    }

    fn insert_withdrawal_sync(&self, record: &WithdrawalRecord) -> LedgerResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO withdrawals (
                id, user_identity, amount, destination_address, status, tx_hash,
                requested_at, processed_at, claim_token, claimed_at, signed_tx_id,
                signed_expires_at, attempts, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                record.id,
                record.user_identity,
                record.amount.to_string(),
                record.destination_address,
                record.status.to_string(),
                record.tx_hash,
                record.requested_at as i64,
                record.processed_at.map(|v| v as i64),
                record.claim_token,
                record.claimed_at.map(|v| v as i64),
                record.signed_tx_id,
                record.signed_expires_at.map(|v| v as i64),
                record.attempts as i64,
                record.error,
            ],
        )?;
        Ok(())
    }

    fn mark_broadcasted_sync(
        &self,
        id: &str,
        claim_token: &str,
        tx_hash: &str,
        now: u64,
    ) -> LedgerResult<BroadcastOutcome> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE withdrawals SET status = 'broadcasted', tx_hash = ?3, processed_at = ?4, error = NULL
             WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![id, claim_token, tx_hash, now as i64],
        )?;
        if updated == 1 {
            return Ok(BroadcastOutcome::Recorded);
        }

        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM withdrawals WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        match exists {
            Some(_) => Ok(BroadcastOutcome::AlreadyBroadcast),
            None => Err(LedgerError::NotFound(id.to_string())),
        }
    }

    fn release_claim_sync(
        &self,
        id: &str,
        claim_token: &str,
        error: &str,
        max_attempts: u32,
        now: u64,
    ) -> LedgerResult<Option<WithdrawalStatus>> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                r#"
                UPDATE withdrawals SET
                    status = CASE WHEN attempts + 1 >= ?4 THEN 'failed' ELSE 'pending' END,
                    processed_at = CASE WHEN attempts + 1 >= ?4 THEN ?5 ELSE NULL END,
                    attempts = attempts + 1,
                    claim_token = NULL,
                    claimed_at = NULL,
                    signed_tx_id = NULL,
                    signed_expires_at = NULL,
                    error = ?3
                WHERE id = ?1 AND status = 'processing' AND claim_token = ?2
                RETURNING status
                "#,
                params![id, claim_token, error, max_attempts as i64, now as i64],
                |row| row.get(0),
            )
            .optional()?;

        status
            .map(|s| WithdrawalStatus::from_str(&s).map_err(LedgerError::InvalidData))
            .transpose()
    }
}

fn parse_units(raw: &str) -> LedgerResult<u128> {
    raw.parse()
        .map_err(|e| LedgerError::InvalidData(format!("base units {:?}: {}", raw, e)))
}

/// Read a TEXT column through `FromStr`
fn parse_text<T>(row: &rusqlite::Row, name: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let idx = row.as_ref().column_index(name)?;
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("{}: {}", name, e).into())
    })
}

#[async_trait]
impl DepositLedger for SqliteLedger {
    async fn exists_tx_hash(&self, tx_hash: &str) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM deposits WHERE tx_hash = ?1",
                params![tx_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn insert_deposit(&self, record: &DepositRecord) -> LedgerResult<InsertOutcome> {
        self.insert_deposit_sync(record)
    }

    async fn get_deposit(&self, id: &str) -> LedgerResult<Option<DepositRecord>> {
        Ok(self.query_deposits("WHERE id = ?1", &[&id])?.pop())
    }

    async fn get_deposit_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<DepositRecord>> {
        Ok(self.query_deposits("WHERE tx_hash = ?1", &[&tx_hash])?.pop())
    }

    async fn pending_deposits(&self) -> LedgerResult<Vec<DepositRecord>> {
        self.query_deposits("WHERE status = 'pending' ORDER BY created_at, id", &[])
    }

    async fn update_confirmations(&self, id: &str, observed: u32) -> LedgerResult<u32> {
        self.update_confirmations_sync(id, observed)
    }

    async fn settle_deposit(&self, id: &str, settled_at: u64) -> LedgerResult<SettleOutcome> {
        self.settle_deposit_sync(id, settled_at)
    }

    async fn balance_units(&self, user_identity: &str) -> LedgerResult<u128> {
        let conn = self.conn()?;
        let balance: Option<String> = conn
            .query_row(
                "SELECT balance_units FROM balances WHERE user_identity = ?1",
                params![user_identity],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.as_deref().map(parse_units).transpose()?.unwrap_or(0))
    }
}

#[async_trait]
impl WithdrawalLedger for SqliteLedger {
    async fn insert_withdrawal(&self, record: &WithdrawalRecord) -> LedgerResult<()> {
        self.insert_withdrawal_sync(record)
    }

    async fn get_withdrawal(&self, id: &str) -> LedgerResult<Option<WithdrawalRecord>> {
        Ok(self.query_withdrawals("WHERE id = ?1", &[&id])?.pop())
    }

    async fn pending_withdrawals(&self, limit: u32) -> LedgerResult<Vec<WithdrawalRecord>> {
        self.query_withdrawals(
            "WHERE status = 'pending' ORDER BY requested_at, id LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    async fn claim_withdrawal(&self, id: &str, claim_token: &str, now: u64) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE withdrawals SET status = 'processing', claim_token = ?2, claimed_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, claim_token, now as i64],
        )?;
        Ok(updated == 1)
    }

    async fn record_signed_tx(
        &self,
        id: &str,
        claim_token: &str,
        signed_tx_id: &str,
        expires_at: u64,
    ) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE withdrawals SET signed_tx_id = ?3, signed_expires_at = ?4
             WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![id, claim_token, signed_tx_id, expires_at as i64],
        )?;
        Ok(updated == 1)
    }

    async fn mark_broadcasted(
        &self,
        id: &str,
        claim_token: &str,
        tx_hash: &str,
        now: u64,
    ) -> LedgerResult<BroadcastOutcome> {
        self.mark_broadcasted_sync(id, claim_token, tx_hash, now)
    }

    async fn release_claim(
        &self,
        id: &str,
        claim_token: &str,
        error: &str,
        max_attempts: u32,
        now: u64,
    ) -> LedgerResult<Option<WithdrawalStatus>> {
        self.release_claim_sync(id, claim_token, error, max_attempts, now)
    }

    async fn mark_failed(
        &self,
        id: &str,
        claim_token: &str,
        error: &str,
        now: u64,
    ) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE withdrawals SET status = 'failed', error = ?3, processed_at = ?4
             WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![id, claim_token, error, now as i64],
        )?;
        Ok(updated == 1)
    }

    async fn fail_orphaned(&self, id: &str, error: &str, now: u64) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE withdrawals SET status = 'failed', error = ?2, processed_at = ?3
             WHERE id = ?1 AND status = 'processing' AND claim_token IS NULL",
            params![id, error, now as i64],
        )?;
        Ok(updated == 1)
    }

    async fn stale_processing(&self, claimed_before: u64) -> LedgerResult<Vec<WithdrawalRecord>> {
        self.query_withdrawals(
            "WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at <= ?1)
             ORDER BY claimed_at, id",
            &[&(claimed_before as i64)],
        )
    }
}
