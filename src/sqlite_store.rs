use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::ledger::{
    CreditProfile, CreditTransaction, LedgerError, LedgerStore, TransactionKind,
};

/// Relational ledger backend. Connections are opened per call on a blocking
/// thread; the balance update and the transaction append share one SQL
/// transaction, and the decrement is conditional on sufficient balance so a
/// lost race surfaces as `Insufficient` instead of a negative balance.
#[derive(Clone, Debug)]
pub struct SqliteLedger {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteLedgerError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("profile {profile_id} not found")]
    ProfileNotFound { profile_id: i64 },
    #[error("unknown transaction kind: {kind}")]
    UnknownKind { kind: String },
    #[error("insufficient credits: required={required} available={available}")]
    Insufficient { required: i64, available: i64 },
}

impl From<SqliteLedgerError> for LedgerError {
    fn from(err: SqliteLedgerError) -> Self {
        match err {
            SqliteLedgerError::Insufficient {
                required,
                available,
            } => LedgerError::Insufficient {
                required,
                available,
            },
            other => LedgerError::backend(other),
        }
    }
}

impl SqliteLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteLedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteLedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn get_or_create_profile(
        &self,
        user_id: &str,
    ) -> Result<CreditProfile, SqliteLedgerError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<CreditProfile, SqliteLedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let ts_ms = now_millis();
            conn.execute(
                "INSERT OR IGNORE INTO credit_profile (user_id, credits_balance, created_at_ms, updated_at_ms)
                 VALUES (?1, 0, ?2, ?2)",
                rusqlite::params![user_id, ts_ms],
            )?;

            let profile = conn.query_row(
                "SELECT id, user_id, credits_balance, created_at_ms, updated_at_ms
                 FROM credit_profile WHERE user_id = ?1",
                rusqlite::params![user_id],
                profile_from_row,
            )?;
            Ok(profile)
        })
        .await?
    }

    pub async fn deduct(
        &self,
        profile_id: i64,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, SqliteLedgerError> {
        self.apply_transaction(profile_id, amount, TransactionKind::Deduct, description)
            .await
    }

    pub async fn credit(
        &self,
        profile_id: i64,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, SqliteLedgerError> {
        self.apply_transaction(profile_id, amount, TransactionKind::Add, description)
            .await
    }

    async fn apply_transaction(
        &self,
        profile_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<CreditProfile, SqliteLedgerError> {
        let path = self.path.clone();
        let description = description.to_string();
        tokio::task::spawn_blocking(move || -> Result<CreditProfile, SqliteLedgerError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            let ts_ms = now_millis();

            let (delta, updated) = match kind {
                TransactionKind::Deduct => {
                    let updated = tx.execute(
                        "UPDATE credit_profile
                         SET credits_balance = credits_balance - ?1, updated_at_ms = ?2
                         WHERE id = ?3 AND credits_balance >= ?1",
                        rusqlite::params![amount, ts_ms, profile_id],
                    )?;
                    (-amount, updated)
                }
                TransactionKind::Add => {
                    let updated = tx.execute(
                        "UPDATE credit_profile
                         SET credits_balance = credits_balance + ?1, updated_at_ms = ?2
                         WHERE id = ?3",
                        rusqlite::params![amount, ts_ms, profile_id],
                    )?;
                    (amount, updated)
                }
            };

            if updated == 0 {
                let balance: Option<i64> = tx
                    .query_row(
                        "SELECT credits_balance FROM credit_profile WHERE id = ?1",
                        rusqlite::params![profile_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return match balance {
                    Some(available) => Err(SqliteLedgerError::Insufficient {
                        required: amount,
                        available,
                    }),
                    None => Err(SqliteLedgerError::ProfileNotFound { profile_id }),
                };
            }

            tx.execute(
                "INSERT INTO credit_transaction (profile_id, amount, kind, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![profile_id, delta, kind.as_str(), description, ts_ms],
            )?;

            let profile = tx.query_row(
                "SELECT id, user_id, credits_balance, created_at_ms, updated_at_ms
                 FROM credit_profile WHERE id = ?1",
                rusqlite::params![profile_id],
                profile_from_row,
            )?;
            tx.commit()?;
            Ok(profile)
        })
        .await?
    }

    pub async fn list_profiles(&self) -> Result<Vec<CreditProfile>, SqliteLedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<CreditProfile>, SqliteLedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, user_id, credits_balance, created_at_ms, updated_at_ms
                 FROM credit_profile ORDER BY id",
            )?;
            let rows = stmt.query_map([], profile_from_row)?;

            let mut profiles = Vec::new();
            for row in rows {
                profiles.push(row?);
            }
            Ok(profiles)
        })
        .await?
    }

    pub async fn list_transactions(
        &self,
        profile_id: i64,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, SqliteLedgerError> {
        let path = self.path.clone();
        let limit = limit.clamp(1, 1000);
        tokio::task::spawn_blocking(
            move || -> Result<Vec<CreditTransaction>, SqliteLedgerError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;

                let mut stmt = conn.prepare(
                    "SELECT id, profile_id, amount, kind, description, created_at_ms
                     FROM credit_transaction WHERE profile_id = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![profile_id, limit as i64],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )?;

                let mut transactions = Vec::new();
                for row in rows {
                    let (id, profile_id, amount, kind, description, created_at_ms) = row?;
                    let kind = TransactionKind::parse(&kind)
                        .ok_or_else(|| SqliteLedgerError::UnknownKind { kind: kind.clone() })?;
                    transactions.push(CreditTransaction {
                        id,
                        profile_id,
                        amount,
                        kind,
                        description,
                        created_at_ms: i64_to_u64(created_at_ms),
                    });
                }
                Ok(transactions)
            },
        )
        .await?
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn get_or_create_profile(&self, user_id: &str) -> Result<CreditProfile, LedgerError> {
        SqliteLedger::get_or_create_profile(self, user_id)
            .await
            .map_err(Into::into)
    }

    async fn deduct(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        SqliteLedger::deduct(self, profile.id, amount, description)
            .await
            .map_err(Into::into)
    }

    async fn credit(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        SqliteLedger::credit(self, profile.id, amount, description)
            .await
            .map_err(Into::into)
    }

    async fn list_profiles(&self) -> Result<Vec<CreditProfile>, LedgerError> {
        SqliteLedger::list_profiles(self).await.map_err(Into::into)
    }

    async fn list_transactions(
        &self,
        profile_id: i64,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        SqliteLedger::list_transactions(self, profile_id, limit)
            .await
            .map_err(Into::into)
    }
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CreditProfile> {
    Ok(CreditProfile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        credits_balance: row.get(2)?,
        created_at_ms: i64_to_u64(row.get(3)?),
        updated_at_ms: i64_to_u64(row.get(4)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credit_profile (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL UNIQUE,
            credits_balance INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS credit_transaction (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id INTEGER NOT NULL REFERENCES credit_profile(id),
            amount INTEGER NOT NULL,
            kind TEXT NOT NULL,
            description TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_transaction_profile
            ON credit_transaction(profile_id, id);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, SqliteLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteLedger::new(dir.path().join("ledger.sqlite"));
        store.init().await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn creates_profile_once_per_user() {
        let (_dir, store) = temp_store().await;
        let first = store.get_or_create_profile("alice").await.expect("create");
        assert_eq!(first.credits_balance, 0);

        let second = store.get_or_create_profile("alice").await.expect("fetch");
        assert_eq!(first.id, second.id);

        let other = store.get_or_create_profile("bob").await.expect("create");
        assert_ne!(first.id, other.id);
        assert_eq!(store.list_profiles().await.expect("profiles").len(), 2);
    }

    #[tokio::test]
    async fn credit_and_deduct_update_balance_and_log() {
        let (_dir, store) = temp_store().await;
        let profile = store.get_or_create_profile("alice").await.expect("create");

        let profile = store
            .credit(profile.id, 10, "Added 10 credits")
            .await
            .expect("credit");
        assert_eq!(profile.credits_balance, 10);

        let profile = store
            .deduct(profile.id, 4, "Used 4 credits for endpoint /v1/run/echo")
            .await
            .expect("deduct");
        assert_eq!(profile.credits_balance, 6);

        let transactions = store
            .list_transactions(profile.id, 100)
            .await
            .expect("transactions");
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].kind, TransactionKind::Deduct);
        assert_eq!(transactions[0].amount, -4);
        assert_eq!(
            transactions[0].description.as_deref(),
            Some("Used 4 credits for endpoint /v1/run/echo")
        );
        assert_eq!(transactions[1].kind, TransactionKind::Add);
        assert_eq!(transactions[1].amount, 10);

        let total: i64 = transactions.iter().map(|txn| txn.amount).sum();
        assert_eq!(total, profile.credits_balance);
    }

    #[tokio::test]
    async fn deduct_is_rejected_when_balance_is_short() {
        let (_dir, store) = temp_store().await;
        let profile = store.get_or_create_profile("alice").await.expect("create");
        let profile = store.credit(profile.id, 3, "seed").await.expect("credit");

        let err = store.deduct(profile.id, 5, "charge").await;
        assert!(matches!(
            err,
            Err(SqliteLedgerError::Insufficient {
                required: 5,
                available: 3
            })
        ));

        let profile = store.get_or_create_profile("alice").await.expect("fetch");
        assert_eq!(profile.credits_balance, 3);
        assert_eq!(
            store
                .list_transactions(profile.id, 100)
                .await
                .expect("transactions")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn deduct_spends_exact_balance_to_zero() {
        let (_dir, store) = temp_store().await;
        let profile = store.get_or_create_profile("alice").await.expect("create");
        let profile = store.credit(profile.id, 5, "seed").await.expect("credit");

        let profile = store.deduct(profile.id, 5, "charge").await.expect("deduct");
        assert_eq!(profile.credits_balance, 0);

        let err = store.deduct(profile.id, 1, "charge").await;
        assert!(matches!(
            err,
            Err(SqliteLedgerError::Insufficient {
                required: 1,
                available: 0
            })
        ));
    }

    #[tokio::test]
    async fn zero_amount_deduct_still_appends_a_record() {
        let (_dir, store) = temp_store().await;
        let profile = store.get_or_create_profile("alice").await.expect("create");

        let profile = store.deduct(profile.id, 0, "free call").await.expect("deduct");
        assert_eq!(profile.credits_balance, 0);

        let transactions = store
            .list_transactions(profile.id, 100)
            .await
            .expect("transactions");
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, 0);
    }

    #[tokio::test]
    async fn unknown_profile_is_reported() {
        let (_dir, store) = temp_store().await;
        let err = store.deduct(999, 1, "charge").await;
        assert!(matches!(
            err,
            Err(SqliteLedgerError::ProfileNotFound { profile_id: 999 })
        ));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.sqlite");

        let store = SqliteLedger::new(&path);
        store.init().await.expect("init");
        let profile = store.get_or_create_profile("alice").await.expect("create");
        store.credit(profile.id, 8, "seed").await.expect("credit");
        drop(store);

        let reopened = SqliteLedger::new(&path);
        let profile = reopened
            .get_or_create_profile("alice")
            .await
            .expect("fetch");
        assert_eq!(profile.credits_balance, 8);
        assert_eq!(
            reopened
                .list_transactions(profile.id, 10)
                .await
                .expect("transactions")
                .len(),
            1
        );
    }
}
