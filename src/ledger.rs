//! Per-user credit ledger: balance rows, the append-only transaction log,
//! and the storage capability the gate charges through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One ledger row per user. Created lazily with a zero balance on the first
/// gated call and never deleted by this subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditProfile {
    pub id: i64,
    pub user_id: String,
    pub credits_balance: i64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Deduct,
    Add,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deduct => "deduct",
            TransactionKind::Add => "add",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deduct" => Some(TransactionKind::Deduct),
            "add" => Some(TransactionKind::Add),
            _ => None,
        }
    }
}

/// Append-only audit record. `amount` is signed: negative for deductions,
/// positive for top-ups. Summing `amount` over a profile's transactions
/// reproduces its balance relative to the initial zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub profile_id: i64,
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: required={required} available={available}")]
    Insufficient { required: i64, available: i64 },
    #[error("ledger backend error: {message}")]
    Backend { message: String },
}

impl LedgerError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        LedgerError::Backend {
            message: err.to_string(),
        }
    }
}

/// Storage capability behind the gate. Implementations are selected once at
/// composition time; gate logic never branches on the backend.
///
/// `deduct` and `credit` take non-negative amounts and must apply the balance
/// change and the transaction append atomically. A deduction that would drive
/// the balance negative fails with [`LedgerError::Insufficient`] carrying the
/// balance observed at decision time.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Returns the existing ledger row for `user_id` or creates one with a
    /// zero balance. Concurrent calls for the same user must not produce
    /// duplicate rows; the backend's uniqueness constraint on `user_id` is
    /// the enforcement mechanism.
    async fn get_or_create_profile(&self, user_id: &str) -> Result<CreditProfile, LedgerError>;

    /// Decrements the balance by `amount` and appends a `deduct` transaction
    /// with `-amount`, returning the updated row.
    async fn deduct(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError>;

    /// Increments the balance by `amount` and appends an `add` transaction,
    /// returning the updated row. This is the top-up path; the gate itself
    /// never calls it.
    async fn credit(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError>;

    async fn list_profiles(&self) -> Result<Vec<CreditProfile>, LedgerError>;

    /// Newest-first transaction log for one ledger row.
    async fn list_transactions(
        &self,
        profile_id: i64,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_kind_round_trips_tags() {
        assert_eq!(TransactionKind::parse("deduct"), Some(TransactionKind::Deduct));
        assert_eq!(TransactionKind::parse("add"), Some(TransactionKind::Add));
        assert_eq!(TransactionKind::parse("refund"), None);
        assert_eq!(TransactionKind::Deduct.as_str(), "deduct");
        assert_eq!(TransactionKind::Add.as_str(), "add");
    }

    #[test]
    fn transaction_kind_serializes_lowercase() {
        let json = serde_json::to_string(&TransactionKind::Deduct).expect("serialize");
        assert_eq!(json, r#""deduct""#);
        let parsed: TransactionKind = serde_json::from_str(r#""add""#).expect("deserialize");
        assert_eq!(parsed, TransactionKind::Add);
    }
}
