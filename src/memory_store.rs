//! In-memory ledger used when no persistent backend is configured, and as
//! the store of choice in tests. State is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ledger::{
    CreditProfile, CreditTransaction, LedgerError, LedgerStore, TransactionKind,
};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<MemoryLedgerState>,
}

#[derive(Debug, Default)]
struct MemoryLedgerState {
    profiles: HashMap<String, CreditProfile>,
    transactions: Vec<CreditTransaction>,
    next_profile_id: i64,
    next_transaction_id: i64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of recorded transactions, across all profiles.
    pub async fn transaction_count(&self) -> usize {
        self.inner.lock().await.transactions.len()
    }
}

impl MemoryLedgerState {
    fn apply(
        &mut self,
        profile_id: i64,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        let ts_ms = now_millis();
        let profile = self
            .profiles
            .values_mut()
            .find(|profile| profile.id == profile_id)
            .ok_or_else(|| LedgerError::backend(format!("profile {profile_id} not found")))?;

        let delta = match kind {
            TransactionKind::Deduct => {
                if profile.credits_balance < amount {
                    return Err(LedgerError::Insufficient {
                        required: amount,
                        available: profile.credits_balance,
                    });
                }
                -amount
            }
            TransactionKind::Add => amount,
        };

        profile.credits_balance += delta;
        profile.updated_at_ms = ts_ms;
        let updated = profile.clone();

        self.next_transaction_id += 1;
        self.transactions.push(CreditTransaction {
            id: self.next_transaction_id,
            profile_id,
            amount: delta,
            kind,
            description: Some(description.to_string()),
            created_at_ms: ts_ms,
        });

        Ok(updated)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_or_create_profile(&self, user_id: &str) -> Result<CreditProfile, LedgerError> {
        let mut state = self.inner.lock().await;
        if let Some(profile) = state.profiles.get(user_id) {
            return Ok(profile.clone());
        }
        let ts_ms = now_millis();
        state.next_profile_id += 1;
        let profile = CreditProfile {
            id: state.next_profile_id,
            user_id: user_id.to_string(),
            credits_balance: 0,
            created_at_ms: ts_ms,
            updated_at_ms: ts_ms,
        };
        state.profiles.insert(user_id.to_string(), profile.clone());
        Ok(profile)
    }

    async fn deduct(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        let mut state = self.inner.lock().await;
        state.apply(profile.id, amount, TransactionKind::Deduct, description)
    }

    async fn credit(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        let mut state = self.inner.lock().await;
        state.apply(profile.id, amount, TransactionKind::Add, description)
    }

    async fn list_profiles(&self) -> Result<Vec<CreditProfile>, LedgerError> {
        let state = self.inner.lock().await;
        let mut profiles: Vec<CreditProfile> = state.profiles.values().cloned().collect();
        profiles.sort_by_key(|profile| profile.id);
        Ok(profiles)
    }

    async fn list_transactions(
        &self,
        profile_id: i64,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let limit = limit.clamp(1, 1000);
        let state = self.inner.lock().await;
        let mut transactions: Vec<CreditTransaction> = state
            .transactions
            .iter()
            .filter(|txn| txn.profile_id == profile_id)
            .cloned()
            .collect();
        transactions.sort_by_key(|txn| std::cmp::Reverse(txn.id));
        transactions.truncate(limit);
        Ok(transactions)
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
