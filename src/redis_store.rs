use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use crate::ledger::{
    CreditProfile, CreditTransaction, LedgerError, LedgerStore, TransactionKind,
};

/// Document-style ledger backend: one hash per profile, one hash per
/// transaction record, and a per-profile sorted-set index. Every mutation is
/// a single Lua script so the balance change and the transaction append
/// cannot come apart, and the decrement is conditional on sufficient balance.
#[derive(Clone, Debug)]
pub struct RedisLedger {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisLedgerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("profile {profile_id} not found")]
    ProfileNotFound { profile_id: i64 },
    #[error("insufficient credits: required={required} available={available}")]
    Insufficient { required: i64, available: i64 },
}

impl From<RedisLedgerError> for LedgerError {
    fn from(err: RedisLedgerError) -> Self {
        match err {
            RedisLedgerError::Insufficient {
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

const GET_OR_CREATE_SCRIPT: &str = r#"
local profile_key = KEYS[1]
local profiles_key = KEYS[2]
local seq_key = KEYS[3]

local user_id = ARGV[1]
local ts_ms = ARGV[2]

if redis.call("EXISTS", profile_key) == 0 then
  local id = redis.call("INCR", seq_key)
  redis.call("HSET", profile_key,
    "id", id,
    "user_id", user_id,
    "credits_balance", 0,
    "created_at_ms", ts_ms,
    "updated_at_ms", ts_ms)
  redis.call("SADD", profiles_key, user_id)
end

local values = redis.call("HMGET", profile_key, "id", "credits_balance", "created_at_ms", "updated_at_ms")
return { tostring(values[1]), tostring(values[2]), tostring(values[3]), tostring(values[4]) }
"#;

const DEDUCT_SCRIPT: &str = r#"
local profile_key = KEYS[1]
local txn_seq_key = KEYS[2]

local prefix = ARGV[1]
local amount = tonumber(ARGV[2]) or 0
local ts_ms = ARGV[3]
local description = ARGV[4]

if redis.call("EXISTS", profile_key) == 0 then
  return { "ERR", "missing" }
end

local balance = tonumber(redis.call("HGET", profile_key, "credits_balance") or "0") or 0
if balance < amount then
  return { "ERR", "insufficient", tostring(balance) }
end

local new_balance = redis.call("HINCRBY", profile_key, "credits_balance", -amount)
redis.call("HSET", profile_key, "updated_at_ms", ts_ms)

local profile_id = redis.call("HGET", profile_key, "id")
local txn_id = redis.call("INCR", txn_seq_key)
local member = string.format("%020d", txn_id)
redis.call("HSET", prefix .. ":txn:" .. member,
  "id", txn_id,
  "profile_id", profile_id,
  "amount", -amount,
  "kind", "deduct",
  "description", description,
  "created_at_ms", ts_ms)
redis.call("ZADD", prefix .. ":txn_by_profile:" .. profile_id, txn_id, member)
return { "OK", tostring(new_balance) }
"#;

const CREDIT_SCRIPT: &str = r#"
local profile_key = KEYS[1]
local txn_seq_key = KEYS[2]

local prefix = ARGV[1]
local amount = tonumber(ARGV[2]) or 0
local ts_ms = ARGV[3]
local description = ARGV[4]

if redis.call("EXISTS", profile_key) == 0 then
  return { "ERR", "missing" }
end

local new_balance = redis.call("HINCRBY", profile_key, "credits_balance", amount)
redis.call("HSET", profile_key, "updated_at_ms", ts_ms)

local profile_id = redis.call("HGET", profile_key, "id")
local txn_id = redis.call("INCR", txn_seq_key)
local member = string.format("%020d", txn_id)
redis.call("HSET", prefix .. ":txn:" .. member,
  "id", txn_id,
  "profile_id", profile_id,
  "amount", amount,
  "kind", "add",
  "description", description,
  "created_at_ms", ts_ms)
redis.call("ZADD", prefix .. ":txn_by_profile:" .. profile_id, txn_id, member)
return { "OK", tostring(new_balance) }
"#;

impl RedisLedger {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisLedgerError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "credit_gate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisLedgerError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_profile(&self, user_id: &str) -> String {
        format!("{}:profile:{user_id}", self.prefix)
    }

    fn key_profiles(&self) -> String {
        format!("{}:profiles", self.prefix)
    }

    fn key_profile_seq(&self) -> String {
        format!("{}:profile_seq", self.prefix)
    }

    fn key_transaction_seq(&self) -> String {
        format!("{}:txn_seq", self.prefix)
    }

    fn key_transaction(&self, member: &str) -> String {
        format!("{}:txn:{member}", self.prefix)
    }

    fn key_transactions_by_profile(&self, profile_id: i64) -> String {
        format!("{}:txn_by_profile:{profile_id}", self.prefix)
    }

    pub async fn get_or_create_profile(
        &self,
        user_id: &str,
    ) -> Result<CreditProfile, RedisLedgerError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();

        let script = redis::Script::new(GET_OR_CREATE_SCRIPT);
        let result: Vec<String> = script
            .key(self.key_profile(user_id))
            .key(self.key_profiles())
            .key(self.key_profile_seq())
            .arg(user_id)
            .arg(ts_ms)
            .invoke_async(&mut conn)
            .await?;

        if result.len() < 4 {
            return Err(unexpected_script_response());
        }
        Ok(CreditProfile {
            id: parse_i64(result.first()),
            user_id: user_id.to_string(),
            credits_balance: parse_i64(result.get(1)),
            created_at_ms: parse_u64(result.get(2)),
            updated_at_ms: parse_u64(result.get(3)),
        })
    }

    pub async fn deduct(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, RedisLedgerError> {
        self.apply_transaction(profile, amount, TransactionKind::Deduct, description)
            .await
    }

    pub async fn credit(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, RedisLedgerError> {
        self.apply_transaction(profile, amount, TransactionKind::Add, description)
            .await
    }

    async fn apply_transaction(
        &self,
        profile: &CreditProfile,
        amount: i64,
        kind: TransactionKind,
        description: &str,
    ) -> Result<CreditProfile, RedisLedgerError> {
        let mut conn = self.connection().await?;
        let ts_ms = now_millis();

        let script = match kind {
            TransactionKind::Deduct => redis::Script::new(DEDUCT_SCRIPT),
            TransactionKind::Add => redis::Script::new(CREDIT_SCRIPT),
        };
        let result: Vec<String> = script
            .key(self.key_profile(&profile.user_id))
            .key(self.key_transaction_seq())
            .arg(self.prefix.clone())
            .arg(amount)
            .arg(ts_ms)
            .arg(description)
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(|s| s.as_str()) {
            Some("OK") => Ok(CreditProfile {
                id: profile.id,
                user_id: profile.user_id.clone(),
                credits_balance: parse_i64(result.get(1)),
                created_at_ms: profile.created_at_ms,
                updated_at_ms: i64_to_u64(ts_ms),
            }),
            Some("ERR") if result.get(1).map(|s| s.as_str()) == Some("insufficient") => {
                Err(RedisLedgerError::Insufficient {
                    required: amount,
                    available: parse_i64(result.get(2)),
                })
            }
            Some("ERR") if result.get(1).map(|s| s.as_str()) == Some("missing") => {
                Err(RedisLedgerError::ProfileNotFound {
                    profile_id: profile.id,
                })
            }
            _ => Err(unexpected_script_response()),
        }
    }

    pub async fn list_profiles(&self) -> Result<Vec<CreditProfile>, RedisLedgerError> {
        let mut conn = self.connection().await?;
        let mut user_ids: Vec<String> = conn.smembers(self.key_profiles()).await?;
        user_ids.sort();

        let mut profiles = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let raw: HashMap<String, String> = conn.hgetall(self.key_profile(&user_id)).await?;
            if raw.is_empty() {
                continue;
            }
            profiles.push(profile_from_hash(&user_id, &raw));
        }
        profiles.sort_by_key(|profile| profile.id);
        Ok(profiles)
    }

    pub async fn list_transactions(
        &self,
        profile_id: i64,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, RedisLedgerError> {
        let limit = limit.clamp(1, 1000);
        let mut conn = self.connection().await?;

        let members: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.key_transactions_by_profile(profile_id))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        let mut transactions = Vec::with_capacity(members.len());
        for member in members {
            let raw: HashMap<String, String> = conn.hgetall(self.key_transaction(&member)).await?;
            if raw.is_empty() {
                continue;
            }
            let Some(kind) = raw
                .get("kind")
                .and_then(|value| TransactionKind::parse(value))
            else {
                continue;
            };
            transactions.push(CreditTransaction {
                id: parse_i64(raw.get("id")),
                profile_id: parse_i64(raw.get("profile_id")),
                amount: parse_i64(raw.get("amount")),
                kind,
                description: raw
                    .get("description")
                    .filter(|value| !value.is_empty())
                    .cloned(),
                created_at_ms: parse_u64(raw.get("created_at_ms")),
            });
        }
        Ok(transactions)
    }
}

#[async_trait]
impl LedgerStore for RedisLedger {
    async fn get_or_create_profile(&self, user_id: &str) -> Result<CreditProfile, LedgerError> {
        RedisLedger::get_or_create_profile(self, user_id)
            .await
            .map_err(Into::into)
    }

    async fn deduct(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        RedisLedger::deduct(self, profile, amount, description)
            .await
            .map_err(Into::into)
    }

    async fn credit(
        &self,
        profile: &CreditProfile,
        amount: i64,
        description: &str,
    ) -> Result<CreditProfile, LedgerError> {
        RedisLedger::credit(self, profile, amount, description)
            .await
            .map_err(Into::into)
    }

    async fn list_profiles(&self) -> Result<Vec<CreditProfile>, LedgerError> {
        RedisLedger::list_profiles(self).await.map_err(Into::into)
    }

    async fn list_transactions(
        &self,
        profile_id: i64,
        limit: usize,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        RedisLedger::list_transactions(self, profile_id, limit)
            .await
            .map_err(Into::into)
    }
}

fn profile_from_hash(user_id: &str, raw: &HashMap<String, String>) -> CreditProfile {
    CreditProfile {
        id: parse_i64(raw.get("id")),
        user_id: user_id.to_string(),
        credits_balance: parse_i64(raw.get("credits_balance")),
        created_at_ms: parse_u64(raw.get("created_at_ms")),
        updated_at_ms: parse_u64(raw.get("updated_at_ms")),
    }
}

fn parse_i64<S: AsRef<str>>(value: Option<S>) -> i64 {
    value
        .and_then(|raw| raw.as_ref().parse::<i64>().ok())
        .unwrap_or(0)
}

fn parse_u64<S: AsRef<str>>(value: Option<S>) -> u64 {
    value
        .and_then(|raw| raw.as_ref().parse::<u64>().ok())
        .unwrap_or(0)
}

fn unexpected_script_response() -> RedisLedgerError {
    redis::RedisError::from((
        redis::ErrorKind::ResponseError,
        "unexpected redis script response",
    ))
    .into()
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

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn test_store() -> Option<RedisLedger> {
        let url = env_nonempty("CREDIT_GATE_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))?;
        let prefix = format!("credit_gate_test:{}", now_millis());
        Some(
            RedisLedger::new(url)
                .expect("redis client")
                .with_prefix(prefix),
        )
    }

    #[tokio::test]
    async fn redis_ledger_full_cycle() {
        let Some(store) = test_store() else {
            return;
        };
        store.ping().await.expect("ping");

        let profile = store.get_or_create_profile("alice").await.expect("create");
        assert_eq!(profile.credits_balance, 0);
        let again = store.get_or_create_profile("alice").await.expect("fetch");
        assert_eq!(profile.id, again.id);

        let profile = store
            .credit(&profile, 10, "Added 10 credits")
            .await
            .expect("credit");
        assert_eq!(profile.credits_balance, 10);

        let profile = store
            .deduct(&profile, 4, "Used 4 credits for endpoint /v1/run/echo")
            .await
            .expect("deduct");
        assert_eq!(profile.credits_balance, 6);

        let err = store.deduct(&profile, 7, "charge").await;
        assert!(matches!(
            err,
            Err(RedisLedgerError::Insufficient {
                required: 7,
                available: 6
            })
        ));

        let transactions = store
            .list_transactions(profile.id, 100)
            .await
            .expect("transactions");
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].kind, TransactionKind::Deduct);
        assert_eq!(transactions[0].amount, -4);
        assert_eq!(transactions[1].kind, TransactionKind::Add);
        assert_eq!(transactions[1].amount, 10);

        let profiles = store.list_profiles().await.expect("profiles");
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].user_id, "alice");
        assert_eq!(profiles[0].credits_balance, 6);
    }

    #[tokio::test]
    async fn redis_ledger_rejects_unknown_profile() {
        let Some(store) = test_store() else {
            return;
        };
        let ghost = CreditProfile {
            id: 42,
            user_id: "ghost".to_string(),
            credits_balance: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let err = store.deduct(&ghost, 1, "charge").await;
        assert!(matches!(
            err,
            Err(RedisLedgerError::ProfileNotFound { profile_id: 42 })
        ));
    }
}
