//! Pre-paid credit metering gate: a per-user credit ledger with pluggable
//! storage backends and a gate that charges before running business logic.

pub mod config;
pub mod gate;
pub mod ledger;
pub mod memory_store;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "store-redis")]
pub mod redis_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use config::{ConfigError, PrincipalConfig, ServiceConfig, StoreConfig};
pub use gate::{CreditGate, GateError, Principal, RequestContext};
pub use ledger::{
    CreditProfile, CreditTransaction, LedgerError, LedgerStore, TransactionKind,
};
pub use memory_store::MemoryLedger;

#[cfg(feature = "http")]
pub use http::{GateHttpState, router};
#[cfg(feature = "store-redis")]
pub use redis_store::{RedisLedger, RedisLedgerError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteLedger, SqliteLedgerError};
