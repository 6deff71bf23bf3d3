//! Hookgate Storage
//!
//! Narrow interfaces over the storage engines the core depends on:
//! - `KvStore`: TTL-bounded key-value store with atomic conditional writes,
//!   backing the idempotency ledger, the installation cache and OAuth state tokens
//! - `InstallationRepository`: durable per-tenant credential storage
//!
//! In-memory implementations are always available; Redis and PostgreSQL
//! backends sit behind the `redis` and `postgres` features.

pub mod installation;
pub mod kv;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use thiserror::Error;

pub use installation::{InstallationRepository, MemoryInstallationRepository};
pub use kv::{KvStore, MemoryKvStore};

#[cfg(feature = "postgres")]
pub use postgres::PostgresInstallationRepository;
#[cfg(feature = "redis")]
pub use self::redis::RedisKvStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record for {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

impl From<StoreError> for hg_common::HookgateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(message) => hg_common::HookgateError::Transient(message),
            corrupt @ StoreError::Corrupt { .. } => {
                hg_common::HookgateError::business_permanent(corrupt.to_string())
            }
        }
    }
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
