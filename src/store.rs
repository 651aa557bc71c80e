//! SQLite persistence layer.
//!
//! `Store` owns the pool; per-table query methods live in the submodules
//! as split `impl` blocks. All mutation of sync state goes through the
//! phase-transition methods here, so only the lock holder ever writes it.

pub mod accounts;
pub mod emails;
pub mod locks;
pub mod sync_log;
pub mod types;

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr as _;

pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("pool", &"<SqlitePool>").finish()
    }
}

impl Store {
    /// Open (creating if missing) the database and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // In-memory databases are per-connection; a single connection keeps
        // the schema visible to every query (used by tests and dry runs).
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Store;
    use crate::store::types::{NewAccount, SecurityMode};

    pub(crate) async fn test_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    pub(crate) fn test_account() -> NewAccount {
        NewAccount {
            email: "support@example.com".to_string(),
            display_name: Some("Support".to_string()),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            security_mode: SecurityMode::Ssl,
            encrypted_credentials: "blob".to_string(),
            sync_interval_minutes: 15,
        }
    }
}
