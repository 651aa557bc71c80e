//! Account queries and sync-state phase transitions.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::types::{
    AccountStatus, MailboxAccount, NewAccount, SecurityMode, SyncState,
};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::sqlite::SqliteRow;

/// sync_error column width.
const SYNC_ERROR_MAX_CHARS: usize = 255;

impl Store {
    pub async fn insert_account(&self, account: NewAccount) -> Result<MailboxAccount> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO email_accounts (
                id, email, display_name, imap_host, imap_port, smtp_host, smtp_port,
                security_mode, encrypted_credentials, status, last_synced_uid,
                sync_state, sync_interval_minutes, retry_count, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', 0, 'idle', ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&account.email)
        .bind(&account.display_name)
        .bind(&account.imap_host)
        .bind(account.imap_port)
        .bind(&account.smtp_host)
        .bind(account.smtp_port)
        .bind(account.security_mode.as_str())
        .bind(&account.encrypted_credentials)
        .bind(account.sync_interval_minutes.max(1))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to insert account for {}", account.email))?;

        self.get_account(&id).await
    }

    pub async fn get_account(&self, id: &str) -> Result<MailboxAccount> {
        let row = sqlx::query(
            r#"
            SELECT id, email, display_name, imap_host, imap_port, smtp_host, smtp_port,
                   security_mode, encrypted_credentials, status, last_synced_uid,
                   last_synced_at, sync_state, sync_error, sync_interval_minutes, retry_count
            FROM email_accounts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| row_to_account(&row))
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))
    }

    /// One page of active accounts ordered never-synced first, then stalest
    /// first. Candidates only; callers apply [`MailboxAccount::should_sync`]
    /// and keep paging until they have enough due accounts.
    pub async fn list_sync_candidates(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MailboxAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, display_name, imap_host, imap_port, smtp_host, smtp_port,
                   security_mode, encrypted_credentials, status, last_synced_uid,
                   last_synced_at, sync_state, sync_error, sync_interval_minutes, retry_count
            FROM email_accounts
            WHERE status = 'active'
            ORDER BY last_synced_at IS NOT NULL, last_synced_at ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(row_to_account).collect())
    }

    pub async fn set_account_status(&self, id: &str, status: AccountStatus) -> Result<()> {
        sqlx::query("UPDATE email_accounts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Dispatcher transition: idle/warning/error → queued, clearing the last
    /// failure message.
    pub async fn mark_queued(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_accounts
            SET sync_state = 'queued', sync_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Engine transition at pass start: stamp `last_synced_at`, clear the
    /// failure message, enter `syncing`.
    pub async fn mark_syncing(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_accounts
            SET sync_state = 'syncing', last_synced_at = ?, sync_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Engine transition on full success. The watermark never regresses:
    /// the stored value is `max(existing, observed)`.
    pub async fn mark_success(&self, id: &str, watermark: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE email_accounts
            SET last_synced_uid = MAX(last_synced_uid, ?),
                last_synced_at = ?,
                sync_state = 'idle',
                retry_count = 0,
                sync_error = NULL,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(watermark)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Engine transition on failure: bump `retry_count`, store the truncated
    /// failure message, and land in `warning` or `error` depending on
    /// whether the retry budget is exhausted. Returns the resulting state.
    pub async fn mark_failure(
        &self,
        id: &str,
        message: &str,
        max_retries: i64,
        now: DateTime<Utc>,
    ) -> Result<SyncState> {
        let message: String = message.chars().take(SYNC_ERROR_MAX_CHARS).collect();

        let row = sqlx::query(
            r#"
            UPDATE email_accounts
            SET retry_count = retry_count + 1,
                sync_state = CASE WHEN retry_count + 1 >= ? THEN 'error' ELSE 'warning' END,
                sync_error = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING sync_state
            "#,
        )
        .bind(max_retries.max(1))
        .bind(&message)
        .bind(now)
        .bind(id)
        .fetch_one(self.pool())
        .await?;

        Ok(SyncState::parse(row.get::<String, _>("sync_state").as_str()))
    }

    /// Operational sweep: reset accounts stuck in `syncing` (crashed worker)
    /// back to `idle` and expire every lock. Returns (accounts, locks) touched.
    pub async fn reset_stale(&self, now: DateTime<Utc>) -> Result<(u64, u64)> {
        let accounts = sqlx::query(
            "UPDATE email_accounts SET sync_state = 'idle', updated_at = ? WHERE sync_state IN ('syncing', 'queued')",
        )
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();

        let locks = sqlx::query("UPDATE mailbox_locks SET locked_until = ? WHERE locked_until > ?")
            .bind(now)
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok((accounts, locks))
    }
}

fn row_to_account(row: &SqliteRow) -> MailboxAccount {
    MailboxAccount {
        id: row.get("id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        imap_host: row.get("imap_host"),
        imap_port: row.get::<i64, _>("imap_port") as u16,
        smtp_host: row.get("smtp_host"),
        smtp_port: row.get::<i64, _>("smtp_port") as u16,
        security_mode: SecurityMode::parse(row.get::<String, _>("security_mode").as_str()),
        encrypted_credentials: row.get("encrypted_credentials"),
        status: AccountStatus::parse(row.get::<String, _>("status").as_str()),
        last_synced_uid: row.get("last_synced_uid"),
        last_synced_at: row.get("last_synced_at"),
        sync_state: SyncState::parse(row.get::<String, _>("sync_state").as_str()),
        sync_error: row.get("sync_error"),
        sync_interval_minutes: row.get("sync_interval_minutes"),
        retry_count: row.get("retry_count"),
    }
}
