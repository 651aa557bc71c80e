//! Append-only sync lifecycle audit trail.

use crate::error::Result;
use crate::store::Store;
use crate::store::types::{SyncEvent, SyncLogEntry};
use chrono::Utc;
use sqlx::Row as _;

impl Store {
    pub async fn append_sync_log(
        &self,
        account_id: &str,
        event: SyncEvent,
        message: &str,
        context: Option<serde_json::Value>,
    ) -> Result<()> {
        let context = context
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .map_err(anyhow::Error::from)?;

        sqlx::query(
            r#"
            INSERT INTO sync_logs (email_account_id, event, message, context, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(event.as_str())
        .bind(message)
        .bind(context)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Most recent log entries for an account, newest first.
    pub async fn recent_sync_logs(&self, account_id: &str, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT email_account_id, event, message, context, created_at
            FROM sync_logs
            WHERE email_account_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| SyncLogEntry {
                email_account_id: row.get("email_account_id"),
                event: row.get("event"),
                message: row.get("message"),
                context: row
                    .get::<Option<String>, _>("context")
                    .and_then(|raw| serde_json::from_str(&raw).ok()),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::testutil::{test_account, test_store};
    use crate::store::types::SyncEvent;

    #[tokio::test]
    async fn log_is_append_only_and_ordered() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();

        store
            .append_sync_log(&account.id, SyncEvent::Started, "sync started", None)
            .await
            .unwrap();
        store
            .append_sync_log(
                &account.id,
                SyncEvent::Finished,
                "processed 3 messages",
                Some(serde_json::json!({ "processed": 3 })),
            )
            .await
            .unwrap();

        let entries = store.recent_sync_logs(&account.id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "sync_finished");
        assert_eq!(entries[1].event, "sync_started");
        assert_eq!(entries[0].context.as_ref().unwrap()["processed"], 3);
    }
}
