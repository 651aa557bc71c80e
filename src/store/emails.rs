//! Email, participant, and attachment persistence.

use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::types::{
    AttachmentRecord, AttachmentStatus, Direction, EmailRecord, NewEmail, Participant,
    ParticipantRole,
};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::sqlite::SqliteRow;

impl Store {
    /// Insert-or-update an email keyed by (account, provider message-id).
    /// Re-syncing the same message updates the existing row in place.
    /// Returns the local email id.
    pub async fn upsert_email(
        &self,
        account_id: &str,
        email: &NewEmail,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let row = sqlx::query(
            r#"
            INSERT INTO emails (
                id, email_account_id, message_id, thread_id, direction, subject,
                snippet, sent_at, received_at, size_bytes, sync_id, has_attachments,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (email_account_id, message_id) DO UPDATE
            SET thread_id = excluded.thread_id,
                direction = excluded.direction,
                subject = excluded.subject,
                snippet = excluded.snippet,
                sent_at = excluded.sent_at,
                received_at = excluded.received_at,
                size_bytes = excluded.size_bytes,
                sync_id = excluded.sync_id,
                has_attachments = excluded.has_attachments,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(&email.message_id)
        .bind(&email.thread_id)
        .bind(email.direction.as_str())
        .bind(&email.subject)
        .bind(&email.snippet)
        .bind(email.sent_at)
        .bind(email.received_at)
        .bind(email.size_bytes)
        .bind(email.sync_id)
        .bind(email.has_attachments)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .with_context(|| format!("failed to upsert email {}", email.message_id))?;

        Ok(row.get("id"))
    }

    pub async fn get_email(&self, id: &str) -> Result<EmailRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, email_account_id, message_id, thread_id, direction, subject,
                   snippet, sent_at, received_at, body_ref, body_cached_at,
                   size_bytes, sync_id, has_attachments
            FROM emails
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| row_to_email(&row))
            .ok_or_else(|| Error::EmailNotFound(id.to_string()))
    }

    /// Wholesale participant replacement: delete then reinsert, in one
    /// transaction, so rows always reflect exactly the latest sync.
    pub async fn replace_participants(
        &self,
        email_id: &str,
        participants: &[Participant],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM email_participants WHERE email_id = ?")
            .bind(email_id)
            .execute(&mut *tx)
            .await?;

        for participant in participants {
            sqlx::query(
                "INSERT INTO email_participants (email_id, role, address, name) VALUES (?, ?, ?, ?)",
            )
            .bind(email_id)
            .bind(participant.role.as_str())
            .bind(&participant.address)
            .bind(&participant.name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn participants_for(&self, email_id: &str) -> Result<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT role, address, name FROM email_participants WHERE email_id = ? ORDER BY id",
        )
        .bind(email_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| Participant {
                role: ParticipantRole::parse(row.get::<String, _>("role").as_str()),
                address: row.get("address"),
                name: row.get("name"),
            })
            .collect())
    }

    /// Record attachment metadata if absent. Content download is the cache
    /// service's job; sync never writes blobs.
    pub async fn record_attachment_meta(
        &self,
        email_id: &str,
        filename: &str,
        mime_type: Option<&str>,
        size_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_attachments (email_id, filename, mime_type, size_bytes, status)
            VALUES (?, ?, ?, ?, 'pending')
            ON CONFLICT (email_id, filename) DO NOTHING
            "#,
        )
        .bind(email_id)
        .bind(filename)
        .bind(mime_type)
        .bind(size_bytes)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Cache-service transition for one attachment: refresh metadata and
    /// set the final status (downloaded with a storage ref, or skipped).
    pub async fn set_attachment_status(
        &self,
        email_id: &str,
        filename: &str,
        mime_type: Option<&str>,
        size_bytes: i64,
        status: AttachmentStatus,
        storage_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let downloaded_at = matches!(status, AttachmentStatus::Downloaded).then_some(now);

        sqlx::query(
            r#"
            INSERT INTO email_attachments
                (email_id, filename, mime_type, size_bytes, status, storage_ref, downloaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (email_id, filename) DO UPDATE
            SET mime_type = excluded.mime_type,
                size_bytes = excluded.size_bytes,
                status = excluded.status,
                storage_ref = excluded.storage_ref,
                downloaded_at = excluded.downloaded_at
            "#,
        )
        .bind(email_id)
        .bind(filename)
        .bind(mime_type)
        .bind(size_bytes)
        .bind(status.as_str())
        .bind(storage_ref)
        .bind(downloaded_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn attachments_for(&self, email_id: &str) -> Result<Vec<AttachmentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT email_id, filename, mime_type, size_bytes, status, storage_ref, downloaded_at
            FROM email_attachments
            WHERE email_id = ?
            ORDER BY filename
            "#,
        )
        .bind(email_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| AttachmentRecord {
                email_id: row.get("email_id"),
                filename: row.get("filename"),
                mime_type: row.get("mime_type"),
                size_bytes: row.get("size_bytes"),
                status: AttachmentStatus::parse(row.get::<String, _>("status").as_str()),
                storage_ref: row.get("storage_ref"),
                downloaded_at: row.get("downloaded_at"),
            })
            .collect())
    }

    /// Stamp the cached-body reference after the cache service has run.
    pub async fn set_body_ref(&self, email_id: &str, body_ref: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE emails SET body_ref = ?, body_cached_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(body_ref)
        .bind(now)
        .bind(now)
        .bind(email_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Null the body reference after cold-storage archival.
    pub async fn clear_body_ref(&self, email_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE emails SET body_ref = NULL, body_cached_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(email_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Count of emails stored for an account (diagnostics and tests).
    pub async fn count_emails(&self, account_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM emails WHERE email_account_id = ?")
            .bind(account_id)
            .fetch_one(self.pool())
            .await?;

        Ok(row.get("n"))
    }

    /// Emails for an account, newest first (the UI's expectation).
    pub async fn list_emails(&self, account_id: &str, limit: usize) -> Result<Vec<EmailRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, email_account_id, message_id, thread_id, direction, subject,
                   snippet, sent_at, received_at, body_ref, body_cached_at,
                   size_bytes, sync_id, has_attachments
            FROM emails
            WHERE email_account_id = ?
            ORDER BY received_at DESC
            LIMIT ?
            "#,
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(row_to_email).collect())
    }
}

fn row_to_email(row: &SqliteRow) -> EmailRecord {
    EmailRecord {
        id: row.get("id"),
        email_account_id: row.get("email_account_id"),
        message_id: row.get("message_id"),
        thread_id: row.get("thread_id"),
        direction: Direction::parse(row.get::<String, _>("direction").as_str()),
        subject: row.get("subject"),
        snippet: row.get("snippet"),
        sent_at: row.get("sent_at"),
        received_at: row.get("received_at"),
        body_ref: row.get("body_ref"),
        body_cached_at: row.get("body_cached_at"),
        size_bytes: row.get("size_bytes"),
        sync_id: row.get("sync_id"),
        has_attachments: row.get("has_attachments"),
    }
}

#[cfg(test)]
mod tests {
    use crate::store::testutil::{test_account, test_store};
    use crate::store::types::{
        AttachmentStatus, Direction, NewEmail, Participant, ParticipantRole,
    };
    use chrono::Utc;

    fn new_email(message_id: &str, uid: i64) -> NewEmail {
        NewEmail {
            message_id: message_id.to_string(),
            thread_id: message_id.to_string(),
            direction: Direction::Incoming,
            subject: "Quarterly invoice".to_string(),
            snippet: "Please find attached".to_string(),
            sent_at: Some(Utc::now()),
            received_at: Some(Utc::now()),
            size_bytes: 2048,
            sync_id: Some(uid),
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_message_id() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();

        let first = store
            .upsert_email(&account.id, &new_email("<m1@example.com>", 7), now)
            .await
            .unwrap();

        let mut updated = new_email("<m1@example.com>", 7);
        updated.subject = "Quarterly invoice (corrected)".to_string();
        let second = store.upsert_email(&account.id, &updated, now).await.unwrap();

        assert_eq!(first, second, "same row, not a duplicate");
        assert_eq!(store.count_emails(&account.id).await.unwrap(), 1);

        let reloaded = store.get_email(&first).await.unwrap();
        assert_eq!(reloaded.subject.as_deref(), Some("Quarterly invoice (corrected)"));
    }

    #[tokio::test]
    async fn participants_reflect_only_the_latest_sync() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();

        let email_id = store
            .upsert_email(&account.id, &new_email("<m2@example.com>", 8), now)
            .await
            .unwrap();

        let old = vec![
            Participant {
                role: ParticipantRole::Sender,
                address: "alice@example.com".to_string(),
                name: Some("Alice".to_string()),
            },
            Participant {
                role: ParticipantRole::To,
                address: "old@example.com".to_string(),
                name: None,
            },
        ];
        store.replace_participants(&email_id, &old).await.unwrap();

        let new = vec![Participant {
            role: ParticipantRole::Sender,
            address: "alice@example.com".to_string(),
            name: Some("Alice".to_string()),
        }];
        store.replace_participants(&email_id, &new).await.unwrap();

        let stored = store.participants_for(&email_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].address, "alice@example.com");
    }

    #[tokio::test]
    async fn attachment_meta_is_create_if_absent() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();

        let email_id = store
            .upsert_email(&account.id, &new_email("<m3@example.com>", 9), now)
            .await
            .unwrap();

        store
            .record_attachment_meta(&email_id, "report.pdf", Some("application/pdf"), 1024)
            .await
            .unwrap();
        // Re-sync records the same attachment again; no duplicate row.
        store
            .record_attachment_meta(&email_id, "report.pdf", Some("application/pdf"), 1024)
            .await
            .unwrap();

        let attachments = store.attachments_for(&email_id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].status, AttachmentStatus::Pending);
    }

    #[tokio::test]
    async fn body_ref_lifecycle() {
        let store = test_store().await;
        let account = store.insert_account(test_account()).await.unwrap();
        let now = Utc::now();

        let email_id = store
            .upsert_email(&account.id, &new_email("<m4@example.com>", 10), now)
            .await
            .unwrap();

        assert!(store.get_email(&email_id).await.unwrap().body_ref.is_none());

        store
            .set_body_ref(&email_id, "emails/a/b/body.html", now)
            .await
            .unwrap();
        let cached = store.get_email(&email_id).await.unwrap();
        assert_eq!(cached.body_ref.as_deref(), Some("emails/a/b/body.html"));
        assert!(cached.body_cached_at.is_some());

        store.clear_body_ref(&email_id, now).await.unwrap();
        let archived = store.get_email(&email_id).await.unwrap();
        assert!(archived.body_ref.is_none());
        assert!(archived.body_cached_at.is_none());
    }
}
