//! Per-account sync pass.
//!
//! A pass runs entirely under the account's mailbox lease: acquire, fetch,
//! persist, record the outcome, release. The lease is released on every
//! exit path; the UID watermark only advances after the whole pass
//! succeeds, so a partial failure re-syncs the same window next time.

use crate::config::MailboxSettings;
use crate::connector::{self, message::FetchedMessage};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::types::{
    Direction, MailboxAccount, NewEmail, Participant, ParticipantRole, SyncEvent,
};
use crate::vault::Vault;
use anyhow::Context as _;
use chrono::{Duration, Utc};
use std::sync::Arc;

pub struct SyncEngine {
    store: Arc<Store>,
    vault: Arc<Vault>,
    settings: MailboxSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    /// Messages persisted this pass.
    pub processed: usize,
    /// Highest UID observed, never below the account's previous watermark.
    pub watermark: i64,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, vault: Arc<Vault>, settings: MailboxSettings) -> Self {
        Self {
            store,
            vault,
            settings,
        }
    }

    /// Run one sync pass for an account. Lock contention surfaces as
    /// [`Error::AlreadyLocked`] without touching the account's sync state.
    pub async fn sync_account(&self, account_id: &str) -> Result<SyncOutcome> {
        let account = self.store.get_account(account_id).await?;
        let owner = lock_owner();

        self.store
            .acquire_lock(&account.id, &owner, self.settings.lock_lease(), Utc::now())
            .await?;

        let result = self.run_pass(&account).await;

        // Release even when the pass failed; the next dispatch must not
        // have to wait out the lease.
        if let Err(error) = self.store.release_lock(&account.id, Utc::now()).await {
            tracing::error!(account_id = %account.id, %error, "failed to release mailbox lock");
        }

        result
    }

    async fn run_pass(&self, account: &MailboxAccount) -> Result<SyncOutcome> {
        let started = Utc::now();
        self.store.mark_syncing(&account.id, started).await?;
        self.store
            .append_sync_log(
                &account.id,
                SyncEvent::Started,
                "sync started",
                Some(serde_json::json!({
                    "folder": self.settings.default_folder,
                    "last_synced_uid": account.last_synced_uid,
                })),
            )
            .await?;

        match self.execute(account).await {
            Ok(outcome) => {
                self.store
                    .mark_success(&account.id, outcome.watermark, Utc::now())
                    .await?;
                self.store
                    .append_sync_log(
                        &account.id,
                        SyncEvent::Finished,
                        &format!("processed {} messages", outcome.processed),
                        Some(serde_json::json!({
                            "processed": outcome.processed,
                            "watermark": outcome.watermark,
                        })),
                    )
                    .await?;
                tracing::info!(
                    account = %account.email,
                    processed = outcome.processed,
                    watermark = outcome.watermark,
                    "sync finished"
                );
                Ok(outcome)
            }
            Err(error) => {
                let message = error.to_string();
                let state = self
                    .store
                    .mark_failure(&account.id, &message, self.settings.max_retries, Utc::now())
                    .await?;
                self.store
                    .append_sync_log(
                        &account.id,
                        SyncEvent::Failed,
                        &message,
                        Some(serde_json::json!({ "resulting_state": state.as_str() })),
                    )
                    .await?;
                tracing::warn!(
                    account = %account.email,
                    state = state.as_str(),
                    %error,
                    "sync failed"
                );
                Err(error)
            }
        }
    }

    async fn execute(&self, account: &MailboxAccount) -> Result<SyncOutcome> {
        if self.settings.fake_sync {
            tracing::info!(account = %account.email, "fake_sync enabled, skipping mailbox fetch");
            return Ok(SyncOutcome {
                processed: 0,
                watermark: account.last_synced_uid,
            });
        }

        let credentials = self
            .vault
            .decrypt(&account.encrypted_credentials)
            .context("failed to decrypt account credentials")?;

        let folder = self.settings.default_folder.clone();
        let limit = self.settings.max_messages_per_sync;
        let since = self.since_hint(account);
        let connection = account.clone();

        let fetched = tokio::task::spawn_blocking(move || {
            let mut session = connector::open_imap_session(&connection, &credentials)?;
            let result = connector::fetch_recent(&mut session, &folder, limit, since);
            session.logout();
            result
        })
        .await
        .map_err(|error| Error::Other(anyhow::Error::new(error).context("fetch task panicked")))??;

        self.ingest(account, fetched).await
    }

    /// Persist the messages that are actually new, newest first.
    /// A storage error aborts the whole pass so the watermark is never
    /// written past a message that did not land. Unparseable messages were
    /// already dropped at the fetch boundary; by here every message must
    /// persist or none of the pass counts.
    pub(crate) async fn ingest(
        &self,
        account: &MailboxAccount,
        fetched: Vec<FetchedMessage>,
    ) -> Result<SyncOutcome> {
        let selected = select_new_messages(fetched, account.last_synced_uid);
        let watermark = selected
            .iter()
            .map(|message| i64::from(message.uid))
            .fold(account.last_synced_uid, i64::max);

        let now = Utc::now();
        for message in &selected {
            self.store_message(account, message, now).await?;
        }

        Ok(SyncOutcome {
            processed: selected.len(),
            watermark,
        })
    }

    async fn store_message(
        &self,
        account: &MailboxAccount,
        message: &FetchedMessage,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let email_id = self
            .store
            .upsert_email(&account.id, &to_new_email(message, now), now)
            .await?;
        self.store
            .replace_participants(&email_id, &to_participants(message))
            .await?;
        for attachment in &message.attachments {
            self.store
                .record_attachment_meta(
                    &email_id,
                    &attachment.filename,
                    Some(&attachment.mime_type),
                    attachment.content.len() as i64,
                )
                .await?;
        }

        Ok(())
    }

    /// Server-side SINCE hint. Coarse by design: the UID filter in
    /// [`select_new_messages`] is the authoritative cut.
    fn since_hint(&self, account: &MailboxAccount) -> Option<chrono::DateTime<Utc>> {
        match account.last_synced_at {
            Some(last) => Some(last - Duration::minutes(self.settings.since_overlap_minutes.max(0))),
            None => Some(Utc::now() - Duration::days(self.settings.lookback_days.max(1))),
        }
    }
}

/// Drop everything at or below the watermark, then order newest first by
/// true message timestamp (dateless messages last), UID as tiebreaker.
pub(crate) fn select_new_messages(
    fetched: Vec<FetchedMessage>,
    last_synced_uid: i64,
) -> Vec<FetchedMessage> {
    let mut selected: Vec<FetchedMessage> = fetched
        .into_iter()
        .filter(|message| i64::from(message.uid) > last_synced_uid)
        .collect();

    selected.sort_by(|left, right| {
        right
            .sort_timestamp()
            .cmp(&left.sort_timestamp())
            .then(right.uid.cmp(&left.uid))
    });

    selected
}

/// Subject column width; RFC 5322's line limit, generous for any real mail.
const SUBJECT_MAX_CHARS: usize = 998;

fn to_new_email(message: &FetchedMessage, now: chrono::DateTime<Utc>) -> NewEmail {
    NewEmail {
        message_id: message.message_id.clone(),
        thread_id: message.thread_id.clone(),
        direction: Direction::Incoming,
        subject: crate::text::truncate_chars(message.subject.as_deref().unwrap_or_default(), SUBJECT_MAX_CHARS),
        snippet: message.snippet(),
        sent_at: message.date,
        // Dateless messages still get a received timestamp so newest-first
        // listings have something to order them by.
        received_at: Some(message.date.unwrap_or(now)),
        size_bytes: message.size_bytes,
        sync_id: Some(i64::from(message.uid)),
        has_attachments: message.has_attachments(),
    }
}

fn to_participants(message: &FetchedMessage) -> Vec<Participant> {
    let mut participants = Vec::new();
    for (role, addresses) in [
        (ParticipantRole::Sender, &message.from),
        (ParticipantRole::To, &message.to),
        (ParticipantRole::Cc, &message.cc),
        (ParticipantRole::Bcc, &message.bcc),
    ] {
        for address in addresses {
            participants.push(Participant {
                role,
                address: address.address.clone(),
                name: address.name.clone(),
            });
        }
    }

    participants
}

/// Stable identity for lock ownership: `hostname:pid`.
fn lock_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::{SyncEngine, select_new_messages};
    use crate::config::MailboxSettings;
    use crate::connector::message::{FetchedMessage, MailAddress};
    use crate::error::Error;
    use crate::store::Store;
    use crate::store::testutil::{test_account, test_store};
    use crate::store::types::{NewAccount, SecurityMode, SyncState};
    use crate::vault::{Credentials, Vault};
    use chrono::{TimeZone as _, Utc};
    use std::sync::Arc;

    fn message(uid: u32, epoch: i64) -> FetchedMessage {
        FetchedMessage {
            uid,
            message_id: format!("m{uid}@example.com"),
            thread_id: format!("m{uid}@example.com"),
            subject: Some(format!("Message {uid}")),
            date: Utc.timestamp_opt(epoch, 0).single(),
            size_bytes: 1024,
            text_body: Some("hello".to_string()),
            html_body: None,
            from: vec![MailAddress {
                address: "ada@example.com".to_string(),
                name: Some("Ada".to_string()),
            }],
            to: vec![MailAddress {
                address: "support@crm.example".to_string(),
                name: None,
            }],
            cc: Vec::new(),
            bcc: Vec::new(),
            attachments: Vec::new(),
        }
    }

    fn fake_engine(store: Arc<Store>) -> SyncEngine {
        let settings = MailboxSettings {
            fake_sync: true,
            ..MailboxSettings::default()
        };
        SyncEngine::new(store, Arc::new(Vault::new(&Vault::generate_key()).unwrap()), settings)
    }

    #[test]
    fn watermark_filter_drops_already_synced_uids() {
        let fetched = vec![
            message(95, 1_000),
            message(101, 4_000),
            message(102, 3_000),
            message(99, 2_000),
        ];

        let selected = select_new_messages(fetched, 100);
        let uids: Vec<u32> = selected.iter().map(|m| m.uid).collect();
        // 95 and 99 are at or below the watermark; newest timestamp first.
        assert_eq!(uids, vec![101, 102]);
    }

    #[test]
    fn dateless_messages_sort_last() {
        let mut dateless = message(103, 0);
        dateless.date = None;

        let selected = select_new_messages(vec![dateless, message(101, 4_000)], 100);
        let uids: Vec<u32> = selected.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![101, 103]);
    }

    #[tokio::test]
    async fn ingest_persists_only_new_messages_and_advances_watermark() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();
        store.mark_success(&account.id, 100, Utc::now()).await.unwrap();
        let account = store.get_account(&account.id).await.unwrap();

        let engine = fake_engine(Arc::clone(&store));
        let fetched = vec![
            message(95, 1_000),
            message(101, 4_000),
            message(102, 3_000),
            message(99, 2_000),
        ];

        let outcome = engine.ingest(&account, fetched).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.watermark, 102);
        assert_eq!(store.count_emails(&account.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn storage_failure_aborts_the_pass_and_keeps_the_watermark() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();
        store.mark_success(&account.id, 100, Utc::now()).await.unwrap();
        let account = store.get_account(&account.id).await.unwrap();

        // Break persistence mid-message: the email row lands but the
        // participant write cannot.
        sqlx::query("DROP TABLE email_participants")
            .execute(store.pool())
            .await
            .unwrap();

        let engine = fake_engine(Arc::clone(&store));
        let result = engine.ingest(&account, vec![message(101, 4_000)]).await;
        assert!(result.is_err(), "a storage error must fail the pass");

        // No success was recorded, so UID 101 stays above the watermark
        // and will be fetched again next pass.
        let reloaded = store.get_account(&account.id).await.unwrap();
        assert_eq!(reloaded.last_synced_uid, 100);
    }

    #[tokio::test]
    async fn dateless_message_still_gets_a_received_timestamp() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();
        let account = store.get_account(&account.id).await.unwrap();

        let mut dateless = message(6, 0);
        dateless.date = None;

        let engine = fake_engine(Arc::clone(&store));
        engine.ingest(&account, vec![dateless]).await.unwrap();

        let emails = store.list_emails(&account.id, 10).await.unwrap();
        assert_eq!(emails.len(), 1);
        assert!(emails[0].sent_at.is_none());
        assert!(emails[0].received_at.is_some());
    }

    #[tokio::test]
    async fn ingest_stores_participants_and_attachment_meta() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();
        let account = store.get_account(&account.id).await.unwrap();

        let mut fetched = message(5, 1_000);
        fetched.attachments.push(crate::connector::message::FetchedAttachment {
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            content: vec![0u8; 64],
        });

        let engine = fake_engine(Arc::clone(&store));
        engine.ingest(&account, vec![fetched]).await.unwrap();

        let emails = store.list_emails(&account.id, 10).await.unwrap();
        assert_eq!(emails.len(), 1);
        assert!(emails[0].has_attachments);

        let participants = store.participants_for(&emails[0].id).await.unwrap();
        assert_eq!(participants.len(), 2);

        let attachments = store.attachments_for(&emails[0].id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].size_bytes, 64);
    }

    #[tokio::test]
    async fn fake_sync_completes_without_network() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();
        store.mark_success(&account.id, 42, Utc::now()).await.unwrap();

        let engine = fake_engine(Arc::clone(&store));
        let outcome = engine.sync_account(&account.id).await.unwrap();

        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.watermark, 42);

        let reloaded = store.get_account(&account.id).await.unwrap();
        assert_eq!(reloaded.sync_state, SyncState::Idle);
        assert_eq!(reloaded.last_synced_uid, 42);

        // Lease is free again.
        store
            .acquire_lock(&account.id, "other:1", chrono::Duration::minutes(5), Utc::now())
            .await
            .unwrap();

        let logs = store.recent_sync_logs(&account.id, 10).await.unwrap();
        let events: Vec<&str> = logs.iter().map(|entry| entry.event.as_str()).collect();
        assert_eq!(events, vec!["sync_finished", "sync_started"]);
    }

    #[tokio::test]
    async fn held_lock_skips_the_pass_without_recording_failure() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();

        store
            .acquire_lock(&account.id, "other-host:9", chrono::Duration::minutes(5), Utc::now())
            .await
            .unwrap();

        let engine = fake_engine(Arc::clone(&store));
        let result = engine.sync_account(&account.id).await;
        assert!(matches!(result, Err(Error::AlreadyLocked { .. })));

        let reloaded = store.get_account(&account.id).await.unwrap();
        assert_eq!(reloaded.retry_count, 0);
        assert!(reloaded.sync_error.is_none());
        assert!(store.recent_sync_logs(&account.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connection_failure_marks_warning_and_releases_lock() {
        let store = Arc::new(test_store().await);
        let vault = Arc::new(Vault::new(&Vault::generate_key()).unwrap());
        let blob = vault
            .encrypt(&Credentials {
                username: "ops@example.com".to_string(),
                password: "secret".to_string(),
            })
            .unwrap();

        // Port 1 on loopback refuses immediately; no real server needed.
        let account = store
            .insert_account(NewAccount {
                email: "down@example.com".to_string(),
                display_name: None,
                imap_host: "127.0.0.1".to_string(),
                imap_port: 1,
                smtp_host: "127.0.0.1".to_string(),
                smtp_port: 1,
                security_mode: SecurityMode::None,
                encrypted_credentials: blob,
                sync_interval_minutes: 15,
            })
            .await
            .unwrap();

        let engine = SyncEngine::new(
            Arc::clone(&store),
            vault,
            MailboxSettings::default(),
        );

        let result = engine.sync_account(&account.id).await;
        assert!(matches!(result, Err(Error::Connect(_))));

        let reloaded = store.get_account(&account.id).await.unwrap();
        assert_eq!(reloaded.sync_state, SyncState::Warning);
        assert_eq!(reloaded.retry_count, 1);
        assert!(reloaded.sync_error.is_some());

        // The lease was released despite the failure.
        store
            .acquire_lock(&account.id, "other:1", chrono::Duration::minutes(5), Utc::now())
            .await
            .unwrap();

        let logs = store.recent_sync_logs(&account.id, 10).await.unwrap();
        let events: Vec<&str> = logs.iter().map(|entry| entry.event.as_str()).collect();
        assert_eq!(events, vec!["sync_failed", "sync_started"]);
    }
}
