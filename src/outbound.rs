//! Outbound mail: compose, send over the account's SMTP transport, and
//! persist the sent message alongside the synced ones.

use crate::blob::BlobStore;
use crate::config::MailboxSettings;
use crate::connector;
use crate::connector::message::normalize_message_id;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::types::{
    AttachmentStatus, Direction, MailboxAccount, NewEmail, Participant, ParticipantRole,
};
use crate::text;
use crate::vault::Vault;
use anyhow::Context as _;
use chrono::Utc;
use lettre::AsyncTransport as _;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use std::sync::Arc;

const MESSAGE_ID_DOMAIN: &str = "mailroom.local";

#[derive(Debug, Clone)]
pub struct OutboundAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// A message to send. `in_reply_to` is the replied-to message-id without
/// angle brackets; it drives both the header and thread assignment.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub in_reply_to: Option<String>,
    pub attachments: Vec<OutboundAttachment>,
}

pub struct OutboundMailService {
    store: Arc<Store>,
    vault: Arc<Vault>,
    blobs: BlobStore,
    settings: MailboxSettings,
}

impl OutboundMailService {
    pub fn new(
        store: Arc<Store>,
        vault: Arc<Vault>,
        blobs: BlobStore,
        settings: MailboxSettings,
    ) -> Self {
        Self {
            store,
            vault,
            blobs,
            settings,
        }
    }

    /// Send a message from an account and persist it as an outgoing email.
    /// Returns the local email id. Nothing is persisted when the SMTP
    /// transport rejects the message.
    pub async fn send(&self, account_id: &str, outbound: OutboundEmail) -> Result<String> {
        let account = self.store.get_account(account_id).await?;
        let message_id = format!("{}@{MESSAGE_ID_DOMAIN}", uuid::Uuid::new_v4());

        let message = compose(&account, &outbound, &message_id)?;

        if self.settings.fake_sync {
            tracing::info!(account = %account.email, "fake_sync enabled, skipping SMTP send");
        } else {
            let credentials = self
                .vault
                .decrypt(&account.encrypted_credentials)
                .context("failed to decrypt account credentials")?;
            let transport = connector::build_smtp_transport(&account, &credentials)?;
            transport
                .send(message)
                .await
                .map_err(|error| Error::Other(anyhow::Error::new(error).context("failed to send message")))?;
        }

        self.persist(&account, &outbound, &message_id).await
    }

    async fn persist(
        &self,
        account: &MailboxAccount,
        outbound: &OutboundEmail,
        message_id: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let thread_id = outbound
            .in_reply_to
            .as_deref()
            .map(normalize_message_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| message_id.to_string());

        let email_id = self
            .store
            .upsert_email(
                &account.id,
                &NewEmail {
                    message_id: message_id.to_string(),
                    thread_id,
                    direction: Direction::Outgoing,
                    subject: outbound.subject.clone(),
                    snippet: text::snippet(None, Some(&outbound.body_html)),
                    sent_at: Some(now),
                    received_at: Some(now),
                    size_bytes: outbound.body_html.len() as i64,
                    sync_id: None,
                    has_attachments: !outbound.attachments.is_empty(),
                },
                now,
            )
            .await?;

        let mut participants = vec![Participant {
            role: ParticipantRole::Sender,
            address: account.email.clone(),
            name: account.display_name.clone(),
        }];
        for (role, addresses) in [
            (ParticipantRole::To, &outbound.to),
            (ParticipantRole::Cc, &outbound.cc),
            (ParticipantRole::Bcc, &outbound.bcc),
        ] {
            for address in addresses {
                participants.push(Participant {
                    role,
                    address: address.clone(),
                    name: None,
                });
            }
        }
        self.store.replace_participants(&email_id, &participants).await?;

        for attachment in &outbound.attachments {
            let storage_ref = format!(
                "emails/{}/{}/attachments/{}-{}",
                account.id,
                email_id,
                now.timestamp(),
                text::slugify_filename(&attachment.filename),
            );
            self.blobs.put(&storage_ref, &attachment.content).await?;
            self.store
                .set_attachment_status(
                    &email_id,
                    &attachment.filename,
                    Some(&attachment.mime_type),
                    attachment.content.len() as i64,
                    AttachmentStatus::Downloaded,
                    Some(&storage_ref),
                    now,
                )
                .await?;
        }

        let body_ref = format!("emails/{}/{}/body.html", account.id, email_id);
        self.blobs.put(&body_ref, outbound.body_html.as_bytes()).await?;
        self.store.set_body_ref(&email_id, &body_ref, now).await?;

        Ok(email_id)
    }
}

fn compose(account: &MailboxAccount, outbound: &OutboundEmail, message_id: &str) -> Result<Message> {
    let from: Mailbox = match &account.display_name {
        Some(name) => format!("{name} <{}>", account.email),
        None => account.email.clone(),
    }
    .parse()
    .map_err(|error| {
        Error::Other(anyhow::Error::new(error).context("invalid sender address"))
    })?;

    let mut builder = Message::builder()
        .from(from)
        .subject(outbound.subject.clone())
        .message_id(Some(format!("<{message_id}>")));

    if let Some(reply_to) = &outbound.in_reply_to {
        let normalized = normalize_message_id(reply_to);
        if !normalized.is_empty() {
            builder = builder.in_reply_to(format!("<{normalized}>"));
        }
    }

    for (header, addresses) in [
        ("recipient", &outbound.to),
        ("cc", &outbound.cc),
        ("bcc", &outbound.bcc),
    ] {
        for address in addresses {
            let mailbox: Mailbox = address.parse().map_err(|error| {
                Error::Other(
                    anyhow::Error::new(error).context(format!("invalid {header} address '{address}'")),
                )
            })?;
            builder = match header {
                "cc" => builder.cc(mailbox),
                "bcc" => builder.bcc(mailbox),
                _ => builder.to(mailbox),
            };
        }
    }

    let body = SinglePart::html(outbound.body_html.clone());
    let message = if outbound.attachments.is_empty() {
        builder.singlepart(body)
    } else {
        let mut multipart = MultiPart::mixed().singlepart(body);
        for attachment in &outbound.attachments {
            let content_type = ContentType::parse(&attachment.mime_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|error| Error::Other(anyhow::Error::new(error)))?;
            multipart = multipart.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }
        builder.multipart(multipart)
    }
    .map_err(|error| Error::Other(anyhow::Error::new(error).context("failed to compose message")))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::{OutboundAttachment, OutboundEmail, OutboundMailService, compose};
    use crate::blob::BlobStore;
    use crate::config::MailboxSettings;
    use crate::store::testutil::{test_account, test_store};
    use crate::store::types::{AttachmentStatus, Direction, ParticipantRole};
    use crate::vault::Vault;
    use std::sync::Arc;

    fn outbound() -> OutboundEmail {
        OutboundEmail {
            to: vec!["ada@example.com".to_string()],
            cc: vec!["bob@example.com".to_string()],
            bcc: Vec::new(),
            subject: "Re: Invoice question".to_string(),
            body_html: "<p>Answer attached.</p>".to_string(),
            in_reply_to: Some("abc123@mail.example.com".to_string()),
            attachments: vec![OutboundAttachment {
                filename: "invoice.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                content: b"%PDF-1.4".to_vec(),
            }],
        }
    }

    #[test]
    fn compose_builds_a_threaded_multipart_message() {
        let account = crate::store::types::MailboxAccount {
            id: "acc-1".to_string(),
            email: "support@example.com".to_string(),
            display_name: Some("Support".to_string()),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 465,
            security_mode: crate::store::types::SecurityMode::Ssl,
            encrypted_credentials: String::new(),
            status: crate::store::types::AccountStatus::Active,
            last_synced_uid: 0,
            last_synced_at: None,
            sync_state: crate::store::types::SyncState::Idle,
            sync_error: None,
            sync_interval_minutes: 15,
            retry_count: 0,
        };

        let message = compose(&account, &outbound(), "new-id@mailroom.local").unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();

        assert!(rendered.contains("Message-ID: <new-id@mailroom.local>"));
        assert!(rendered.contains("In-Reply-To: <abc123@mail.example.com>"));
        assert!(rendered.contains("Subject: Re: Invoice question"));
        assert!(rendered.contains("invoice.pdf"));
    }

    #[tokio::test]
    async fn send_persists_outgoing_email_with_participants_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();

        let service = OutboundMailService::new(
            Arc::clone(&store),
            Arc::new(Vault::new(&Vault::generate_key()).unwrap()),
            BlobStore::new(dir.path()),
            MailboxSettings {
                fake_sync: true,
                ..MailboxSettings::default()
            },
        );

        let email_id = service.send(&account.id, outbound()).await.unwrap();

        let email = store.get_email(&email_id).await.unwrap();
        assert_eq!(email.direction, Direction::Outgoing);
        assert_eq!(email.thread_id, "abc123@mail.example.com");
        assert!(email.has_attachments);
        assert!(email.body_ref.is_some());
        assert!(email.sync_id.is_none());

        let participants = store.participants_for(&email_id).await.unwrap();
        assert_eq!(participants.len(), 3);
        assert_eq!(participants[0].role, ParticipantRole::Sender);
        assert_eq!(participants[0].address, "support@example.com");

        let attachments = store.attachments_for(&email_id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].status, AttachmentStatus::Downloaded);
        assert!(attachments[0].storage_ref.is_some());
    }

    #[tokio::test]
    async fn new_thread_when_not_a_reply() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();

        let service = OutboundMailService::new(
            Arc::clone(&store),
            Arc::new(Vault::new(&Vault::generate_key()).unwrap()),
            BlobStore::new(dir.path()),
            MailboxSettings {
                fake_sync: true,
                ..MailboxSettings::default()
            },
        );

        let mut message = outbound();
        message.in_reply_to = None;
        message.attachments.clear();

        let email_id = service.send(&account.id, message).await.unwrap();
        let email = store.get_email(&email_id).await.unwrap();

        // A fresh send threads onto its own message-id.
        assert_eq!(email.thread_id, email.message_id);
        assert!(email.message_id.ends_with("@mailroom.local"));
    }
}
