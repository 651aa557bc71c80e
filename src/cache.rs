//! On-demand body and attachment caching.
//!
//! Sync stores metadata only; this service fetches the full message the
//! first time a body is requested, sanitizes the HTML, writes blobs, and
//! stamps `body_ref`. Attachments over the configured ceiling are marked
//! skipped and never downloaded.

use crate::blob::BlobStore;
use crate::config::MailboxSettings;
use crate::connector::{self, message::FetchedMessage};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::types::{AttachmentStatus, EmailRecord};
use crate::text;
use crate::vault::Vault;
use anyhow::Context as _;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};

pub struct BodyCacheService {
    store: Arc<Store>,
    vault: Arc<Vault>,
    blobs: BlobStore,
    settings: MailboxSettings,
}

/// What one cache run produced.
#[derive(Debug, Clone)]
pub struct CachedBody {
    pub body_ref: String,
    pub downloaded_attachments: usize,
    pub skipped_attachments: usize,
}

impl BodyCacheService {
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

    /// Fetch the full message for a stored email, cache its sanitized body
    /// and eligible attachments, and stamp the email row. Idempotent: a
    /// second call refreshes the same blobs.
    pub async fn fetch_and_cache(&self, email_id: &str) -> Result<CachedBody> {
        let email = self.store.get_email(email_id).await?;
        let account = self.store.get_account(&email.email_account_id).await?;

        let fetched = if self.settings.fake_sync {
            tracing::info!(email_id, "fake_sync enabled, caching placeholder body");
            None
        } else {
            let credentials = self
                .vault
                .decrypt(&account.encrypted_credentials)
                .context("failed to decrypt account credentials")?;

            let folder = self.settings.default_folder.clone();
            let uid = email.sync_id.and_then(|id| u32::try_from(id).ok());
            let message_id = email.message_id.clone();
            let connection = account.clone();

            let message = tokio::task::spawn_blocking(move || {
                let mut session = connector::open_imap_session(&connection, &credentials)?;
                let result = connector::locate_message(&mut session, &folder, uid, &message_id);
                session.logout();
                result
            })
            .await
            .map_err(|error| {
                Error::Other(anyhow::Error::new(error).context("body fetch task panicked"))
            })??;

            Some(message)
        };

        let html = match &fetched {
            Some(message) => render_body(message),
            None => placeholder_body(&email),
        };

        let body_ref = format!("emails/{}/{}/body.html", account.id, email.id);
        self.blobs
            .put(&body_ref, sanitize_html(&html).as_bytes())
            .await?;

        let now = Utc::now();
        self.store.set_body_ref(&email.id, &body_ref, now).await?;

        // A skipped attachment stays skipped; later runs never upgrade it.
        let permanently_skipped: std::collections::HashSet<String> = self
            .store
            .attachments_for(&email.id)
            .await?
            .into_iter()
            .filter(|record| record.status == AttachmentStatus::Skipped)
            .map(|record| record.filename)
            .collect();

        let mut downloaded = 0;
        let mut skipped = 0;
        if let Some(message) = &fetched {
            for attachment in &message.attachments {
                if permanently_skipped.contains(&attachment.filename) {
                    skipped += 1;
                    continue;
                }

                let size = attachment.content.len() as i64;
                if attachment.content.len() as u64 > self.settings.max_attachment_bytes() {
                    self.store
                        .set_attachment_status(
                            &email.id,
                            &attachment.filename,
                            Some(&attachment.mime_type),
                            size,
                            AttachmentStatus::Skipped,
                            None,
                            now,
                        )
                        .await?;
                    tracing::info!(
                        email_id,
                        filename = %attachment.filename,
                        size,
                        "attachment exceeds size ceiling, skipped"
                    );
                    skipped += 1;
                    continue;
                }

                let storage_ref = format!(
                    "emails/{}/{}/attachments/{}-{}",
                    account.id,
                    email.id,
                    now.timestamp(),
                    text::slugify_filename(&attachment.filename),
                );
                self.blobs.put(&storage_ref, &attachment.content).await?;
                self.store
                    .set_attachment_status(
                        &email.id,
                        &attachment.filename,
                        Some(&attachment.mime_type),
                        size,
                        AttachmentStatus::Downloaded,
                        Some(&storage_ref),
                        now,
                    )
                    .await?;
                downloaded += 1;
            }
        }

        Ok(CachedBody {
            body_ref,
            downloaded_attachments: downloaded,
            skipped_attachments: skipped,
        })
    }

    /// Cold-storage eviction: drop the cached body blob and null the ref.
    /// Metadata and the snippet stay; the body can be re-cached later.
    pub async fn evict_body(&self, email_id: &str) -> Result<()> {
        let email = self.store.get_email(email_id).await?;
        if let Some(body_ref) = &email.body_ref {
            self.blobs.delete(body_ref).await?;
        }
        self.store.clear_body_ref(&email.id, Utc::now()).await?;
        Ok(())
    }
}

/// Prefer the HTML part; plain text is escaped and line-broken into HTML
/// so the stored body is always HTML.
fn render_body(message: &FetchedMessage) -> String {
    if let Some(html) = &message.html_body {
        return html.clone();
    }

    let text = message.text_body.as_deref().unwrap_or_default();
    text::escape_html(text).replace("\r\n", "\n").replace('\n', "<br>\n")
}

fn placeholder_body(email: &EmailRecord) -> String {
    let snippet = email.snippet.as_deref().unwrap_or_default();
    format!("<p>{}</p>", text::escape_html(snippet))
}

/// Strip script blocks and inline event handlers. Not a full sanitizer;
/// bodies are rendered inside a sandboxed frame and this removes the
/// worst offenders before they hit disk.
pub fn sanitize_html(html: &str) -> String {
    let without_scripts = script_regex().replace_all(html, "");
    event_handler_regex()
        .replace_all(&without_scripts, "")
        .into_owned()
}

fn script_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?is)<script\b[^>]*>.*?</script>").expect("valid script regex")
    })
}

fn event_handler_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"(?i)\son\w+\s*=\s*("[^"]*"|'[^']*')"#).expect("valid event handler regex")
    })
}
