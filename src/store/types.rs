//! Domain types backing the relational store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "active" => AccountStatus::Active,
            _ => AccountStatus::Disabled,
        }
    }
}

/// Per-account sync state machine: idle → queued → syncing → {idle, warning, error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Queued,
    Syncing,
    Warning,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Queued => "queued",
            SyncState::Syncing => "syncing",
            SyncState::Warning => "warning",
            SyncState::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "queued" => SyncState::Queued,
            "syncing" => SyncState::Syncing,
            "warning" => SyncState::Warning,
            "error" => SyncState::Error,
            _ => SyncState::Idle,
        }
    }

    /// A sync is in flight or about to be.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SyncState::Syncing | SyncState::Queued)
    }
}

/// Encryption negotiation for IMAP and SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    None,
    Ssl,
    Tls,
    StartTls,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::None => "none",
            SecurityMode::Ssl => "ssl",
            SecurityMode::Tls => "tls",
            SecurityMode::StartTls => "starttls",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "none" => SecurityMode::None,
            "tls" => SecurityMode::Tls,
            "starttls" => SecurityMode::StartTls,
            _ => SecurityMode::Ssl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailboxAccount {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub security_mode: SecurityMode,
    pub encrypted_credentials: String,
    pub status: AccountStatus,
    /// Highest provider UID already processed; monotonically non-decreasing.
    pub last_synced_uid: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_state: SyncState,
    pub sync_error: Option<String>,
    pub sync_interval_minutes: i64,
    pub retry_count: i64,
}

impl MailboxAccount {
    /// Due-for-sync predicate evaluated at dispatch time. A coarse
    /// pre-filter only; the lock manager is the authoritative guard.
    pub fn should_sync(&self, now: DateTime<Utc>) -> bool {
        if self.status != AccountStatus::Active {
            return false;
        }

        if self.sync_state.is_in_flight() {
            return false;
        }

        match self.last_synced_at {
            None => true,
            Some(last) => {
                let interval = chrono::Duration::minutes(self.sync_interval_minutes.max(1));
                last + interval <= now
            }
        }
    }
}

/// Fields for provisioning an account row. Credential blob comes from the
/// vault; everything else is connection settings.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub display_name: Option<String>,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub security_mode: SecurityMode,
    pub encrypted_credentials: String,
    pub sync_interval_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct MailboxLock {
    pub email_account_id: String,
    pub lock_owner: String,
    pub locked_until: DateTime<Utc>,
}

impl MailboxLock {
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.locked_until > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "outgoing" => Direction::Outgoing,
            _ => Direction::Incoming,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub id: String,
    pub email_account_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub direction: Direction,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub body_ref: Option<String>,
    pub body_cached_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<i64>,
    /// Provider UID at sync time; None for outgoing mail.
    pub sync_id: Option<i64>,
    pub has_attachments: bool,
}

/// Fields written by the sync engine when upserting an incoming message.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub message_id: String,
    pub thread_id: String,
    pub direction: Direction,
    pub subject: String,
    pub snippet: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub received_at: Option<DateTime<Utc>>,
    pub size_bytes: i64,
    pub sync_id: Option<i64>,
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    Sender,
    To,
    Cc,
    Bcc,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Sender => "sender",
            ParticipantRole::To => "to",
            ParticipantRole::Cc => "cc",
            ParticipantRole::Bcc => "bcc",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "sender" => ParticipantRole::Sender,
            "cc" => ParticipantRole::Cc,
            "bcc" => ParticipantRole::Bcc,
            _ => ParticipantRole::To,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub role: ParticipantRole,
    pub address: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStatus {
    Pending,
    Downloaded,
    Skipped,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Pending => "pending",
            AttachmentStatus::Downloaded => "downloaded",
            AttachmentStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "downloaded" => AttachmentStatus::Downloaded,
            "skipped" => AttachmentStatus::Skipped,
            _ => AttachmentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    pub email_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub status: AttachmentStatus,
    pub storage_ref: Option<String>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Sync lifecycle audit events. Append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Queued,
    Started,
    Finished,
    Failed,
}

impl SyncEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEvent::Queued => "sync_queued",
            SyncEvent::Started => "sync_started",
            SyncEvent::Finished => "sync_finished",
            SyncEvent::Failed => "sync_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncLogEntry {
    pub email_account_id: String,
    pub event: String,
    pub message: Option<String>,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
