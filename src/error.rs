//! Crate-wide error type.

use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another worker holds the mailbox lease. Expected under concurrent
    /// dispatch; callers skip the pass instead of recording a failure.
    #[error("mailbox locked by {owner} until {locked_until}")]
    AlreadyLocked {
        owner: String,
        locked_until: DateTime<Utc>,
    },

    /// DNS/TCP/TLS/auth failure while opening an IMAP session or SMTP
    /// transport. Never retried in-process; the next scheduled sync is
    /// the retry vehicle.
    #[error("connection failed: {0}")]
    Connect(#[source] anyhow::Error),

    /// The message could not be located on the server. Terminal for a
    /// single cache invocation.
    #[error("message not found on the mail server")]
    MessageNotFound,

    #[error("email account {0} not found")]
    AccountNotFound(String),

    #[error("email {0} not found")]
    EmailNotFound(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for lock contention, which dispatchers silently skip.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Error::AlreadyLocked { .. })
    }
}
