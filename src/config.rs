//! Layered configuration: `mailroom.toml` plus `MAILROOM_*` environment
//! variables, deserialized into typed settings with defaults.

use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// SQLite database URL, e.g. `sqlite://mailroom.db`.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Root directory for cached bodies and attachments.
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,

    /// Base64-encoded 32-byte key for the credential vault.
    pub vault_key: String,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub mailboxes: MailboxSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// When set, logs roll daily into this directory instead of stderr.
    pub directory: Option<PathBuf>,

    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: None,
            filter: default_log_filter(),
        }
    }
}

/// Tunables for the sync pipeline. Every field has a production default so
/// an empty `[mailboxes]` table is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxSettings {
    #[serde(default = "default_folder")]
    pub default_folder: String,

    /// Upper bound on messages ingested per sync pass.
    #[serde(default = "default_max_messages_per_sync")]
    pub max_messages_per_sync: usize,

    /// Failed passes before an account transitions from `warning` to `error`.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Dispatcher cadence.
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,

    /// Accounts enqueued per dispatcher run.
    #[serde(default = "default_dispatch_limit")]
    pub dispatch_limit: usize,

    /// Mailbox lock lease duration. A crashed worker's lease simply
    /// expires after this long.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: i64,

    /// Attachments above this size are marked skipped and never downloaded.
    #[serde(default = "default_max_attachment_mb")]
    pub max_attachment_mb: u64,

    /// Server-side SINCE window for an account that has never synced.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Overlap subtracted from `last_synced_at` when building the SINCE
    /// hint, so clock skew between us and the server cannot drop messages.
    #[serde(default = "default_since_overlap_minutes")]
    pub since_overlap_minutes: i64,

    /// Short-circuit syncs and body fetches without touching the network.
    /// For environments without real mail servers; never set in production.
    #[serde(default)]
    pub fake_sync: bool,

    /// Report connectivity checks as passed without connecting.
    #[serde(default)]
    pub skip_connectivity_checks: bool,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        toml::from_str("").expect("defaults are valid")
    }
}

impl MailboxSettings {
    pub fn max_attachment_bytes(&self) -> u64 {
        self.max_attachment_mb.max(1) * 1024 * 1024
    }

    pub fn lock_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_lease_secs.max(1))
    }
}

impl AppConfig {
    /// Load configuration from a TOML file (optional) layered with
    /// `MAILROOM_*` environment variables.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("MAILROOM").separator("__"))
            .build()
            .context("failed to read configuration")?;

        config
            .try_deserialize()
            .context("failed to parse configuration")
    }
}

fn default_database_url() -> String {
    "sqlite://mailroom.db".to_string()
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("blobs")
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_max_messages_per_sync() -> usize {
    200
}

fn default_max_retries() -> i64 {
    3
}

fn default_dispatch_interval_secs() -> u64 {
    300
}

fn default_dispatch_limit() -> usize {
    100
}

fn default_lock_lease_secs() -> i64 {
    300
}

fn default_max_attachment_mb() -> u64 {
    20
}

fn default_lookback_days() -> i64 {
    7
}

fn default_since_overlap_minutes() -> i64 {
    5
}
