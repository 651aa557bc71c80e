//! Per-account connectivity checks: one IMAP login round-trip and one
//! SMTP handshake, reported independently so operators can tell which
//! leg of an account is misconfigured.

use crate::config::MailboxSettings;
use crate::connector;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::vault::Vault;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use lettre::AsyncTransport as _;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn pass() -> Self {
        Self {
            passed: true,
            error: None,
        }
    }

    fn fail(error: impl std::fmt::Display) -> Self {
        Self {
            passed: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityReport {
    /// "ok" when both checks pass, "failed" otherwise.
    pub status: String,
    pub message: String,
    pub last_run_at: DateTime<Utc>,
    pub imap: CheckResult,
    pub smtp: CheckResult,
}

impl ConnectivityReport {
    fn from_checks(imap: CheckResult, smtp: CheckResult, now: DateTime<Utc>) -> Self {
        let ok = imap.passed && smtp.passed;
        let message = match (imap.passed, smtp.passed) {
            (true, true) => "all checks passed".to_string(),
            (false, true) => "IMAP check failed".to_string(),
            (true, false) => "SMTP check failed".to_string(),
            (false, false) => "IMAP and SMTP checks failed".to_string(),
        };

        Self {
            status: if ok { "ok" } else { "failed" }.to_string(),
            message,
            last_run_at: now,
            imap,
            smtp,
        }
    }
}

pub struct ConnectivityService {
    store: Arc<Store>,
    vault: Arc<Vault>,
    settings: MailboxSettings,
}

impl ConnectivityService {
    pub fn new(store: Arc<Store>, vault: Arc<Vault>, settings: MailboxSettings) -> Self {
        Self {
            store,
            vault,
            settings,
        }
    }

    /// Run both checks for an account. Check failures land in the report;
    /// only setup problems (unknown account, undecryptable credentials)
    /// surface as errors.
    pub async fn check_account(&self, account_id: &str) -> Result<ConnectivityReport> {
        let now = Utc::now();

        if self.settings.skip_connectivity_checks {
            tracing::info!(account_id, "connectivity checks skipped by configuration");
            return Ok(ConnectivityReport::from_checks(
                CheckResult::pass(),
                CheckResult::pass(),
                now,
            ));
        }

        let account = self.store.get_account(account_id).await?;
        let credentials = self
            .vault
            .decrypt(&account.encrypted_credentials)
            .context("failed to decrypt account credentials")?;

        let imap_account = account.clone();
        let imap_credentials = credentials.clone();
        let imap = tokio::task::spawn_blocking(move || {
            match connector::open_imap_session(&imap_account, &imap_credentials) {
                Ok(mut session) => {
                    session.logout();
                    CheckResult::pass()
                }
                Err(error) => CheckResult::fail(error),
            }
        })
        .await
        .map_err(|error| {
            Error::Other(anyhow::Error::new(error).context("IMAP check task panicked"))
        })?;

        let smtp = match connector::build_smtp_transport(&account, &credentials) {
            Ok(transport) => match transport.test_connection().await {
                Ok(true) => CheckResult::pass(),
                Ok(false) => CheckResult::fail("SMTP server rejected the connection"),
                Err(error) => CheckResult::fail(error),
            },
            Err(error) => CheckResult::fail(error),
        };

        let report = ConnectivityReport::from_checks(imap, smtp, now);
        tracing::info!(
            account = %account.email,
            status = %report.status,
            imap_ok = report.imap.passed,
            smtp_ok = report.smtp.passed,
            "connectivity check finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectivityService;
    use crate::config::MailboxSettings;
    use crate::store::testutil::{test_account, test_store};
    use crate::store::types::{NewAccount, SecurityMode};
    use crate::vault::{Credentials, Vault};
    use std::sync::Arc;

    #[tokio::test]
    async fn skip_flag_reports_ok_without_connecting() {
        let store = Arc::new(test_store().await);
        let account = store.insert_account(test_account()).await.unwrap();

        let service = ConnectivityService::new(
            Arc::clone(&store),
            Arc::new(Vault::new(&Vault::generate_key()).unwrap()),
            MailboxSettings {
                skip_connectivity_checks: true,
                ..MailboxSettings::default()
            },
        );

        let report = service.check_account(&account.id).await.unwrap();
        assert_eq!(report.status, "ok");
        assert!(report.imap.passed);
        assert!(report.smtp.passed);
    }

    #[tokio::test]
    async fn unreachable_servers_fail_both_checks() {
        let store = Arc::new(test_store().await);
        let vault = Arc::new(Vault::new(&Vault::generate_key()).unwrap());
        let blob = vault
            .encrypt(&Credentials {
                username: "ops@example.com".to_string(),
                password: "secret".to_string(),
            })
            .unwrap();

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

        let service = ConnectivityService::new(
            Arc::clone(&store),
            vault,
            MailboxSettings::default(),
        );

        let report = service.check_account(&account.id).await.unwrap();
        assert_eq!(report.status, "failed");
        assert!(!report.imap.passed);
        assert!(report.imap.error.is_some());
        assert!(!report.smtp.passed);
    }
}
