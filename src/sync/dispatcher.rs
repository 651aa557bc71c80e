//! Periodic sync dispatcher.
//!
//! Every tick, pick the stalest due accounts, mark them queued, and spawn
//! one engine task each. Lock contention inside a task is expected when
//! multiple workers share the database and is skipped quietly.

use crate::config::MailboxSettings;
use crate::error::Result;
use crate::store::Store;
use crate::store::types::{MailboxAccount, SyncEvent};
use crate::sync::engine::SyncEngine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Candidate rows pulled per page while hunting for due accounts.
const CANDIDATE_PAGE_SIZE: usize = 100;

pub struct Dispatcher {
    store: Arc<Store>,
    engine: Arc<SyncEngine>,
    settings: MailboxSettings,
}

/// Result of one dispatcher pass. The handles let callers await the
/// spawned syncs; the daemon loop just drops them.
pub struct DispatchOutcome {
    pub dispatched: usize,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, engine: Arc<SyncEngine>, settings: MailboxSettings) -> Self {
        Self {
            store,
            engine,
            settings,
        }
    }

    /// Dispatch forever at the configured cadence. The first pass runs
    /// immediately; a pass that overruns the interval skips the missed
    /// ticks instead of bursting.
    pub async fn run(&self) {
        let period = Duration::from_secs(self.settings.dispatch_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            match self.dispatch_once().await {
                Ok(outcome) if outcome.dispatched > 0 => {
                    tracing::info!(dispatched = outcome.dispatched, "dispatched mailbox syncs");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::error!(%error, "dispatch pass failed");
                }
            }

            ticker.tick().await;
        }
    }

    /// One dispatch pass at the configured limit.
    pub async fn dispatch_once(&self) -> Result<DispatchOutcome> {
        self.dispatch_up_to(self.settings.dispatch_limit).await
    }

    /// One dispatch pass: enqueue up to `limit` due accounts and spawn a
    /// sync task for each. Only dispatched accounts count toward the limit;
    /// candidates are paged so not-due accounts at the front of the
    /// ordering cannot crowd out overdue ones behind them.
    pub async fn dispatch_up_to(&self, limit: usize) -> Result<DispatchOutcome> {
        let now = Utc::now();

        let mut tasks = Vec::new();
        let mut offset = 0;
        'pages: loop {
            let candidates = self
                .store
                .list_sync_candidates(CANDIDATE_PAGE_SIZE, offset)
                .await?;
            let page_len = candidates.len();

            for account in candidates {
                if tasks.len() >= limit {
                    break 'pages;
                }
                if !account.should_sync(now) {
                    continue;
                }

                self.dispatch_account(account, &mut tasks).await?;
            }

            if page_len < CANDIDATE_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        Ok(DispatchOutcome {
            dispatched: tasks.len(),
            tasks,
        })
    }

    async fn dispatch_account(
        &self,
        account: MailboxAccount,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        self.store.mark_queued(&account.id).await?;
        self.store
            .append_sync_log(
                &account.id,
                SyncEvent::Queued,
                "sync queued",
                Some(serde_json::json!({
                    "sync_interval_minutes": account.sync_interval_minutes,
                })),
            )
            .await?;

        let engine = Arc::clone(&self.engine);
        let account_id = account.id.clone();
        let email = account.email;
        tasks.push(tokio::spawn(async move {
            match engine.sync_account(&account_id).await {
                Ok(_) => {}
                Err(error) if error.is_lock_contention() => {
                    tracing::debug!(account = %email, %error, "mailbox already locked, skipping");
                }
                Err(error) => {
                    tracing::warn!(account = %email, %error, "sync task failed");
                }
            }
        }));

        Ok(())
    }
}
