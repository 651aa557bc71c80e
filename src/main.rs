use anyhow::Context as _;
use clap::{Parser, Subcommand};
use mailroom::blob::BlobStore;
use mailroom::cache::BodyCacheService;
use mailroom::config::AppConfig;
use mailroom::connectivity::ConnectivityService;
use mailroom::outbound::{OutboundEmail, OutboundMailService};
use mailroom::store::Store;
use mailroom::store::types::{NewAccount, SecurityMode};
use mailroom::sync::{Dispatcher, SyncEngine};
use mailroom::vault::{Credentials, Vault};
use mailroom::{Error, telemetry};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mailroom", version, about = "CRM mailbox synchronization service")]
struct Cli {
    /// Configuration file; `MAILROOM_*` environment variables override it.
    #[arg(long, default_value = "mailroom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync dispatcher until interrupted.
    Run,
    /// Run a single dispatch pass and wait for the spawned syncs.
    DispatchOnce {
        /// Override the configured dispatch limit for this pass.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Sync one account immediately, bypassing the schedule.
    SyncNow { account_id: String },
    /// Fetch and cache the full body for a stored email.
    CacheBody { email_id: String },
    /// Send a message from an account.
    Send {
        account_id: String,
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long)]
        subject: String,
        /// HTML body.
        #[arg(long)]
        body: String,
        /// Message-id being replied to, for threading.
        #[arg(long)]
        in_reply_to: Option<String>,
    },
    /// Check IMAP and SMTP connectivity for an account.
    TestConnection { account_id: String },
    /// Reset accounts stuck in queued/syncing and expire all locks.
    ClearStale,
    /// Provision a new email account.
    AddAccount {
        #[arg(long)]
        email: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        imap_host: String,
        #[arg(long, default_value_t = 993)]
        imap_port: u16,
        #[arg(long)]
        smtp_host: String,
        #[arg(long, default_value_t = 465)]
        smtp_port: u16,
        /// none, ssl, tls, or starttls.
        #[arg(long, default_value = "ssl")]
        security: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value_t = 15)]
        sync_interval_minutes: i64,
    },
    /// Print a fresh base64 vault key for the configuration file.
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Key generation must work before any configuration exists, so it is
    // handled ahead of the config load; the match arm below is a no-op.
    if matches!(cli.command, Command::GenerateKey) {
        println!("{}", Vault::generate_key());
        return Ok(());
    }

    let config = AppConfig::load(&cli.config)?;
    let _log_guard = telemetry::init(&config.log);

    let store = Arc::new(Store::connect(&config.database_url).await?);
    let vault = Arc::new(Vault::new(&config.vault_key)?);
    let blobs = BlobStore::new(&config.blob_root);
    let settings = config.mailboxes.clone();

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&store),
        Arc::clone(&vault),
        settings.clone(),
    ));

    match cli.command {
        Command::Run => {
            tracing::info!(
                interval_secs = settings.dispatch_interval_secs,
                limit = settings.dispatch_limit,
                "starting sync dispatcher"
            );
            let dispatcher = Dispatcher::new(Arc::clone(&store), engine, settings);
            dispatcher.run().await;
        }
        Command::DispatchOnce { limit } => {
            let limit = limit.unwrap_or(settings.dispatch_limit);
            let dispatcher = Dispatcher::new(Arc::clone(&store), engine, settings);
            let outcome = dispatcher.dispatch_up_to(limit).await?;
            for task in outcome.tasks {
                task.await.context("sync task panicked")?;
            }
            println!("dispatched {} account(s)", outcome.dispatched);
        }
        Command::SyncNow { account_id } => match engine.sync_account(&account_id).await {
            Ok(outcome) => println!(
                "processed {} message(s), watermark {}",
                outcome.processed, outcome.watermark
            ),
            Err(Error::AlreadyLocked { owner, locked_until }) => {
                println!("mailbox is locked by {owner} until {locked_until}; skipped");
            }
            Err(error) => return Err(error.into()),
        },
        Command::CacheBody { email_id } => {
            let cache = BodyCacheService::new(store, vault, blobs, settings);
            let cached = cache.fetch_and_cache(&email_id).await?;
            println!(
                "cached body at {} ({} attachment(s) downloaded, {} skipped)",
                cached.body_ref, cached.downloaded_attachments, cached.skipped_attachments
            );
        }
        Command::Send {
            account_id,
            to,
            cc,
            subject,
            body,
            in_reply_to,
        } => {
            let outbound = OutboundMailService::new(store, vault, blobs, settings);
            let email_id = outbound
                .send(
                    &account_id,
                    OutboundEmail {
                        to,
                        cc,
                        bcc: Vec::new(),
                        subject,
                        body_html: body,
                        in_reply_to,
                        attachments: Vec::new(),
                    },
                )
                .await?;
            println!("sent; stored as email {email_id}");
        }
        Command::TestConnection { account_id } => {
            let connectivity = ConnectivityService::new(store, vault, settings);
            let report = connectivity.check_account(&account_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ClearStale => {
            let (accounts, locks) = store.reset_stale(chrono::Utc::now()).await?;
            println!("reset {accounts} account(s), expired {locks} lock(s)");
        }
        Command::AddAccount {
            email,
            display_name,
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            security,
            username,
            password,
            sync_interval_minutes,
        } => {
            let encrypted_credentials = vault.encrypt(&Credentials { username, password })?;
            let account = store
                .insert_account(NewAccount {
                    email,
                    display_name,
                    imap_host,
                    imap_port,
                    smtp_host,
                    smtp_port,
                    security_mode: SecurityMode::parse(&security),
                    encrypted_credentials,
                    sync_interval_minutes,
                })
                .await?;
            println!("created account {} ({})", account.id, account.email);
        }
        Command::GenerateKey => {}
    }

    Ok(())
}
