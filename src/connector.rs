//! Mailbox connection factory: authenticated IMAP sessions and configured
//! SMTP transports from account settings plus plaintext credentials.
//!
//! No retries happen here; connection failures surface to the caller,
//! which owns the session lifecycle and must log out on every exit path.

pub mod message;

use crate::error::{Error, Result};
use crate::store::types::{MailboxAccount, SecurityMode};
use crate::vault::Credentials;
use anyhow::Context as _;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, Tokio1Executor};
use message::FetchedMessage;
use std::io::Read as _;
use std::net::TcpStream;

const FETCH_CHUNK_SIZE: usize = 50;
const FETCH_ITEMS: &str = "(UID RFC822.SIZE RFC822)";

type TlsSession = imap::Session<native_tls::TlsStream<TcpStream>>;
type PlainSession = imap::Session<TcpStream>;

/// A live IMAP session over either an encrypted or a plain stream.
pub enum MailSession {
    Tls(TlsSession),
    Plain(PlainSession),
}

impl MailSession {
    pub fn select(&mut self, folder: &str) -> imap::error::Result<imap::types::Mailbox> {
        match self {
            MailSession::Tls(session) => session.select(folder),
            MailSession::Plain(session) => session.select(folder),
        }
    }

    pub fn uid_search(&mut self, query: &str) -> imap::error::Result<std::collections::HashSet<u32>> {
        match self {
            MailSession::Tls(session) => session.uid_search(query),
            MailSession::Plain(session) => session.uid_search(query),
        }
    }

    pub fn uid_fetch(
        &mut self,
        uid_set: &str,
        query: &str,
    ) -> imap::error::Result<imap::types::ZeroCopy<Vec<imap::types::Fetch>>> {
        match self {
            MailSession::Tls(session) => session.uid_fetch(uid_set, query),
            MailSession::Plain(session) => session.uid_fetch(uid_set, query),
        }
    }

    /// Best-effort logout; servers that drop the connection first are fine.
    pub fn logout(&mut self) {
        let result = match self {
            MailSession::Tls(session) => session.logout(),
            MailSession::Plain(session) => session.logout(),
        };
        if let Err(error) = result {
            tracing::debug!(%error, "IMAP logout failed");
        }
    }
}

/// Open and authenticate an IMAP session. Blocking; run inside
/// `spawn_blocking` from async contexts.
pub fn open_imap_session(
    account: &MailboxAccount,
    credentials: &Credentials,
) -> Result<MailSession> {
    let host = account.imap_host.as_str();
    let port = account.imap_port;

    match account.security_mode {
        SecurityMode::Ssl => {
            let tls = tls_connector()?;
            let client = imap::connect((host, port), host, &tls).map_err(|error| {
                Error::Connect(
                    anyhow::Error::new(error)
                        .context(format!("failed to connect to IMAP server {host}:{port}")),
                )
            })?;
            let session = client
                .login(&credentials.username, &credentials.password)
                .map_err(|(error, _)| login_error(error, host))?;
            Ok(MailSession::Tls(session))
        }
        SecurityMode::Tls | SecurityMode::StartTls => {
            let tls = tls_connector()?;
            let client = imap::connect_starttls((host, port), host, &tls).map_err(|error| {
                Error::Connect(anyhow::Error::new(error).context(format!(
                    "failed to connect to IMAP server {host}:{port} with STARTTLS"
                )))
            })?;
            let session = client
                .login(&credentials.username, &credentials.password)
                .map_err(|(error, _)| login_error(error, host))?;
            Ok(MailSession::Tls(session))
        }
        SecurityMode::None => {
            let mut stream = TcpStream::connect((host, port)).map_err(|error| {
                Error::Connect(
                    anyhow::Error::new(error)
                        .context(format!("failed to connect to IMAP server {host}:{port}")),
                )
            })?;
            // Client::new does not consume the server greeting, so read the
            // greeting line off the socket before handing the stream over.
            read_greeting(&mut stream)
                .map_err(|error| Error::Connect(anyhow::Error::new(error).context("failed to read IMAP greeting")))?;
            let client = imap::Client::new(stream);
            let session = client
                .login(&credentials.username, &credentials.password)
                .map_err(|(error, _)| login_error(error, host))?;
            Ok(MailSession::Plain(session))
        }
    }
}

/// Build the SMTP transport for an account. The transport is lazy; no
/// connection happens until a send or an explicit `test_connection`.
pub fn build_smtp_transport(
    account: &MailboxAccount,
    credentials: &Credentials,
) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let host = account.smtp_host.as_str();

    let builder = match account.security_mode {
        SecurityMode::Ssl => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|error| Error::Connect(anyhow::Error::new(error).context(format!("invalid SMTP host '{host}'"))))?,
        SecurityMode::Tls | SecurityMode::StartTls => {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(|error| {
                Error::Connect(anyhow::Error::new(error).context(format!("invalid SMTP host '{host}'")))
            })?
        }
        SecurityMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
    };

    Ok(builder
        .port(account.smtp_port)
        .credentials(SmtpCredentials::new(
            credentials.username.clone(),
            credentials.password.clone(),
        ))
        .build())
}

/// Fetch up to `limit` of the most recent messages in a folder, optionally
/// bounded server-side with a SINCE hint. The hint is advisory only;
/// callers re-filter by UID watermark because servers do not reliably
/// honor ordering or SINCE.
pub fn fetch_recent(
    session: &mut MailSession,
    folder: &str,
    limit: usize,
    since: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<Vec<FetchedMessage>> {
    session
        .select(folder)
        .map_err(|error| Error::Other(anyhow::Error::new(error).context(format!("failed to select IMAP folder '{folder}'"))))?;

    let criterion = match since {
        Some(since) => format!("SINCE {}", since.format("%d-%b-%Y")),
        None => "ALL".to_string(),
    };

    let mut uids: Vec<u32> = session
        .uid_search(&criterion)
        .map_err(|error| Error::Other(anyhow::Error::new(error).context("IMAP search failed")))?
        .into_iter()
        .collect();

    // Highest UIDs are the most recently delivered; keep `limit` of them.
    uids.sort_unstable_by(|left, right| right.cmp(left));
    uids.truncate(limit);

    let mut messages = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(FETCH_CHUNK_SIZE) {
        let uid_set = chunk
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches = session
            .uid_fetch(&uid_set, FETCH_ITEMS)
            .map_err(|error| Error::Other(anyhow::Error::new(error).context("IMAP fetch failed")))?;

        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let Some(raw) = fetch.body() else {
                tracing::warn!(folder, uid, "fetch returned no body, skipping message");
                continue;
            };

            match message::parse_fetched(raw, uid, fetch.size) {
                Ok(message) => messages.push(message),
                Err(error) => {
                    // Per-message parse failures skip the message, not the pass.
                    tracing::warn!(folder, uid, %error, "failed to parse fetched message, skipping");
                }
            }
        }
    }

    Ok(messages)
}

/// Locate one message by provider UID (preferred) or message-id (fallback).
pub fn locate_message(
    session: &mut MailSession,
    folder: &str,
    uid: Option<u32>,
    message_id: &str,
) -> Result<FetchedMessage> {
    session
        .select(folder)
        .map_err(|error| Error::Other(anyhow::Error::new(error).context(format!("failed to select IMAP folder '{folder}'"))))?;

    if let Some(uid) = uid {
        let fetches = session
            .uid_fetch(&uid.to_string(), FETCH_ITEMS)
            .map_err(|error| Error::Other(anyhow::Error::new(error).context("IMAP fetch failed")))?;

        for fetch in fetches.iter() {
            if let Some(raw) = fetch.body() {
                return message::parse_fetched(raw, fetch.uid.unwrap_or(uid), fetch.size)
                    .map_err(Error::Other);
            }
        }
    }

    // UID lookup failed or was unavailable; fall back to a header search.
    if let Some(criterion) = message_id_search_criterion(message_id) {
        let uids = session
            .uid_search(&criterion)
            .map_err(|error| Error::Other(anyhow::Error::new(error).context("IMAP message-id search failed")))?;

        if let Some(found) = uids.into_iter().next() {
            let fetches = session
                .uid_fetch(&found.to_string(), FETCH_ITEMS)
                .map_err(|error| Error::Other(anyhow::Error::new(error).context("IMAP fetch failed")))?;

            for fetch in fetches.iter() {
                if let Some(raw) = fetch.body() {
                    return message::parse_fetched(raw, fetch.uid.unwrap_or(found), fetch.size)
                        .map_err(Error::Other);
                }
            }
        }
    }

    Err(Error::MessageNotFound)
}

/// Build a `HEADER Message-ID` criterion, refusing ids that would break
/// out of a quoted IMAP string.
fn message_id_search_criterion(message_id: &str) -> Option<String> {
    let message_id = message::normalize_message_id(message_id);
    if message_id.is_empty() || message_id.contains(['\r', '\n']) {
        return None;
    }

    let escaped = format!("<{message_id}>")
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    Some(format!("HEADER Message-ID \"{escaped}\""))
}

fn tls_connector() -> Result<native_tls::TlsConnector> {
    native_tls::TlsConnector::builder()
        .build()
        .context("failed to build TLS connector")
        .map_err(Error::Connect)
}

fn login_error(error: imap::error::Error, host: &str) -> Error {
    Error::Connect(
        anyhow::Error::new(error).context(format!("failed to authenticate to IMAP server {host}")),
    )
}

/// Consume the untagged `* OK` greeting from a plain-TCP IMAP stream.
fn read_greeting(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while line.len() < 8192 {
        let read = stream.read(&mut byte)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before IMAP greeting",
            ));
        }
        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(());
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "IMAP greeting exceeded 8192 bytes",
    ))
}

#[cfg(test)]
mod tests {
    use super::message_id_search_criterion;

    #[test]
    fn message_id_criterion_is_quoted_and_escaped() {
        let criterion = message_id_search_criterion("abc\"def@example.com").unwrap();
        assert_eq!(criterion, "HEADER Message-ID \"<abc\\\"def@example.com>\"");
    }

    #[test]
    fn message_id_criterion_rejects_header_injection() {
        assert!(message_id_search_criterion("evil\r\nSEARCH").is_none());
        assert!(message_id_search_criterion("   ").is_none());
    }
}
