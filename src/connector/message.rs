//! Typed view of a fetched RFC822 message.
//!
//! Parsing happens once, at the IMAP boundary; everything downstream
//! (engine, cache, outbound threading) works with [`FetchedMessage`]
//! instead of raw MIME.

use crate::text;
use anyhow::Context as _;
use chrono::{DateTime, TimeZone as _, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap as _, ParsedMail};

/// Domain used when synthesizing message-ids for messages that carry none.
const SYNTHETIC_ID_DOMAIN: &str = "mailroom.local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub address: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub filename: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// One message as fetched from the provider, fully parsed.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// Provider UID within the selected folder.
    pub uid: u32,
    /// Normalized message-id, angle brackets stripped. Synthesized when
    /// the message carries none, so dedup always has a key.
    pub message_id: String,
    /// References > In-Reply-To > own message-id, first id wins.
    pub thread_id: String,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub size_bytes: i64,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub attachments: Vec<FetchedAttachment>,
}

impl FetchedMessage {
    /// Ordering key, newest first. Dateless messages sort last.
    pub fn sort_timestamp(&self) -> i64 {
        self.date.map(|date| date.timestamp()).unwrap_or(0)
    }

    pub fn snippet(&self) -> String {
        text::snippet(self.text_body.as_deref(), self.html_body.as_deref())
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Strip angle brackets and surrounding whitespace from a message-id.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Parse a raw RFC822 message into the typed form. `size` is the
/// server-reported RFC822.SIZE when available.
pub fn parse_fetched(raw: &[u8], uid: u32, size: Option<u32>) -> anyhow::Result<FetchedMessage> {
    let parsed = mailparse::parse_mail(raw).context("failed to parse MIME message")?;
    let headers = &parsed.headers;

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|value| normalize_message_id(&value))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("{}@{SYNTHETIC_ID_DOMAIN}", uuid::Uuid::new_v4()));

    let thread_id = thread_id_from_headers(&parsed, &message_id);

    let subject = headers
        .get_first_value("Subject")
        .map(|value| text::squish(&value))
        .filter(|value| !value.is_empty());

    let date = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());

    let mut bodies = BodyParts::default();
    collect_parts(&parsed, &mut bodies);

    Ok(FetchedMessage {
        uid,
        message_id,
        thread_id,
        subject,
        date,
        size_bytes: size.map(i64::from).unwrap_or(raw.len() as i64),
        text_body: none_if_blank(bodies.text),
        html_body: none_if_blank(bodies.html),
        from: parse_addresses(headers.get_first_value("From")),
        to: parse_addresses(headers.get_first_value("To")),
        cc: parse_addresses(headers.get_first_value("Cc")),
        bcc: parse_addresses(headers.get_first_value("Bcc")),
        attachments: bodies.attachments,
    })
}

fn thread_id_from_headers(parsed: &ParsedMail<'_>, message_id: &str) -> String {
    for header in ["References", "In-Reply-To"] {
        if let Some(value) = parsed.headers.get_first_value(header) {
            if let Some(first) = value.split_whitespace().next() {
                let normalized = normalize_message_id(first);
                if !normalized.is_empty() {
                    return normalized;
                }
            }
        }
    }

    message_id.to_string()
}

#[derive(Default)]
struct BodyParts {
    text: String,
    html: String,
    attachments: Vec<FetchedAttachment>,
}

/// Walk the MIME tree, accumulating the first-class bodies and any parts
/// marked (or shaped like) attachments.
fn collect_parts(part: &ParsedMail<'_>, out: &mut BodyParts) {
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());

    let is_attachment = disposition.disposition == DispositionType::Attachment
        || (filename.is_some() && !part.ctype.mimetype.starts_with("multipart/"));

    if is_attachment {
        match part.get_body_raw() {
            Ok(content) => {
                let filename = filename
                    .unwrap_or_else(|| format!("attachment-{}", out.attachments.len() + 1));
                out.attachments.push(FetchedAttachment {
                    filename,
                    mime_type: part.ctype.mimetype.clone(),
                    content,
                });
            }
            Err(error) => {
                tracing::warn!(%error, "failed to decode attachment part, skipping");
            }
        }
        return;
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" => {
            if let Ok(body) = part.get_body() {
                out.text.push_str(&body);
            }
        }
        "text/html" => {
            if let Ok(body) = part.get_body() {
                out.html.push_str(&body);
            }
        }
        _ => {}
    }

    for subpart in &part.subparts {
        collect_parts(subpart, out);
    }
}

fn parse_addresses(header: Option<String>) -> Vec<MailAddress> {
    let Some(header) = header else {
        return Vec::new();
    };

    let Ok(parsed) = mailparse::addrparse(&header) else {
        tracing::debug!(header, "failed to parse address header");
        return Vec::new();
    };

    let mut addresses = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => addresses.push(MailAddress {
                address: info.addr.clone(),
                name: info.display_name.clone(),
            }),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    addresses.push(MailAddress {
                        address: info.addr.clone(),
                        name: info.display_name.clone(),
                    });
                }
            }
        }
    }

    addresses
}

fn none_if_blank(value: String) -> Option<String> {
    if value.trim().is_empty() { None } else { Some(value) }
}
