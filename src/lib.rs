//! CRM mailbox synchronization engine.
//!
//! Ingests mail over IMAP with per-account UID watermarks, serializes
//! passes with lease-based mailbox locks, caches bodies and attachments
//! on demand, and sends outbound mail over SMTP.

pub mod blob;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod connector;
pub mod error;
pub mod outbound;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod text;
pub mod vault;

pub use error::{Error, Result};
