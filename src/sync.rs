//! Mailbox synchronization: the per-account engine and the periodic
//! dispatcher that fans passes out across due accounts.

pub mod dispatcher;
pub mod engine;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use engine::{SyncEngine, SyncOutcome};
