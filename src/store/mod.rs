//! Persistence layer — the audit log the engine owns, plus read-only
//! views of the rule and credential stores.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ClaimOutcome, CredentialStore, EmailLog, LogStatus, LogStore, RuleStore,
};
