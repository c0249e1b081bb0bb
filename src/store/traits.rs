//! Storage traits and the audit-log types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::MailboxConfig;
use crate::error::DatabaseError;
use crate::message::InboundMessage;
use crate::rules::Rule;

/// Processing status of an audit-log entry.
///
/// `Processing` is the only non-terminal status. `Processed` and
/// `NoRuleMatch` are terminal and block reprocessing of the same message
/// id; `Error` is terminal but may be reclaimed for retry on the next scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Processing,
    Processed,
    NoRuleMatch,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Processing => "processing",
            LogStatus::Processed => "processed",
            LogStatus::NoRuleMatch => "no_rule_match",
            LogStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogStatus::Processing)
    }
}

/// One audit-log row per (attempted) processing of a message.
#[derive(Debug, Clone)]
pub struct EmailLog {
    pub id: String,
    pub user_id: String,
    pub message_id: String,
    pub from_email: String,
    pub subject: Option<String>,
    pub body: String,
    pub status: LogStatus,
    pub error: Option<String>,
    pub rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of claiming a message id for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A fresh `processing` row was created; finish with `complete()`.
    Claimed { log_id: String },
    /// A prior `error` (or crash-orphaned `processing`) row was taken over.
    Reclaimed { log_id: String },
    /// A terminal non-error row exists; skip this message silently.
    AlreadyProcessed,
}

/// Audit-log store, owned by the engine.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Atomically claim a message id for processing.
    ///
    /// The check-then-create is a single guarded insert: concurrent claims
    /// for the same message id yield exactly one `Claimed`.
    async fn claim(
        &self,
        user_id: &str,
        message: &InboundMessage,
    ) -> Result<ClaimOutcome, DatabaseError>;

    /// Transition a claimed row to a terminal status.
    async fn complete(
        &self,
        log_id: &str,
        status: LogStatus,
        error: Option<&str>,
        rule_id: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Record an engine-level failure not tied to a specific message
    /// (transport drop, unparseable payload). Written with
    /// `from_email = "system"` and status `error`.
    async fn record_system_error(&self, user_id: &str, error: &str)
        -> Result<(), DatabaseError>;

    /// Most recent entries for a user, newest first.
    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<EmailLog>, DatabaseError>;

    /// Look up the log entry for a message id, if any.
    async fn get_by_message_id(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<EmailLog>, DatabaseError>;
}

/// Read-only view of the rule store.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules for a user, ordered priority-descending then creation
    /// order.
    async fn active_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError>;
}

/// Read-only view of the credential store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Mailbox credentials for a user, or `None` when not configured.
    async fn mailbox_config(
        &self,
        user_id: &str,
    ) -> Result<Option<MailboxConfig>, DatabaseError>;
}
