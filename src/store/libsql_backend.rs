//! libSQL backend — implements the log, rule, and credential store traits.
//!
//! The engine owns the `email_logs` table; `rules` and `mailbox_settings`
//! mirror the application schema and are read-only here. Supports local
//! file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::SecretString;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::DatabaseError;
use crate::message::InboundMessage;
use crate::rules::{Action, Condition, Rule};
use crate::store::migrations;
use crate::store::traits::{
    ClaimOutcome, CredentialStore, EmailLog, LogStatus, LogStore, RuleStore,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn str_to_status(s: &str) -> LogStatus {
    match s {
        "processed" => LogStatus::Processed,
        "no_rule_match" => LogStatus::NoRuleMatch,
        "error" => LogStatus::Error,
        _ => LogStatus::Processing,
    }
}

const LOG_COLUMNS: &str =
    "id, user_id, message_id, from_email, subject, body, status, error, rule_id, created_at, updated_at";

fn row_to_log(row: &libsql::Row) -> Result<EmailLog, libsql::Error> {
    let status_str: String = row.get(6)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(EmailLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        message_id: row.get(2)?,
        from_email: row.get(3)?,
        subject: row.get::<String>(4).ok(),
        body: row.get(5)?,
        status: str_to_status(&status_str),
        error: row.get::<String>(7).ok(),
        rule_id: row.get::<String>(8).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

// ── LogStore ────────────────────────────────────────────────────────

#[async_trait]
impl LogStore for LibSqlBackend {
    async fn claim(
        &self,
        user_id: &str,
        message: &InboundMessage,
    ) -> Result<ClaimOutcome, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        // The UNIQUE (user_id, message_id) constraint makes the
        // check-then-create a single atomic step.
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO email_logs
                     (id, user_id, message_id, from_email, subject, body, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'processing', ?7, ?7)
                 ON CONFLICT (user_id, message_id) DO NOTHING",
                params![
                    id.clone(),
                    user_id,
                    message.message_id.clone(),
                    message.from.clone(),
                    opt_text(message.subject.as_deref()),
                    message.body.clone(),
                    now.clone(),
                ],
            )
            .await
            .map_err(query_err)?;

        if inserted > 0 {
            return Ok(ClaimOutcome::Claimed { log_id: id });
        }

        let mut rows = self
            .conn()
            .query(
                "SELECT id, status FROM email_logs WHERE user_id = ?1 AND message_id = ?2",
                params![user_id, message.message_id.clone()],
            )
            .await
            .map_err(query_err)?;

        let row = rows.next().await.map_err(query_err)?.ok_or_else(|| {
            DatabaseError::NotFound {
                entity: "email_log".into(),
                id: message.message_id.clone(),
            }
        })?;

        let log_id: String = row.get(0).map_err(query_err)?;
        let status_str: String = row.get(1).map_err(query_err)?;

        match str_to_status(&status_str) {
            LogStatus::Processed | LogStatus::NoRuleMatch => Ok(ClaimOutcome::AlreadyProcessed),
            // An error row is retried; a leftover `processing` row means a
            // prior run crashed mid-scan — take it over.
            LogStatus::Error | LogStatus::Processing => {
                self.conn()
                    .execute(
                        "UPDATE email_logs
                         SET status = 'processing', error = NULL, updated_at = ?2
                         WHERE id = ?1",
                        params![log_id.clone(), now],
                    )
                    .await
                    .map_err(query_err)?;
                Ok(ClaimOutcome::Reclaimed { log_id })
            }
        }
    }

    async fn complete(
        &self,
        log_id: &str,
        status: LogStatus,
        error: Option<&str>,
        rule_id: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE email_logs
                 SET status = ?2, error = ?3, rule_id = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![
                    log_id,
                    status.as_str(),
                    opt_text(error),
                    opt_text(rule_id),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn record_system_error(
        &self,
        user_id: &str,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO email_logs
                     (id, user_id, message_id, from_email, body, status, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'system', '', 'error', ?4, ?5, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    format!("system-{}", Uuid::new_v4()),
                    error,
                    now,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<EmailLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM email_logs
                     WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            logs.push(row_to_log(&row).map_err(query_err)?);
        }
        Ok(logs)
    }

    async fn get_by_message_id(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<EmailLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM email_logs
                     WHERE user_id = ?1 AND message_id = ?2"
                ),
                params![user_id, message_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_log(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }
}

// ── RuleStore ───────────────────────────────────────────────────────

#[async_trait]
impl RuleStore for LibSqlBackend {
    async fn active_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, name, is_active, priority, conditions, actions
                 FROM rules
                 WHERE user_id = ?1 AND is_active = 1
                 ORDER BY priority DESC, created_at ASC, rowid ASC",
                params![user_id],
            )
            .await
            .map_err(query_err)?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            let conditions_json: String = row.get(5).map_err(query_err)?;
            let actions_json: String = row.get(6).map_err(query_err)?;

            let conditions: Vec<Condition> = match serde_json::from_str(&conditions_json) {
                Ok(c) => c,
                Err(e) => {
                    // A malformed row is skipped, not fatal to the scan.
                    warn!(rule_id = %id, error = %e, "Skipping rule with malformed conditions");
                    continue;
                }
            };
            let actions: Vec<Action> = match serde_json::from_str(&actions_json) {
                Ok(a) => a,
                Err(e) => {
                    warn!(rule_id = %id, error = %e, "Skipping rule with malformed actions");
                    continue;
                }
            };

            rules.push(Rule {
                id,
                user_id: row.get(1).map_err(query_err)?,
                name: row.get(2).map_err(query_err)?,
                is_active: row.get::<i64>(3).map_err(query_err)? != 0,
                priority: row.get(4).map_err(query_err)?,
                conditions,
                actions,
            });
        }
        Ok(rules)
    }
}

// ── CredentialStore ─────────────────────────────────────────────────

#[async_trait]
impl CredentialStore for LibSqlBackend {
    async fn mailbox_config(
        &self,
        user_id: &str,
    ) -> Result<Option<MailboxConfig>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT imap_host, imap_port, imap_user, imap_password,
                        smtp_host, smtp_port, smtp_user, smtp_password,
                        from_name, from_email, access_token, use_idle
                 FROM mailbox_settings WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err)?;

        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Ok(None);
        };

        let imap_password: String = row.get(3).map_err(query_err)?;
        let smtp_password: String = row.get(7).map_err(query_err)?;
        let access_token: Option<String> = row.get::<String>(10).ok();

        Ok(Some(MailboxConfig {
            imap_host: row.get(0).map_err(query_err)?,
            imap_port: row.get::<i64>(1).map_err(query_err)? as u16,
            imap_user: row.get(2).map_err(query_err)?,
            imap_password: SecretString::from(imap_password),
            smtp_host: row.get(4).map_err(query_err)?,
            smtp_port: row.get::<i64>(5).map_err(query_err)? as u16,
            smtp_user: row.get(6).map_err(query_err)?,
            smtp_password: SecretString::from(smtp_password),
            from_name: row.get(8).map_err(query_err)?,
            from_email: row.get(9).map_err(query_err)?,
            access_token: access_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            use_idle: row.get::<i64>(11).map_err(query_err)? != 0,
        }))
    }
}
