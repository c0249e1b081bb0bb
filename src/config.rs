//! Configuration types — mailbox credentials and engine tuning.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;
use crate::rules::matcher::MatchMode;

/// Per-user mailbox credentials, supplied by the credential store.
///
/// The engine never mutates these. A populated `access_token` selects the
/// provider-API (Gmail-style) source; otherwise the IMAP block is used,
/// with `use_idle` choosing between plain polling and IDLE push.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_password: SecretString,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: SecretString,
    pub from_name: String,
    pub from_email: String,
    /// OAuth bearer token for provider-API mailboxes. Refresh is the
    /// credential store's responsibility.
    pub access_token: Option<SecretString>,
    pub use_idle: bool,
}

impl MailboxConfig {
    /// Check the no-partial-credentials invariant.
    ///
    /// Inbound needs either an access token or a complete IMAP block.
    /// The SMTP block must be complete or entirely absent — a token-only
    /// mailbox may monitor without SMTP, but reply/forward actions will
    /// fail at send time and be logged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.is_none() {
            let missing = self.missing_imap_fields();
            if missing.len() == 3 {
                return Err(ConfigError::NoInboundTransport);
            }
            if !missing.is_empty() {
                return Err(ConfigError::IncompleteCredentials {
                    missing: missing.join(", "),
                });
            }
        }

        if self.smtp_configured() {
            let mut missing = Vec::new();
            if self.smtp_host.is_empty() {
                missing.push("smtp_host");
            }
            if self.smtp_user.is_empty() {
                missing.push("smtp_user");
            }
            if self.smtp_password.expose_secret().is_empty() {
                missing.push("smtp_password");
            }
            if self.from_email.is_empty() {
                missing.push("from_email");
            }
            if !missing.is_empty() {
                return Err(ConfigError::IncompleteCredentials {
                    missing: missing.join(", "),
                });
            }
        }

        Ok(())
    }

    /// Whether any part of the SMTP block is present.
    pub fn smtp_configured(&self) -> bool {
        !self.smtp_host.is_empty()
            || !self.smtp_user.is_empty()
            || !self.smtp_password.expose_secret().is_empty()
    }

    fn missing_imap_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.imap_host.is_empty() {
            missing.push("imap_host");
        }
        if self.imap_user.is_empty() {
            missing.push("imap_user");
        }
        if self.imap_password.expose_secret().is_empty() {
            missing.push("imap_password");
        }
        missing
    }
}

/// Engine-wide tuning, shared by all monitors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between scheduled scans.
    pub scan_interval: Duration,
    /// Rule execution mode, fixed per deployment.
    pub match_mode: MatchMode,
    /// Number of log entries returned by `status()`.
    pub recent_logs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            match_mode: MatchMode::FirstMatch,
            recent_logs: 20,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let scan_interval_secs: u64 = std::env::var("MAILFLOW_SCAN_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let match_mode = std::env::var("MAILFLOW_MATCH_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let recent_logs: usize = std::env::var("MAILFLOW_RECENT_LOGS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);

        Self {
            scan_interval: Duration::from_secs(scan_interval_secs),
            match_mode,
            recent_logs,
        }
    }
}
