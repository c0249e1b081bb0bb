//! Error types for mailflow.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Incomplete mailbox credentials: missing {missing}")]
    IncompleteCredentials { missing: String },

    #[error("No inbound transport configured (needs IMAP credentials or an access token)")]
    NoInboundTransport,
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox transport errors.
///
/// `Connect` and `Auth` surface to the caller of `start()`; `Transient`
/// aborts the current scan and the monitor retries on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transient(String),
}

/// Message decoding errors. The affected message is logged with status
/// `error` and skipped; the rest of the scan continues.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unparseable message: {0}")]
    Message(String),

    #[error("Invalid body encoding: {0}")]
    Decode(String),
}

/// Action execution errors — logged against the rule/action that failed;
/// remaining actions and rules for the same message continue.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("SMTP transport not configured")]
    SmtpNotConfigured,
}

/// Monitor lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor already running for user {user_id}")]
    AlreadyRunning { user_id: String },

    #[error("No mailbox credentials configured for user {user_id}")]
    NoCredentials { user_id: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
