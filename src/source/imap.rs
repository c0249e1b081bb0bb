//! Raw IMAP-over-TLS polling source.
//!
//! A hand-rolled minimal IMAP client: LOGIN, SELECT INBOX, UID SEARCH
//! UNSEEN, UID FETCH, UID STORE. Messages are marked `\Seen` as they are
//! fetched (at-least-once delivery — a crash before the mark redelivers on
//! the next scan, and the audit-log claim turns the redelivery into a
//! no-op). Blocking socket I/O runs under `spawn_blocking`; every call
//! establishes a fresh session.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::{ParseError, TransportError};
use crate::message::InboundMessage;
use crate::source::{Fetched, MessageSource, strip_html};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// IMAP polling source.
pub struct ImapSource {
    config: MailboxConfig,
}

impl ImapSource {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MessageSource for ImapSource {
    fn name(&self) -> &'static str {
        "imap"
    }

    async fn check(&self) -> Result<(), TransportError> {
        let config = self.config.clone();
        run_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.login(&config)?;
            session.logout();
            Ok(())
        })
        .await
    }

    async fn fetch_unseen(&self) -> Result<Vec<Fetched>, TransportError> {
        let config = self.config.clone();
        run_blocking(move || fetch_unseen_blocking(&config)).await
    }

    async fn archive(&self, message: &InboundMessage) -> Result<(), TransportError> {
        // The raw transport has no folder semantics; archive is a no-op
        // success, not a failure.
        debug!(message_id = %message.message_id, "Archive is a no-op on the IMAP transport");
        Ok(())
    }

    async fn add_label(
        &self,
        message: &InboundMessage,
        name: &str,
    ) -> Result<(), TransportError> {
        let config = self.config.clone();
        let uid = message.source_ref.clone();
        let keyword = keyword_atom(name);
        run_blocking(move || {
            let mut session = ImapSession::connect(&config)?;
            session.login(&config)?;
            session.select_inbox()?;
            // Keyword flags need no create step, so the attach is
            // inherently idempotent.
            session.uid_store(&uid, &keyword)?;
            session.logout();
            Ok(())
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::Transient(format!("blocking task failed: {e}")))?
}

/// Run a single fetch session: search unseen, fetch bodies, mark seen.
fn fetch_unseen_blocking(config: &MailboxConfig) -> Result<Vec<Fetched>, TransportError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;
    session.select_inbox()?;

    let uids = session.uid_search_unseen()?;
    let mut results = Vec::new();

    for uid in &uids {
        let raw = session.uid_fetch_raw(uid)?;

        if let Err(e) = session.uid_store(uid, "\\Seen") {
            warn!(uid = %uid, error = %e, "Failed to mark message seen");
        }

        match parse_message(raw.as_bytes(), uid) {
            Ok(message) => results.push(Fetched::Parsed(message)),
            Err(error) => results.push(Fetched::Unparsed {
                source_ref: uid.clone(),
                error,
            }),
        }
    }

    session.logout();
    Ok(results)
}

/// Build an [`InboundMessage`] from a raw RFC822 payload.
fn parse_message(raw: &[u8], source_ref: &str) -> Result<InboundMessage, ParseError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ParseError::Message("unparseable RFC822 payload".into()))?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();
    let to = parsed
        .to()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let body = if let Some(text) = parsed.body_text(0) {
        text.to_string()
    } else if let Some(html) = parsed.body_html(0) {
        strip_html(html.as_ref())
    } else {
        String::new()
    };

    let received_at = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let message_id = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    Ok(InboundMessage {
        message_id,
        source_ref: source_ref.to_string(),
        from,
        to,
        subject: parsed.subject().map(str::to_string),
        body,
        received_at,
    })
}

/// Reduce a label name to an IMAP keyword atom.
fn keyword_atom(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_search_uids(lines: &[String]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                uids.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }
    uids
}

fn transient(e: std::io::Error) -> TransportError {
    TransportError::Transient(e.to_string())
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One IMAP session over TLS. Commands are tagged A1, A2, ...
pub(crate) struct ImapSession {
    stream: TlsStream,
    tag: u32,
}

impl ImapSession {
    pub(crate) fn connect(config: &MailboxConfig) -> Result<Self, TransportError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port)).map_err(|e| {
            TransportError::Connect(format!(
                "{}:{}: {e}",
                config.imap_host, config.imap_port
            ))
        })?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'_> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())
                .map_err(|e| TransportError::Connect(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| TransportError::Connect(format!("TLS setup: {e}")))?;

        let mut session = Self {
            stream: rustls::StreamOwned::new(conn, tcp),
            tag: 0,
        };

        session
            .read_line()
            .map_err(|e| TransportError::Connect(format!("no greeting: {e}")))?;
        Ok(session)
    }

    pub(crate) fn login(&mut self, config: &MailboxConfig) -> Result<(), TransportError> {
        let lines = self.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.imap_user,
            config.imap_password.expose_secret()
        ))?;
        if lines.last().is_some_and(|l| l.contains("OK")) {
            Ok(())
        } else {
            Err(TransportError::Auth(format!(
                "IMAP login rejected for {}",
                config.imap_user
            )))
        }
    }

    pub(crate) fn select_inbox(&mut self) -> Result<(), TransportError> {
        self.command_ok("SELECT \"INBOX\"", "SELECT INBOX").map(|_| ())
    }

    fn uid_search_unseen(&mut self) -> Result<Vec<String>, TransportError> {
        let lines = self.command_ok("UID SEARCH UNSEEN", "UID SEARCH")?;
        Ok(parse_search_uids(&lines))
    }

    fn uid_fetch_raw(&mut self, uid: &str) -> Result<String, TransportError> {
        let lines = self.command(&format!("UID FETCH {uid} RFC822"))?;
        // Drop the untagged FETCH open line and the tagged completion;
        // the parser tolerates the trailing ')'.
        Ok(lines
            .iter()
            .skip(1)
            .take(lines.len().saturating_sub(2))
            .cloned()
            .collect())
    }

    fn uid_store(&mut self, uid: &str, flag: &str) -> Result<(), TransportError> {
        self.command_ok(&format!("UID STORE {uid} +FLAGS ({flag})"), "UID STORE")
            .map(|_| ())
    }

    pub(crate) fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }

    /// Enter IDLE and block until the server reports new mail, the read
    /// timeout elapses, or the connection drops. Returns true on new mail.
    pub(crate) fn idle_wait(&mut self) -> Result<bool, TransportError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        self.write_raw(&format!("{tag} IDLE\r\n"))?;

        let first = self.read_line().map_err(transient)?;
        if !first.starts_with('+') {
            return Err(TransportError::Transient(format!(
                "IDLE rejected: {}",
                first.trim_end()
            )));
        }

        let new_mail = loop {
            match self.read_line() {
                Ok(line) if line.contains(" EXISTS") => break true,
                // Server terminated the IDLE on its own.
                Ok(line) if line.starts_with(&tag) => return Ok(false),
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    break false;
                }
                Err(e) => return Err(TransportError::Transient(format!("IDLE read: {e}"))),
            }
        };

        // Terminate the IDLE before any other command
        self.write_raw("DONE\r\n")?;
        loop {
            let line = self.read_line().map_err(transient)?;
            if line.starts_with(&tag) {
                break;
            }
        }
        Ok(new_mail)
    }

    /// Raise the socket read timeout, for long IDLE waits.
    pub(crate) fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.stream
            .sock
            .set_read_timeout(Some(timeout))
            .map_err(transient)
    }

    fn command(&mut self, cmd: &str) -> Result<Vec<String>, TransportError> {
        self.tag += 1;
        let tag = format!("A{}", self.tag);
        self.write_raw(&format!("{tag} {cmd}\r\n"))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line().map_err(transient)?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn command_ok(&mut self, cmd: &str, what: &str) -> Result<Vec<String>, TransportError> {
        let lines = self.command(cmd)?;
        if lines.last().is_some_and(|l| l.contains("OK")) {
            Ok(lines)
        } else {
            Err(TransportError::Transient(format!(
                "{what} failed: {}",
                lines.last().map(String::as_str).unwrap_or("").trim_end()
            )))
        }
    }

    fn write_raw(&mut self, data: &str) -> Result<(), TransportError> {
        IoWrite::write_all(&mut self.stream, data.as_bytes()).map_err(transient)?;
        IoWrite::flush(&mut self.stream).map_err(transient)
    }

    fn read_line(&mut self) -> std::io::Result<String> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.stream, &mut byte) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "IMAP connection closed",
                    ));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
