//! IMAP IDLE watcher — event-push new-mail notifications.
//!
//! Holds a persistent session in IDLE; when the server reports new mail it
//! wakes the monitor, which runs the same unseen scan as the polling path
//! (identical at-least-once semantics, lower latency). Reconnects with
//! exponential backoff on transport errors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::TransportError;
use crate::source::imap::ImapSession;

/// Re-issue the IDLE at least this often (servers may drop idle
/// connections after ~30 minutes, per RFC 2177).
const IDLE_REFRESH: Duration = Duration::from_secs(300);

const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Exponential backoff state for reconnects.
struct Backoff {
    value: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            value: BACKOFF_INITIAL,
        }
    }

    /// Obtain the current delay and precompute the next one.
    fn advance(&mut self) -> Duration {
        let current = self.value;
        self.value = current.saturating_mul(2).min(BACKOFF_MAX);
        current
    }

    fn reset(&mut self) {
        self.value = BACKOFF_INITIAL;
    }
}

/// Spawn the IDLE watcher task.
///
/// Each new-mail notification fires `wake`; the scan loop owns the actual
/// fetch, so the watcher and the timer share one in-flight guard.
pub fn spawn_idle_watcher(
    config: MailboxConfig,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(host = %config.imap_host, "IDLE watcher started");
        let mut backoff = Backoff::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let session_config = config.clone();
            let wait =
                tokio::task::spawn_blocking(move || idle_once(&session_config)).await;

            match wait {
                Ok(Ok(true)) => {
                    backoff.reset();
                    debug!("New-mail notification, waking scan loop");
                    wake.notify_one();
                }
                Ok(Ok(false)) => {
                    // Refresh window elapsed without news; re-idle.
                    backoff.reset();
                }
                Ok(Err(e)) => {
                    let delay = backoff.advance();
                    warn!(error = %e, delay_secs = delay.as_secs(), "IDLE session failed, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "IDLE task panicked");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.advance()) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        info!(host = %config.imap_host, "IDLE watcher stopped");
    })
}

/// One IDLE round: connect, idle until news or the refresh window, close.
fn idle_once(config: &MailboxConfig) -> Result<bool, TransportError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;
    session.select_inbox()?;
    session.set_read_timeout(IDLE_REFRESH)?;

    let new_mail = session.idle_wait()?;
    session.logout();
    Ok(new_mail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.advance(), Duration::from_secs(5));
        assert_eq!(backoff.advance(), Duration::from_secs(10));
        assert_eq!(backoff.advance(), Duration::from_secs(20));
        for _ in 0..10 {
            backoff.advance();
        }
        assert_eq!(backoff.advance(), BACKOFF_MAX);
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::new();
        backoff.advance();
        backoff.advance();
        backoff.reset();
        assert_eq!(backoff.advance(), BACKOFF_INITIAL);
    }
}
