//! Action executor — side effects for matched rules.
//!
//! One call per (matched rule, action) pair, in declared order, sequential
//! within a rule. A failing action is logged and does not block the
//! remaining actions or rules for the same message.

pub mod smtp;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, TransportError};
use crate::message::InboundMessage;
use crate::rules::{Action, Rule};
use crate::source::MessageSource;

pub use smtp::Mailer;

/// Executes reply/forward through SMTP and archive/label through the same
/// mailbox transport as the source adapter.
pub struct ActionExecutor {
    mailer: Mailer,
    source: Arc<dyn MessageSource>,
}

impl ActionExecutor {
    pub fn new(mailer: Mailer, source: Arc<dyn MessageSource>) -> Self {
        Self { mailer, source }
    }

    /// Run every action of a matched rule in declared order.
    /// Returns the number of failed actions.
    pub async fn execute_rule(&self, rule: &Rule, message: &InboundMessage) -> usize {
        let mut failures = 0;
        for action in &rule.actions {
            match self.execute(action, message).await {
                Ok(()) => {
                    debug!(
                        rule = %rule.name,
                        action = action.kind(),
                        message_id = %message.message_id,
                        "Action executed"
                    );
                }
                Err(e) => {
                    warn!(
                        rule = %rule.name,
                        action = action.kind(),
                        message_id = %message.message_id,
                        error = %e,
                        "Action failed"
                    );
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Run a single action.
    pub async fn execute(
        &self,
        action: &Action,
        message: &InboundMessage,
    ) -> Result<(), Error> {
        match action {
            Action::Reply { template } => {
                let mailer = self.mailer.clone();
                let message = message.clone();
                let template = template.clone();
                run_send(move || mailer.send_reply(&message, &template)).await
            }
            Action::Forward { to } => {
                let mailer = self.mailer.clone();
                let message = message.clone();
                let to = to.clone();
                run_send(move || mailer.send_forward(&message, &to)).await
            }
            Action::Archive => Ok(self.source.archive(message).await?),
            Action::Label { name } => Ok(self.source.add_label(message, name).await?),
        }
    }
}

/// Run a blocking SMTP send off the async runtime.
async fn run_send<F>(f: F) -> Result<(), Error>
where
    F: FnOnce() -> Result<(), crate::error::ActionError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            Error::Transport(TransportError::Transient(format!(
                "send task failed: {e}"
            )))
        })?
        .map_err(Error::Action)
}
