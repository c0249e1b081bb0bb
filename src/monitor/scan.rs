//! Scan loop — fetch unseen messages and process them through the rules.
//!
//! One task per monitor. The interval tick and the IDLE wake arrive in the
//! same `select!`, and an in-flight guard skips (never queues) a scan that
//! would overlap another for the same user.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::ActionExecutor;
use crate::error::Error;
use crate::message::InboundMessage;
use crate::rules::Rule;
use crate::rules::matcher::{MatchMode, match_rules};
use crate::source::{Fetched, MessageSource};
use crate::store::traits::{ClaimOutcome, LogStatus, LogStore, RuleStore};

/// Everything one monitor's scan loop needs.
pub(crate) struct ScanContext {
    pub user_id: String,
    pub source: Arc<dyn MessageSource>,
    pub rules: Arc<dyn RuleStore>,
    pub logs: Arc<dyn LogStore>,
    pub executor: ActionExecutor,
    pub match_mode: MatchMode,
    pub in_flight: AtomicBool,
}

/// Spawn the recurring scan task. The first tick fires immediately.
pub(crate) fn spawn_scan_loop(
    ctx: ScanContext,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = wake.notified() => {
                    debug!(user_id = %ctx.user_id, "Scan triggered by notification");
                }
                _ = shutdown.changed() => {
                    info!(user_id = %ctx.user_id, "Scan loop shutting down");
                    return;
                }
            }

            if *shutdown.borrow() {
                info!(user_id = %ctx.user_id, "Scan loop shutting down");
                return;
            }

            run_scan(&ctx).await;
        }
    })
}

/// Run one guarded scan. Failures are logged; the monitor stays Running and
/// retries on the next tick.
pub(crate) async fn run_scan(ctx: &ScanContext) {
    if ctx.in_flight.swap(true, Ordering::SeqCst) {
        debug!(user_id = %ctx.user_id, "Scan already in flight, skipping");
        return;
    }

    let result = scan_once(ctx).await;
    ctx.in_flight.store(false, Ordering::SeqCst);

    if let Err(e) = result {
        error!(user_id = %ctx.user_id, error = %e, "Scan failed");
        if let Err(log_err) = ctx
            .logs
            .record_system_error(&ctx.user_id, &e.to_string())
            .await
        {
            warn!(user_id = %ctx.user_id, error = %log_err, "Failed to record scan error");
        }
    }
}

async fn scan_once(ctx: &ScanContext) -> Result<(), Error> {
    let fetched = ctx.source.fetch_unseen().await?;
    if fetched.is_empty() {
        return Ok(());
    }
    debug!(user_id = %ctx.user_id, count = fetched.len(), "Fetched unseen messages");

    let rules = ctx.rules.active_rules(&ctx.user_id).await?;

    for item in fetched {
        match item {
            Fetched::Parsed(message) => process_message(ctx, &rules, message).await,
            Fetched::Unparsed { source_ref, error } => {
                warn!(user_id = %ctx.user_id, source_ref = %source_ref, error = %error, "Undecodable message skipped");
                if let Err(e) = ctx
                    .logs
                    .record_system_error(
                        &ctx.user_id,
                        &format!("undecodable message {source_ref}: {error}"),
                    )
                    .await
                {
                    warn!(user_id = %ctx.user_id, error = %e, "Failed to record parse error");
                }
            }
        }
    }

    Ok(())
}

/// Process one message: claim its id, match rules, execute actions, and
/// finish the log entry. Never propagates — a failing message must not
/// abort the rest of the scan.
async fn process_message(ctx: &ScanContext, rules: &[Rule], message: InboundMessage) {
    let claim = match ctx.logs.claim(&ctx.user_id, &message).await {
        Ok(claim) => claim,
        Err(e) => {
            error!(user_id = %ctx.user_id, message_id = %message.message_id, error = %e, "Failed to claim message");
            return;
        }
    };

    let log_id = match claim {
        ClaimOutcome::AlreadyProcessed => {
            debug!(user_id = %ctx.user_id, message_id = %message.message_id, "Already processed, skipping");
            return;
        }
        ClaimOutcome::Claimed { log_id } => log_id,
        ClaimOutcome::Reclaimed { log_id } => {
            debug!(user_id = %ctx.user_id, message_id = %message.message_id, "Retrying previously failed message");
            log_id
        }
    };

    let matched = match_rules(&message, rules, ctx.match_mode);

    let (status, error, rule_id) = if matched.is_empty() {
        debug!(user_id = %ctx.user_id, message_id = %message.message_id, "No rule matched");
        (LogStatus::NoRuleMatch, None, None)
    } else {
        let mut failures = 0;
        for rule in &matched {
            failures += ctx.executor.execute_rule(rule, &message).await;
        }
        let rule_id = Some(matched[0].id.clone());
        if failures == 0 {
            (LogStatus::Processed, None, rule_id)
        } else {
            (
                LogStatus::Error,
                Some(format!("{failures} action(s) failed")),
                rule_id,
            )
        }
    };

    if let Err(e) = ctx
        .logs
        .complete(&log_id, status, error.as_deref(), rule_id.as_deref())
        .await
    {
        error!(user_id = %ctx.user_id, message_id = %message.message_id, error = %e, "Failed to finish log entry");
    }
}
