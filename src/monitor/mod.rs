//! Monitor supervisor — per-user lifecycle and scheduling.
//!
//! Owns the table of per-user monitor state (at most one active monitor
//! per user), constructed once at process start and torn down at shutdown.
//! Exposes the engine surface consumed by the API layer: `start`, `stop`,
//! `status`.

pub(crate) mod scan;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{ActionExecutor, Mailer};
use crate::config::EngineConfig;
use crate::error::{MonitorError, Result};
use crate::source::{self, SourceFactory, idle};
use crate::store::traits::{CredentialStore, EmailLog, LogStore, RuleStore};

/// Result of a `status()` query.
#[derive(Debug)]
pub struct MonitorStatus {
    pub is_active: bool,
    pub recent_logs: Vec<EmailLog>,
}

/// Shared collaborators for the supervisor.
pub struct SupervisorDeps {
    pub credentials: Arc<dyn CredentialStore>,
    pub rules: Arc<dyn RuleStore>,
    pub logs: Arc<dyn LogStore>,
    pub engine: EngineConfig,
    /// Injectable for tests; defaults to strategy selection by config.
    pub source_factory: SourceFactory,
}

impl SupervisorDeps {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        rules: Arc<dyn RuleStore>,
        logs: Arc<dyn LogStore>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            credentials,
            rules,
            logs,
            engine,
            source_factory: source::default_factory(),
        }
    }
}

/// A running monitor's handles.
struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    scan_task: JoinHandle<()>,
    idle_task: Option<JoinHandle<()>>,
}

/// Per-user monitor lifecycle manager.
pub struct MonitorSupervisor {
    deps: SupervisorDeps,
    monitors: RwLock<HashMap<String, MonitorHandle>>,
}

impl MonitorSupervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        Self {
            deps,
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Start monitoring a user's mailbox.
    ///
    /// Fails with a conflict if a monitor is already running, with a config
    /// error on missing/partial credentials, and with a transport error when
    /// the adapter cannot connect — in every case the monitor stays Stopped.
    /// On success an immediate scan runs, followed by the fixed-interval
    /// schedule (plus an IDLE watcher when enabled).
    pub async fn start(&self, user_id: &str) -> Result<()> {
        if self.monitors.read().await.contains_key(user_id) {
            return Err(MonitorError::AlreadyRunning {
                user_id: user_id.to_string(),
            }
            .into());
        }

        let config = self
            .deps
            .credentials
            .mailbox_config(user_id)
            .await?
            .ok_or_else(|| MonitorError::NoCredentials {
                user_id: user_id.to_string(),
            })?;
        config.validate()?;

        let source = (self.deps.source_factory)(&config);
        let source_name = source.name();
        source.check().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());

        let idle_task = (config.access_token.is_none() && config.use_idle).then(|| {
            idle::spawn_idle_watcher(config.clone(), Arc::clone(&wake), shutdown_rx.clone())
        });

        let executor = ActionExecutor::new(Mailer::new(config.clone()), Arc::clone(&source));
        let ctx = scan::ScanContext {
            user_id: user_id.to_string(),
            source,
            rules: Arc::clone(&self.deps.rules),
            logs: Arc::clone(&self.deps.logs),
            executor,
            match_mode: self.deps.engine.match_mode,
            in_flight: AtomicBool::new(false),
        };
        let scan_task =
            scan::spawn_scan_loop(ctx, self.deps.engine.scan_interval, shutdown_rx, wake);

        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(user_id) {
            // Lost a concurrent start race; tear down what we just spawned.
            let _ = shutdown_tx.send(true);
            scan_task.abort();
            if let Some(task) = idle_task {
                task.abort();
            }
            return Err(MonitorError::AlreadyRunning {
                user_id: user_id.to_string(),
            }
            .into());
        }
        monitors.insert(
            user_id.to_string(),
            MonitorHandle {
                shutdown: shutdown_tx,
                scan_task,
                idle_task,
            },
        );

        info!(
            user_id,
            source = source_name,
            mode = ?self.deps.engine.match_mode,
            interval_secs = self.deps.engine.scan_interval.as_secs(),
            "Monitor started"
        );
        Ok(())
    }

    /// Stop a user's monitor. Cancels the pending timer, lets an in-flight
    /// scan drain, and drops the transport. Idempotent if already stopped.
    pub async fn stop(&self, user_id: &str) -> Result<()> {
        let handle = self.monitors.write().await.remove(user_id);
        let Some(handle) = handle else {
            debug!(user_id, "Monitor already stopped");
            return Ok(());
        };

        let _ = handle.shutdown.send(true);
        if let Some(idle) = handle.idle_task {
            idle.abort();
        }
        if let Err(e) = handle.scan_task.await
            && !e.is_cancelled()
        {
            warn!(user_id, error = %e, "Scan task ended abnormally");
        }

        info!(user_id, "Monitor stopped");
        Ok(())
    }

    /// Pure read: lifecycle state plus the most recent log entries.
    pub async fn status(&self, user_id: &str) -> Result<MonitorStatus> {
        let is_active = self.monitors.read().await.contains_key(user_id);
        let recent_logs = self
            .deps
            .logs
            .recent(user_id, self.deps.engine.recent_logs)
            .await?;
        Ok(MonitorStatus {
            is_active,
            recent_logs,
        })
    }

    /// Check if a user's monitor is running.
    pub async fn is_running(&self, user_id: &str) -> bool {
        self.monitors.read().await.contains_key(user_id)
    }

    /// Count of running monitors.
    pub async fn running_count(&self) -> usize {
        self.monitors.read().await.len()
    }

    /// Stop every monitor (process shutdown).
    pub async fn stop_all(&self) {
        let user_ids: Vec<String> = self.monitors.read().await.keys().cloned().collect();
        for user_id in user_ids {
            let _ = self.stop(&user_id).await;
        }
    }
}
