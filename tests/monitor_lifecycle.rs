//! End-to-end supervisor tests: lifecycle, scheduling, dedup, and error
//! containment, driven through a mock transport and the in-memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::Mutex;

use mailflow::config::{EngineConfig, MailboxConfig};
use mailflow::error::{DatabaseError, Error, MonitorError, TransportError};
use mailflow::message::InboundMessage;
use mailflow::monitor::{MonitorSupervisor, SupervisorDeps};
use mailflow::rules::matcher::MatchMode;
use mailflow::rules::{Action, Rule};
use mailflow::source::{Fetched, MessageSource};
use mailflow::store::{
    CredentialStore, EmailLog, LibSqlBackend, LogStatus, LogStore, RuleStore,
};

// ── Test doubles ────────────────────────────────────────────────────

struct MockSource {
    messages: Mutex<Vec<InboundMessage>>,
    check_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    fail_fetch: AtomicBool,
    labels: Mutex<Vec<String>>,
    archived: Mutex<Vec<String>>,
}

impl MockSource {
    fn new(messages: Vec<InboundMessage>) -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(messages),
            check_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fail_fetch: AtomicBool::new(false),
            labels: Mutex::new(Vec::new()),
            archived: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn check(&self) -> Result<(), TransportError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_unseen(&self) -> Result<Vec<Fetched>, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(TransportError::Transient("connection reset".into()));
        }
        // Redelivery semantics: every fetch returns the full unseen set.
        let messages = self.messages.lock().await;
        Ok(messages.iter().cloned().map(Fetched::Parsed).collect())
    }

    async fn archive(&self, message: &InboundMessage) -> Result<(), TransportError> {
        self.archived.lock().await.push(message.message_id.clone());
        Ok(())
    }

    async fn add_label(
        &self,
        _message: &InboundMessage,
        name: &str,
    ) -> Result<(), TransportError> {
        self.labels.lock().await.push(name.to_string());
        Ok(())
    }
}

struct MockCredentials {
    config: Option<MailboxConfig>,
}

#[async_trait]
impl CredentialStore for MockCredentials {
    async fn mailbox_config(
        &self,
        _user_id: &str,
    ) -> Result<Option<MailboxConfig>, DatabaseError> {
        Ok(self.config.clone())
    }
}

struct MockRules {
    rules: Vec<Rule>,
}

#[async_trait]
impl RuleStore for MockRules {
    async fn active_rules(&self, _user_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        Ok(self.rules.clone())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn mailbox_config() -> MailboxConfig {
    MailboxConfig {
        imap_host: "imap.test.com".into(),
        imap_port: 993,
        imap_user: "alice".into(),
        imap_password: SecretString::from("secret"),
        smtp_host: "smtp.test.com".into(),
        smtp_port: 587,
        smtp_user: "alice".into(),
        smtp_password: SecretString::from("secret"),
        from_name: "Alice".into(),
        from_email: "alice@test.com".into(),
        access_token: None,
        use_idle: false,
    }
}

fn inbound(message_id: &str) -> InboundMessage {
    InboundMessage {
        message_id: message_id.to_string(),
        source_ref: message_id.to_string(),
        from: "bob@example.com".to_string(),
        to: "alice@test.com".to_string(),
        subject: Some("Hello".to_string()),
        body: "Hi Alice".to_string(),
        received_at: Utc::now(),
    }
}

fn rule(id: &str, priority: i64, actions: Vec<Action>) -> Rule {
    Rule {
        id: id.to_string(),
        user_id: "u1".to_string(),
        name: id.to_string(),
        is_active: true,
        priority,
        conditions: Vec::new(),
        actions,
    }
}

async fn setup(
    rules: Vec<Rule>,
    source: Arc<MockSource>,
    match_mode: MatchMode,
) -> (MonitorSupervisor, Arc<LibSqlBackend>) {
    let logs = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let engine = EngineConfig {
        scan_interval: Duration::from_millis(100),
        match_mode,
        recent_logs: 20,
    };
    let mut deps = SupervisorDeps::new(
        Arc::new(MockCredentials {
            config: Some(mailbox_config()),
        }),
        Arc::new(MockRules { rules }),
        Arc::clone(&logs) as Arc<dyn LogStore>,
        engine,
    );
    deps.source_factory = Arc::new(move |_config: &MailboxConfig| Arc::clone(&source) as Arc<dyn MessageSource>);
    (MonitorSupervisor::new(deps), logs)
}

/// Poll until the source has run at least `n` fetches.
async fn wait_for_fetches(source: &MockSource, n: usize) {
    for _ in 0..100 {
        if source.fetch_calls.load(Ordering::SeqCst) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("source did not reach {n} fetches within 2s");
}

/// Poll until the log entry for a message satisfies `pred`.
async fn wait_for_log(
    logs: &LibSqlBackend,
    message_id: &str,
    pred: fn(&EmailLog) -> bool,
) -> EmailLog {
    for _ in 0..100 {
        if let Some(log) = logs.get_by_message_id("u1", message_id).await.unwrap()
            && pred(&log)
        {
            return log;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("log entry for {message_id} did not reach expected state within 2s");
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn double_start_conflicts_without_second_session() {
    let source = MockSource::new(vec![]);
    let (supervisor, _logs) = setup(vec![], Arc::clone(&source), MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();
    let err = supervisor.start("u1").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Monitor(MonitorError::AlreadyRunning { .. })
    ));
    assert_eq!(source.check_calls.load(Ordering::SeqCst), 1);

    supervisor.stop("u1").await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_status_reflects_state() {
    let source = MockSource::new(vec![]);
    let (supervisor, _logs) = setup(vec![], source, MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();
    assert!(supervisor.status("u1").await.unwrap().is_active);

    supervisor.stop("u1").await.unwrap();
    let status = supervisor.status("u1").await.unwrap();
    assert!(!status.is_active);

    // Stopping again is a no-op
    supervisor.stop("u1").await.unwrap();
}

#[tokio::test]
async fn independent_users_run_independently() {
    let source = MockSource::new(vec![]);
    let (supervisor, _logs) = setup(vec![], source, MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();
    supervisor.start("u2").await.unwrap();
    assert_eq!(supervisor.running_count().await, 2);

    supervisor.stop("u1").await.unwrap();
    assert!(!supervisor.is_running("u1").await);
    assert!(supervisor.is_running("u2").await);

    supervisor.stop_all().await;
    assert_eq!(supervisor.running_count().await, 0);
}

#[tokio::test]
async fn missing_credentials_fail_start() {
    let logs = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let deps = SupervisorDeps::new(
        Arc::new(MockCredentials { config: None }),
        Arc::new(MockRules { rules: vec![] }),
        logs,
        EngineConfig::default(),
    );
    let supervisor = MonitorSupervisor::new(deps);

    let err = supervisor.start("u1").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Monitor(MonitorError::NoCredentials { .. })
    ));
    assert!(!supervisor.is_running("u1").await);
}

#[tokio::test]
async fn partial_credentials_fail_start() {
    let mut config = mailbox_config();
    config.imap_password = SecretString::from("");
    let source = MockSource::new(vec![]);

    let logs = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let mut deps = SupervisorDeps::new(
        Arc::new(MockCredentials {
            config: Some(config),
        }),
        Arc::new(MockRules { rules: vec![] }),
        logs,
        EngineConfig::default(),
    );
    deps.source_factory = Arc::new(move |_config: &MailboxConfig| Arc::clone(&source) as Arc<dyn MessageSource>);
    let supervisor = MonitorSupervisor::new(deps);

    assert!(matches!(
        supervisor.start("u1").await.unwrap_err(),
        Error::Config(_)
    ));
    assert!(!supervisor.is_running("u1").await);
}

// ── Processing ──────────────────────────────────────────────────────

#[tokio::test]
async fn matched_message_is_processed_once() {
    let source = MockSource::new(vec![inbound("<m1@x>")]);
    let rules = vec![rule("r1", 5, vec![Action::Archive])];
    let (supervisor, logs) = setup(rules, Arc::clone(&source), MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();

    // Let the message redeliver across several scans
    wait_for_fetches(&source, 3).await;
    supervisor.stop("u1").await.unwrap();

    // The action ran exactly once despite redelivery on every scan
    assert_eq!(source.archived.lock().await.len(), 1);

    let log = logs
        .get_by_message_id("u1", "<m1@x>")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status, LogStatus::Processed);
    assert_eq!(log.rule_id.as_deref(), Some("r1"));
    assert_eq!(log.from_email, "bob@example.com");
}

#[tokio::test]
async fn unmatched_message_gets_no_rule_match() {
    let source = MockSource::new(vec![inbound("<m2@x>")]);
    let (supervisor, logs) = setup(vec![], source, MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();
    let log = wait_for_log(&logs, "<m2@x>", |l| l.status == LogStatus::NoRuleMatch).await;
    assert!(log.rule_id.is_none());
    supervisor.stop("u1").await.unwrap();
}

#[tokio::test]
async fn first_match_mode_runs_only_highest_priority_rule() {
    let source = MockSource::new(vec![inbound("<m3@x>")]);
    let rules = vec![
        rule("low", 1, vec![Action::Label { name: "low".into() }]),
        rule("high", 9, vec![Action::Label { name: "high".into() }]),
    ];
    let (supervisor, _logs) = setup(rules, Arc::clone(&source), MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();
    wait_for_fetches(&source, 2).await;
    supervisor.stop("u1").await.unwrap();

    assert_eq!(*source.labels.lock().await, vec!["high".to_string()]);
}

#[tokio::test]
async fn all_matches_mode_runs_every_matching_rule() {
    let source = MockSource::new(vec![inbound("<m4@x>")]);
    let rules = vec![
        rule("low", 1, vec![Action::Label { name: "low".into() }]),
        rule("high", 9, vec![Action::Label { name: "high".into() }]),
    ];
    let (supervisor, logs) = setup(rules, Arc::clone(&source), MatchMode::AllMatches).await;

    supervisor.start("u1").await.unwrap();
    wait_for_fetches(&source, 2).await;
    supervisor.stop("u1").await.unwrap();

    // Both rules fired, in priority order, each exactly once
    assert_eq!(
        *source.labels.lock().await,
        vec!["high".to_string(), "low".to_string()]
    );

    // The applied-rule reference is the highest-priority match
    let log = logs
        .get_by_message_id("u1", "<m4@x>")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.rule_id.as_deref(), Some("high"));
}

// ── Error containment ───────────────────────────────────────────────

#[tokio::test]
async fn transient_fetch_error_keeps_monitor_running() {
    let source = MockSource::new(vec![inbound("<m5@x>")]);
    source.fail_fetch.store(true, Ordering::SeqCst);
    let (supervisor, logs) = setup(vec![], Arc::clone(&source), MatchMode::FirstMatch).await;

    supervisor.start("u1").await.unwrap();
    wait_for_fetches(&source, 2).await;

    // Still running, and no log entry exists for the unfetched message
    assert!(supervisor.is_running("u1").await);
    assert!(logs
        .get_by_message_id("u1", "<m5@x>")
        .await
        .unwrap()
        .is_none());

    // The failure itself is visible in recent logs as a system error
    let recent = supervisor.status("u1").await.unwrap().recent_logs;
    assert!(!recent.is_empty());
    assert!(recent.iter().all(|l| l.from_email == "system"));

    // Recovery on a later tick once the transport is back
    source.fail_fetch.store(false, Ordering::SeqCst);
    wait_for_log(&logs, "<m5@x>", |l| l.status == LogStatus::NoRuleMatch).await;

    supervisor.stop("u1").await.unwrap();
}
