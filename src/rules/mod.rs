//! Rule data model — conditions and actions.
//!
//! Rules are owned by the external API; the engine only reads them. The
//! legacy flat shape (from/subject/body substrings plus a single response)
//! is expressed through the same structure via [`Rule::flat`].

pub mod matcher;

use serde::{Deserialize, Serialize};

/// Message field a condition matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    From,
    To,
    Subject,
    Body,
}

/// Comparison operator. All operators compare case-insensitively;
/// `Matches` is a case-insensitive regular-expression search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    Matches,
}

/// A single match condition. A rule matches iff all of its conditions do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: String,
}

/// A side-effecting action to run when a rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Auto-reply to the sender with a static template.
    Reply { template: String },
    /// Forward the message to a fixed recipient.
    Forward { to: String },
    /// Remove the message from the inbox.
    Archive,
    /// Attach a named label, creating it on the mailbox if absent.
    Label { name: String },
}

impl Action {
    /// Short identifier for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Reply { .. } => "reply",
            Action::Forward { .. } => "forward",
            Action::Archive => "archive",
            Action::Label { .. } => "label",
        }
    }
}

/// A user-defined rule: ordered conditions plus a list of actions.
///
/// Priority is evaluated descending; ties keep creation order. A rule
/// with zero conditions matches every message (vacuous match, by design).
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub is_active: bool,
    pub priority: i64,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
}

impl Rule {
    /// Build a rule from the legacy flat shape: optional from/subject/body
    /// substring filters plus a single reply template.
    pub fn flat(
        id: &str,
        user_id: &str,
        name: &str,
        priority: i64,
        from: Option<&str>,
        subject: Option<&str>,
        body: Option<&str>,
        response: &str,
    ) -> Self {
        let mut conditions = Vec::new();
        let filters = [
            (ConditionField::From, from),
            (ConditionField::Subject, subject),
            (ConditionField::Body, body),
        ];
        for (field, value) in filters {
            if let Some(value) = value
                && !value.is_empty()
            {
                conditions.push(Condition {
                    field,
                    operator: ConditionOperator::Contains,
                    value: value.to_string(),
                });
            }
        }

        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            is_active: true,
            priority,
            conditions,
            actions: vec![Action::Reply {
                template: response.to_string(),
            }],
        }
    }
}
