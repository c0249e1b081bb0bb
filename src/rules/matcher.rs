//! Rule matching — priority-ordered AND evaluation.
//!
//! Rules are evaluated in descending priority order with ties keeping the
//! original order. A rule matches iff every condition matches. A condition
//! referencing an empty or absent message field never matches, whatever the
//! operator.

use regex::RegexBuilder;
use tracing::warn;

use crate::message::InboundMessage;
use crate::rules::{Condition, ConditionField, ConditionOperator, Rule};

/// Rule execution mode, fixed per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// Stop at the highest-priority matching rule.
    #[default]
    FirstMatch,
    /// Return every matching rule; each triggers its actions independently.
    AllMatches,
}

impl std::str::FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" | "first_match" => Ok(MatchMode::FirstMatch),
            "all" | "all_matches" => Ok(MatchMode::AllMatches),
            other => Err(format!("unknown match mode: {other}")),
        }
    }
}

/// Evaluate a message against an ordered rule list.
///
/// Inactive rules are skipped. Returns matching rules in evaluation order;
/// under [`MatchMode::FirstMatch`] at most one.
pub fn match_rules<'a>(
    message: &InboundMessage,
    rules: &'a [Rule],
    mode: MatchMode,
) -> Vec<&'a Rule> {
    let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.is_active).collect();
    // sort_by is stable: equal priorities keep their original order.
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut matched = Vec::new();
    for rule in ordered {
        if rule_matches(message, rule) {
            matched.push(rule);
            if mode == MatchMode::FirstMatch {
                break;
            }
        }
    }
    matched
}

/// True iff every condition of the rule matches (vacuously true for an
/// empty condition list).
pub fn rule_matches(message: &InboundMessage, rule: &Rule) -> bool {
    rule.conditions
        .iter()
        .all(|condition| condition_matches(message, condition))
}

fn condition_matches(message: &InboundMessage, condition: &Condition) -> bool {
    let value = match field_value(message, condition.field) {
        Some(v) if !v.is_empty() => v,
        _ => return false,
    };

    match condition.operator {
        ConditionOperator::Contains => value
            .to_lowercase()
            .contains(&condition.value.to_lowercase()),
        ConditionOperator::Equals => value.eq_ignore_ascii_case(&condition.value),
        ConditionOperator::StartsWith => value
            .to_lowercase()
            .starts_with(&condition.value.to_lowercase()),
        ConditionOperator::EndsWith => value
            .to_lowercase()
            .ends_with(&condition.value.to_lowercase()),
        ConditionOperator::Matches => {
            match RegexBuilder::new(&condition.value)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => re.is_match(value),
                Err(e) => {
                    // A user's broken pattern must not abort the scan.
                    warn!(pattern = %condition.value, error = %e, "Invalid rule regex");
                    false
                }
            }
        }
    }
}

fn field_value(message: &InboundMessage, field: ConditionField) -> Option<&str> {
    match field {
        ConditionField::From => Some(&message.from),
        ConditionField::To => Some(&message.to),
        ConditionField::Subject => message.subject.as_deref(),
        ConditionField::Body => Some(&message.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Action;

    fn rule(id: &str, priority: i64, conditions: Vec<Condition>) -> Rule {
        Rule {
            id: id.to_string(),
            user_id: "u1".to_string(),
            name: id.to_string(),
            is_active: true,
            priority,
            conditions,
            actions: vec![Action::Archive],
        }
    }

    fn condition(field: ConditionField, operator: ConditionOperator, value: &str) -> Condition {
        Condition {
            field,
            operator,
            value: value.to_string(),
        }
    }

    fn message() -> InboundMessage {
        InboundMessage::fixture(
            "m1",
            "alice@example.com",
            "Your invoice for 2024",
            "Please find the invoice attached.",
        )
    }

    #[test]
    fn empty_condition_list_matches_everything() {
        let rules = vec![rule("catch-all", 0, vec![])];
        let matched = match_rules(&message(), &rules, MatchMode::FirstMatch);
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn all_conditions_must_match() {
        let rules = vec![rule(
            "r1",
            0,
            vec![
                condition(ConditionField::From, ConditionOperator::Contains, "alice"),
                condition(ConditionField::Subject, ConditionOperator::Contains, "nope"),
            ],
        )];
        assert!(match_rules(&message(), &rules, MatchMode::AllMatches).is_empty());
    }

    #[test]
    fn comparison_is_case_insensitive() {
        let rules = vec![rule(
            "r1",
            0,
            vec![
                condition(ConditionField::From, ConditionOperator::Equals, "ALICE@Example.COM"),
                condition(ConditionField::Subject, ConditionOperator::StartsWith, "your INVOICE"),
                condition(ConditionField::Subject, ConditionOperator::EndsWith, "2024"),
            ],
        )];
        assert_eq!(match_rules(&message(), &rules, MatchMode::FirstMatch).len(), 1);
    }

    #[test]
    fn regex_operator_searches_case_insensitively() {
        let cond = vec![condition(
            ConditionField::Subject,
            ConditionOperator::Matches,
            "invoice.*2024",
        )];
        let rules = vec![rule("r1", 0, cond.clone())];
        assert_eq!(match_rules(&message(), &rules, MatchMode::FirstMatch).len(), 1);

        let mut other = message();
        other.subject = Some("Random subject".to_string());
        assert!(match_rules(&other, &rules, MatchMode::FirstMatch).is_empty());
    }

    #[test]
    fn invalid_regex_never_matches() {
        let rules = vec![rule(
            "r1",
            0,
            vec![condition(
                ConditionField::Subject,
                ConditionOperator::Matches,
                "invoice[",
            )],
        )];
        assert!(match_rules(&message(), &rules, MatchMode::AllMatches).is_empty());
    }

    #[test]
    fn absent_field_never_matches() {
        let mut msg = message();
        msg.subject = None;
        msg.body = String::new();

        for operator in [
            ConditionOperator::Contains,
            ConditionOperator::Equals,
            ConditionOperator::StartsWith,
            ConditionOperator::EndsWith,
            ConditionOperator::Matches,
        ] {
            let rules = vec![
                rule("subj", 0, vec![condition(ConditionField::Subject, operator, ".*")]),
                rule("body", 0, vec![condition(ConditionField::Body, operator, ".*")]),
            ];
            assert!(
                match_rules(&msg, &rules, MatchMode::AllMatches).is_empty(),
                "operator {operator:?} matched an absent field"
            );
        }
    }

    #[test]
    fn evaluation_order_is_priority_descending() {
        let rules = vec![
            rule("low", 1, vec![]),
            rule("high", 10, vec![]),
            rule("mid", 5, vec![]),
        ];
        let matched = match_rules(&message(), &rules, MatchMode::AllMatches);
        let ids: Vec<&str> = matched.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn priority_ties_keep_insertion_order() {
        let rules = vec![
            rule("first", 5, vec![]),
            rule("second", 5, vec![]),
            rule("third", 5, vec![]),
        ];
        let matched = match_rules(&message(), &rules, MatchMode::AllMatches);
        let ids: Vec<&str> = matched.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn priorities_change_order_not_and_semantics() {
        let conditions = vec![
            condition(ConditionField::From, ConditionOperator::Contains, "alice"),
            condition(ConditionField::Subject, ConditionOperator::Contains, "invoice"),
        ];
        let mut rules = vec![rule("a", 1, conditions.clone()), rule("b", 2, vec![])];
        let before: Vec<String> = match_rules(&message(), &rules, MatchMode::AllMatches)
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(before, vec!["b", "a"]);

        rules[0].priority = 3;
        let after: Vec<String> = match_rules(&message(), &rules, MatchMode::AllMatches)
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(after, vec!["a", "b"]);
    }

    #[test]
    fn first_match_mode_stops_at_highest_priority() {
        let rules = vec![rule("low", 1, vec![]), rule("high", 10, vec![])];
        let matched = match_rules(&message(), &rules, MatchMode::FirstMatch);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "high");
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let mut inactive = rule("off", 100, vec![]);
        inactive.is_active = false;
        let rules = vec![inactive, rule("on", 1, vec![])];
        let matched = match_rules(&message(), &rules, MatchMode::FirstMatch);
        assert_eq!(matched[0].id, "on");
    }

    #[test]
    fn match_mode_parses_from_str() {
        assert_eq!("first".parse::<MatchMode>().unwrap(), MatchMode::FirstMatch);
        assert_eq!("all_matches".parse::<MatchMode>().unwrap(), MatchMode::AllMatches);
        assert!("sometimes".parse::<MatchMode>().is_err());
    }
}
