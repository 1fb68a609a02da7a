use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::{config::COIN_VALUE, time::TimestampSeconds};

use super::ApproverRole;

// Closed comparison set. Rule matching is a total function over the ticket's
// request_data: a missing field or a type mismatch simply fails the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    // Dotted path into request_data, e.g. "gross_amount" or "meta.channel"
    pub field: String,
    pub op: ConditionOp,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn evaluate(&self, data: &Value) -> bool {
        let Some(actual) = lookup(data, &self.field) else {
            return false;
        };
        compare(actual, self.op, &self.value)
    }
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

// Amounts travel as decimal strings, so numeric comparison coerces both sides.
// Non-numeric values only support Eq / Ne.
fn compare(actual: &Value, op: ConditionOp, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return match op {
            ConditionOp::Gt => a > b,
            ConditionOp::Lt => a < b,
            ConditionOp::Ge => a >= b,
            ConditionOp::Le => a <= b,
            ConditionOp::Eq => a == b,
            ConditionOp::Ne => a != b,
        };
    }

    match op {
        ConditionOp::Eq => actual == expected,
        ConditionOp::Ne => actual != expected,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(u as i128)
            } else {
                n.as_i64().map(|i| i as i128)
            }
        }
        Value::String(s) => s.parse::<i128>().ok(),
        _ => None,
    }
}

// Relative SLA durations, converted to absolute timestamps at ticket creation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SlaConfig {
    pub warning_secs: TimestampSeconds,
    pub deadline_secs: TimestampSeconds,
    pub escalation_secs: TimestampSeconds,
    // When true, the deadline job resolves the ticket as EXPIRED and runs the
    // rejection path of the result processor
    pub auto_reject: bool,
    pub escalate_to: Option<ApproverRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprove {
    pub enabled: bool,
    pub conditions: Vec<Condition>,
}

impl AutoApprove {
    pub fn applies(&self, data: &Value) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.evaluate(data))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub name: String,
    pub ticket_type: String,
    pub conditions: Vec<Condition>,
    pub approver_role: ApproverRole,
    pub total_required: u32,
    pub sla: SlaConfig,
    pub auto_approve: Option<AutoApprove>,
}

impl ApprovalRule {
    pub fn matches(&self, ticket_type: &str, data: &Value) -> bool {
        self.ticket_type == ticket_type && self.conditions.iter().all(|c| c.evaluate(data))
    }
}

// First-match wins, in table order
pub fn find_matching_rule<'a>(
    rules: &'a [ApprovalRule],
    ticket_type: &str,
    data: &Value,
) -> Option<&'a ApprovalRule> {
    rules.iter().find(|r| r.matches(ticket_type, data))
}

// Built-in rule table, overridable from the config file.
pub fn default_rules() -> Vec<ApprovalRule> {
    vec![
        // Redemptions at or above 100k units need a single VIP approver
        ApprovalRule {
            name: "large_redemption".to_string(),
            ticket_type: "redemption".to_string(),
            conditions: vec![Condition::new(
                "gross_amount",
                ConditionOp::Ge,
                Value::String((100_000 * COIN_VALUE).to_string()),
            )],
            approver_role: ApproverRole::VipApprover,
            total_required: 1,
            sla: SlaConfig {
                warning_secs: 2 * 3_600,
                deadline_secs: 24 * 3_600,
                escalation_secs: 12 * 3_600,
                auto_reject: false,
                escalate_to: Some(ApproverRole::FundManager),
            },
            auto_approve: None,
        },
        // Anything below the VIP bar that still carried the approval flag
        // on-chain is auto-approved off-chain
        ApprovalRule {
            name: "standard_redemption".to_string(),
            ticket_type: "redemption".to_string(),
            conditions: vec![],
            approver_role: ApproverRole::VipApprover,
            total_required: 1,
            sla: SlaConfig {
                warning_secs: 2 * 3_600,
                deadline_secs: 24 * 3_600,
                escalation_secs: 12 * 3_600,
                auto_reject: false,
                escalate_to: None,
            },
            auto_approve: Some(AutoApprove {
                enabled: true,
                conditions: vec![Condition::new(
                    "gross_amount",
                    ConditionOp::Lt,
                    Value::String((100_000 * COIN_VALUE).to_string()),
                )],
            }),
        },
        // Rebalance plans over the approval threshold need the fund manager
        ApprovalRule {
            name: "rebalance_plan".to_string(),
            ticket_type: "rebalance".to_string(),
            conditions: vec![],
            approver_role: ApproverRole::FundManager,
            total_required: 1,
            sla: SlaConfig {
                warning_secs: 3_600,
                deadline_secs: 12 * 3_600,
                escalation_secs: 6 * 3_600,
                auto_reject: true,
                escalate_to: Some(ApproverRole::Admin),
            },
            auto_approve: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison_coerces_strings() {
        let cond = Condition::new("gross_amount", ConditionOp::Ge, json!("100000"));
        assert!(cond.evaluate(&json!({"gross_amount": "150000"})));
        assert!(!cond.evaluate(&json!({"gross_amount": "99999"})));
        // numbers compare against string thresholds too
        assert!(cond.evaluate(&json!({"gross_amount": 100000u64})));
    }

    #[test]
    fn missing_field_fails_condition() {
        let cond = Condition::new("gross_amount", ConditionOp::Gt, json!(1));
        assert!(!cond.evaluate(&json!({"other": 5})));
    }

    #[test]
    fn string_equality() {
        let cond = Condition::new("channel", ConditionOp::Eq, json!("EMERGENCY"));
        assert!(cond.evaluate(&json!({"channel": "EMERGENCY"})));
        assert!(!cond.evaluate(&json!({"channel": "STANDARD"})));
        // ordering has no meaning for strings
        let bad = Condition::new("channel", ConditionOp::Gt, json!("EMERGENCY"));
        assert!(!bad.evaluate(&json!({"channel": "STANDARD"})));
    }

    #[test]
    fn dotted_path_lookup() {
        let cond = Condition::new("meta.window", ConditionOp::Eq, json!(3));
        assert!(cond.evaluate(&json!({"meta": {"window": 3}})));
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = default_rules();
        let large = json!({"gross_amount": (150_000 * COIN_VALUE).to_string()});
        let rule = find_matching_rule(&rules, "redemption", &large).unwrap();
        assert_eq!(rule.name, "large_redemption");

        let small = json!({"gross_amount": (5_000 * COIN_VALUE).to_string()});
        let rule = find_matching_rule(&rules, "redemption", &small).unwrap();
        assert_eq!(rule.name, "standard_redemption");
        assert!(rule.auto_approve.as_ref().unwrap().applies(&small));
    }

    #[test]
    fn no_rule_for_unknown_type() {
        let rules = default_rules();
        assert!(find_matching_rule(&rules, "unknown", &json!({})).is_none());
    }
}
