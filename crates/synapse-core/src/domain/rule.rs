//! Behavioral rules: structured conditions, actions and their pure evaluation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::identifiers::{InstanceId, LearningEventId, ModeId, RuleId};
use super::knowledge::OwnerScope;

/// Predicate over a JSON evaluation context.
///
/// Paths are dot separated (`session.turn_count`, `items.0.name`). A missing
/// path or a type mismatch makes the predicate false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Eq { path: String, value: Value },
    /// False when the path is missing; use `Not(Eq)` for "absent or different"
    Ne { path: String, value: Value },
    /// Substring of a string, element of an array, or key of an object
    Contains { path: String, value: Value },
    Gt { path: String, value: f64 },
    Gte { path: String, value: f64 },
    Lt { path: String, value: f64 },
    Lte { path: String, value: f64 },
    Exists { path: String },
    In { path: String, values: Vec<Value> },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq { path: path.into(), value: value.into() }
    }

    pub fn gt(path: impl Into<String>, value: f64) -> Self {
        Condition::Gt { path: path.into(), value }
    }

    pub fn lt(path: impl Into<String>, value: f64) -> Self {
        Condition::Lt { path: path.into(), value }
    }

    pub fn contains(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Contains { path: path.into(), value: value.into() }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::And { conditions }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Or { conditions }
    }

    pub fn not(condition: Condition) -> Self {
        Condition::Not { condition: Box::new(condition) }
    }

    /// Evaluate against a context
    pub fn matches(&self, context: &Value) -> bool {
        match self {
            Condition::Always => true,
            Condition::Eq { path, value } => resolve(context, path).map_or(false, |v| json_eq(v, value)),
            Condition::Ne { path, value } => resolve(context, path).map_or(false, |v| !json_eq(v, value)),
            Condition::Contains { path, value } => resolve(context, path).map_or(false, |v| contains(v, value)),
            Condition::Gt { path, value } => compare(context, path, *value, |o| o == Ordering::Greater),
            Condition::Gte { path, value } => compare(context, path, *value, |o| o != Ordering::Less),
            Condition::Lt { path, value } => compare(context, path, *value, |o| o == Ordering::Less),
            Condition::Lte { path, value } => compare(context, path, *value, |o| o != Ordering::Greater),
            Condition::Exists { path } => resolve(context, path).map_or(false, |v| !v.is_null()),
            Condition::In { path, values } => {
                resolve(context, path).map_or(false, |v| values.iter().any(|c| json_eq(v, c)))
            }
            Condition::And { conditions } => conditions.iter().all(|c| c.matches(context)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.matches(context)),
            Condition::Not { condition } => !condition.matches(context),
        }
    }
}

fn resolve<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(context);
    }
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// Numbers compare by value so that 6 == 6.0
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().map_or(false, |n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| json_eq(item, needle)),
        Value::Object(map) => needle.as_str().map_or(false, |key| map.contains_key(key)),
        _ => false,
    }
}

fn compare(context: &Value, path: &str, rhs: f64, accept: impl Fn(Ordering) -> bool) -> bool {
    resolve(context, path)
        .and_then(Value::as_f64)
        .and_then(|lhs| lhs.partial_cmp(&rhs))
        .map_or(false, accept)
}

/// What a matched rule asks the caller to do. Never executed by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Add an instruction to the next prompt
    InjectInstruction { text: String },
    /// Invoke a tool with arguments
    InvokeTool {
        tool_id: String,
        #[serde(default)]
        arguments: Value,
    },
    /// Write a value into the session context
    SetContext { key: String, value: Value },
    /// Hand the conversation to a human or supervisor
    Escalate { reason: String },
    /// Application-defined action
    Custom {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Where a rule came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleOrigin {
    Authored,
    Learned { event_id: LearningEventId },
}

/// A prioritized condition/action pair scoped to a mode or an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub scope: OwnerScope,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub condition: Condition,
    pub action: RuleAction,
    /// Higher runs first
    pub priority: i32,
    /// Non-matches are reported rather than skipped
    pub mandatory: bool,
    pub active: bool,
    /// Mode rule hidden by this instance rule while it is active
    #[serde(default)]
    pub overrides: Option<RuleId>,
    pub origin: RuleOrigin,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Create an active, authored rule
    pub fn new(scope: OwnerScope, name: impl Into<String>, condition: Condition, action: RuleAction) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId::new_v4(),
            scope,
            name: name.into(),
            description: None,
            condition,
            action,
            priority: 0,
            mandatory: false,
            active: true,
            overrides: None,
            origin: RuleOrigin::Authored,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_mode(mode_id: ModeId, name: impl Into<String>, condition: Condition, action: RuleAction) -> Self {
        Self::new(OwnerScope::Mode(mode_id), name, condition, action)
    }

    pub fn for_instance(
        instance_id: InstanceId,
        name: impl Into<String>,
        condition: Condition,
        action: RuleAction,
    ) -> Self {
        Self::new(OwnerScope::Instance(instance_id), name, condition, action)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn overriding(mut self, rule_id: RuleId) -> Self {
        self.overrides = Some(rule_id);
        self
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_instance_rule(&self) -> bool {
        matches!(self.scope, OwnerScope::Instance(_))
    }

    /// Total evaluation order: priority desc, mandatory first, instance rules
    /// before mode rules, older first, then id
    pub fn evaluation_order(a: &Rule, b: &Rule) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.mandatory.cmp(&a.mandatory))
            .then_with(|| b.is_instance_rule().cmp(&a.is_instance_rule()))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Action produced by a matched rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedAction {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub priority: i32,
    pub mandatory: bool,
    pub action: RuleAction,
}

/// Mandatory rule whose condition did not hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmetMandatoryRule {
    pub rule_id: RuleId,
    pub rule_name: String,
    pub priority: i32,
}

/// Outcome of evaluating a rule set against a context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub actions: Vec<MatchedAction>,
    pub unmet_mandatory: Vec<UnmetMandatoryRule>,
}

/// Active rules visible to `scope`, in evaluation order.
///
/// For an instance scope this is the instance's rules plus the rules of its
/// mode (`mode_id`), minus mode rules overridden by an active instance rule.
pub fn visible_rules<'a>(rules: &'a [Rule], scope: OwnerScope, mode_id: Option<ModeId>) -> Vec<&'a Rule> {
    let visible_scope = |rule: &Rule| match (rule.scope, scope) {
        (OwnerScope::Instance(owner), OwnerScope::Instance(target)) => owner == target,
        (OwnerScope::Mode(owner), OwnerScope::Mode(target)) => owner == target,
        (OwnerScope::Mode(owner), OwnerScope::Instance(_)) => Some(owner) == mode_id,
        (OwnerScope::Instance(_), OwnerScope::Mode(_)) => false,
    };

    let mut visible: Vec<&Rule> = rules.iter().filter(|r| r.active && visible_scope(r)).collect();
    let overridden: Vec<RuleId> = visible
        .iter()
        .filter(|r| r.is_instance_rule())
        .filter_map(|r| r.overrides)
        .collect();
    visible.retain(|r| r.is_instance_rule() || !overridden.contains(&r.id));
    visible.sort_by(|a, b| Rule::evaluation_order(a, b));
    visible
}

/// Evaluate `rules` visible to `scope` against `context`.
///
/// The result depends only on the inputs; actions are returned, never run.
pub fn evaluate_rules(rules: &[Rule], scope: OwnerScope, mode_id: Option<ModeId>, context: &Value) -> RuleEvaluation {
    let visible = visible_rules(rules, scope, mode_id);

    let mut evaluation = RuleEvaluation::default();
    for rule in visible {
        if rule.condition.matches(context) {
            evaluation.actions.push(MatchedAction {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                priority: rule.priority,
                mandatory: rule.mandatory,
                action: rule.action.clone(),
            });
        } else if rule.mandatory {
            evaluation.unmet_mandatory.push(UnmetMandatoryRule {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                priority: rule.priority,
            });
        }
    }
    evaluation
}
