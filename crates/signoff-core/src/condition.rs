//! Boolean rule-tree evaluation against a JSON assignment context.
//!
//! The evaluator is a pure function: no I/O, deterministic, and total.
//! A missing or mistyped context field makes the comparison a non-match,
//! never an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical combinator for a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupOperator {
    And,
    Or,
}

/// Comparison operator for a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "exists")]
    Exists,
}

/// Leaf comparison of a (dot-path) context field against a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub field: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Value,
}

/// A node in the condition tree: either a nested group or a leaf rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Rule(ConditionRule),
}

/// AND/OR tree of field comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: GroupOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn all(conditions: Vec<ConditionNode>) -> Self {
        Self {
            operator: GroupOperator::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<ConditionNode>) -> Self {
        Self {
            operator: GroupOperator::Or,
            conditions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// Evaluate a condition group against a JSON context.
///
/// An empty AND group is vacuously true and an empty OR group vacuously
/// false. Callers that treat an absent/empty group as "match
/// unconditionally" must special-case that before invoking.
pub fn evaluate(group: &ConditionGroup, context: &Value) -> bool {
    match group.operator {
        GroupOperator::And => group
            .conditions
            .iter()
            .all(|node| evaluate_node(node, context)),
        GroupOperator::Or => group
            .conditions
            .iter()
            .any(|node| evaluate_node(node, context)),
    }
}

fn evaluate_node(node: &ConditionNode, context: &Value) -> bool {
    match node {
        ConditionNode::Group(group) => evaluate(group, context),
        ConditionNode::Rule(rule) => evaluate_rule(rule, context),
    }
}

fn evaluate_rule(rule: &ConditionRule, context: &Value) -> bool {
    let field = lookup_path(context, &rule.field);

    match rule.op {
        CompareOp::Exists => field.is_some(),
        CompareOp::Eq => field.map(|v| values_equal(v, &rule.value)).unwrap_or(false),
        CompareOp::Ne => field.map(|v| !values_equal(v, &rule.value)).unwrap_or(false),
        CompareOp::Gt => compare_numeric(field, &rule.value, |a, b| a > b),
        CompareOp::Gte => compare_numeric(field, &rule.value, |a, b| a >= b),
        CompareOp::Lt => compare_numeric(field, &rule.value, |a, b| a < b),
        CompareOp::Lte => compare_numeric(field, &rule.value, |a, b| a <= b),
        CompareOp::In => field
            .and_then(|v| rule.value.as_array().map(|list| (v, list)))
            .map(|(v, list)| list.iter().any(|item| values_equal(v, item)))
            .unwrap_or(false),
        CompareOp::NotIn => field
            .and_then(|v| rule.value.as_array().map(|list| (v, list)))
            .map(|(v, list)| !list.iter().any(|item| values_equal(v, item)))
            .unwrap_or(false),
        CompareOp::Contains => field.map(|v| contains(v, &rule.value)).unwrap_or(false),
    }
}

/// Resolve a dot-path (`request.amount`) inside a JSON object tree.
fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Equality with numeric normalization so `2` and `2.0` compare equal.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare_numeric(field: Option<&Value>, literal: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (field.and_then(Value::as_f64), literal.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Array-element or substring containment.
fn contains(field: &Value, literal: &Value) -> bool {
    match field {
        Value::Array(items) => items.iter().any(|item| values_equal(item, literal)),
        Value::String(text) => literal
            .as_str()
            .map(|needle| text.contains(needle))
            .unwrap_or(false),
        _ => false,
    }
}
