//! Approval template definitions: stages, routing rules, validation, and
//! deterministic compilation.
//!
//! Templates are append-only version chains. A template row is never
//! mutated in place; updates and rollbacks always produce a new version.

use crate::condition::ConditionGroup;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default routing-rule priority when the author leaves it unset.
pub const DEFAULT_RULE_PRIORITY: u32 = 100;

/// Execution mode for a template stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    Serial,
    Parallel,
}

/// Completion threshold for a parallel stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumKind {
    Count,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    #[serde(rename = "type")]
    pub kind: QuorumKind,
    pub value: u32,
}

impl Quorum {
    pub fn count(value: u32) -> Self {
        Self {
            kind: QuorumKind::Count,
            value,
        }
    }

    pub fn percentage(value: u32) -> Self {
        Self {
            kind: QuorumKind::Percentage,
            value,
        }
    }
}

/// One stage of a template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStage {
    pub stage_no: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mode: StageMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<Quorum>,
    /// SLA window in seconds; task `due_at` is derived from this at
    /// stage activation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_secs: Option<u64>,
}

impl TemplateStage {
    pub fn serial(stage_no: u32) -> Self {
        Self {
            stage_no,
            name: None,
            mode: StageMode::Serial,
            quorum: None,
            sla_secs: None,
        }
    }

    pub fn parallel(stage_no: u32) -> Self {
        Self {
            stage_no,
            name: None,
            mode: StageMode::Parallel,
            quorum: None,
            sla_secs: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_quorum(mut self, quorum: Quorum) -> Self {
        self.quorum = Some(quorum);
        self
    }

    pub fn with_sla_secs(mut self, secs: u64) -> Self {
        self.sla_secs = Some(secs);
        self
    }
}

/// Assignment expansion strategy for a routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignStrategy {
    Direct,
    Role,
    Group,
    Hierarchy,
    Department,
    CustomField,
    /// Strategies persisted by older template versions that this engine
    /// no longer recognizes. Fails validation; resolves as `Direct`.
    Unknown,
}

impl AssignStrategy {
    /// Parse a persisted strategy name. Unrecognized names map to
    /// `Unknown` rather than failing, so old stored artifacts still load.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "direct" => Self::Direct,
            "role" => Self::Role,
            "group" => Self::Group,
            "hierarchy" => Self::Hierarchy,
            "department" => Self::Department,
            "custom_field" => Self::CustomField,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Role => "role",
            Self::Group => "group",
            Self::Hierarchy => "hierarchy",
            Self::Department => "department",
            Self::CustomField => "custom_field",
            Self::Unknown => "unknown",
        }
    }
}

impl<'de> Deserialize<'de> for AssignStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Assignment target of a routing rule. Which fields are meaningful
/// depends on `strategy`; unused fields stay `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssignmentTarget {
    pub strategy: AssignStrategy,
    /// Literal assignees (`direct`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<String>,
    /// Legacy single-assignee form of `direct`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    /// Role name (`role`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Principal group name (`group`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Organizational unit (`department`, or subtree filter for `role`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Parent-chain hops for `hierarchy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_levels: Option<u32>,
    /// Metadata key/value pair for `custom_field`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value: Option<Value>,
}

impl Default for AssignStrategy {
    fn default() -> Self {
        Self::Direct
    }
}

impl AssignmentTarget {
    pub fn direct(assignees: Vec<String>) -> Self {
        Self {
            strategy: AssignStrategy::Direct,
            assignees,
            ..Default::default()
        }
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self {
            strategy: AssignStrategy::Role,
            role: Some(role.into()),
            ..Default::default()
        }
    }

    pub fn group(group: impl Into<String>) -> Self {
        Self {
            strategy: AssignStrategy::Group,
            group: Some(group.into()),
            ..Default::default()
        }
    }

    pub fn hierarchy(skip_levels: u32) -> Self {
        Self {
            strategy: AssignStrategy::Hierarchy,
            skip_levels: Some(skip_levels),
            ..Default::default()
        }
    }

    pub fn department(unit: impl Into<String>) -> Self {
        Self {
            strategy: AssignStrategy::Department,
            unit: Some(unit.into()),
            ..Default::default()
        }
    }

    pub fn custom_field(key: impl Into<String>, value: Value) -> Self {
        Self {
            strategy: AssignStrategy::CustomField,
            field_key: Some(key.into()),
            field_value: Some(value),
            ..Default::default()
        }
    }
}

/// Ordered routing rule. Lower priority evaluates first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionGroup>,
    pub assign_to: AssignmentTarget,
}

impl RoutingRule {
    pub fn new(assign_to: AssignmentTarget) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority: None,
            conditions: None,
            assign_to,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionGroup) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn effective_priority(&self) -> u32 {
        self.priority.unwrap_or(DEFAULT_RULE_PRIORITY)
    }
}

/// One version of an approval template. Exactly one version per
/// `(tenant_id, code)` has `is_active = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTemplate {
    pub id: String,
    pub tenant_id: String,
    pub code: String,
    pub name: String,
    pub version_no: u32,
    pub is_active: bool,
    pub stages: Vec<TemplateStage>,
    pub rules: Vec<RoutingRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled: Option<CompiledTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalTemplate {
    pub fn new(
        tenant_id: impl Into<String>,
        code: impl Into<String>,
        name: impl Into<String>,
        stages: Vec<TemplateStage>,
        rules: Vec<RoutingRule>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            code: code.into(),
            name: name.into(),
            version_no: 1,
            is_active: true,
            stages,
            rules,
            compiled_hash: None,
            compiled: None,
            created_by: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.created_by = Some(author.into());
        self
    }
}

/// Immutable, hash-addressed compiled artifact of a template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub template_id: String,
    pub code: String,
    pub version_no: u32,
    pub stages: Vec<TemplateStage>,
    pub rules: Vec<RoutingRule>,
    pub compiled_hash: String,
    pub compiled_at: DateTime<Utc>,
}

/// One structural validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

/// Outcome of template validation. Validation reports, it never fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            valid: issues.is_empty(),
            issues,
        }
    }
}

/// Structural validation of a template definition.
///
/// Checks: at least one stage; stage numbers contiguous from 1; at least
/// one routing rule; every rule carries a known assignment strategy.
/// Stage mode and condition shape are enforced by the type system.
pub fn validate_template(template: &ApprovalTemplate) -> ValidationReport {
    let mut issues = Vec::new();

    if template.stages.is_empty() {
        issues.push(ValidationIssue {
            path: "stages".to_string(),
            message: "template must define at least one stage".to_string(),
        });
    } else {
        let mut numbers: Vec<u32> = template.stages.iter().map(|s| s.stage_no).collect();
        numbers.sort_unstable();
        for (position, stage_no) in numbers.iter().enumerate() {
            let expected = position as u32 + 1;
            if *stage_no != expected {
                issues.push(ValidationIssue {
                    path: "stages".to_string(),
                    message: format!(
                        "stage numbers must be contiguous from 1: expected {}, found {}",
                        expected, stage_no
                    ),
                });
                break;
            }
        }
    }

    if template.rules.is_empty() {
        issues.push(ValidationIssue {
            path: "rules".to_string(),
            message: "template must define at least one routing rule".to_string(),
        });
    }

    for (index, rule) in template.rules.iter().enumerate() {
        if rule.assign_to.strategy == AssignStrategy::Unknown {
            issues.push(ValidationIssue {
                path: format!("rules[{}].assign_to.strategy", index),
                message: "unknown assignment strategy".to_string(),
            });
        }
    }

    ValidationReport::from_issues(issues)
}

/// Compile a template version into its hash-addressed artifact.
///
/// The hash covers only semantically relevant fields, in a stable order,
/// so recompiling an unchanged template reproduces the identical hash.
pub fn compile_template(template: &ApprovalTemplate) -> CompiledTemplate {
    let mut stages = template.stages.clone();
    stages.sort_by_key(|stage| stage.stage_no);

    let mut rules = template.rules.clone();
    rules.sort_by(|a, b| {
        a.effective_priority()
            .cmp(&b.effective_priority())
            .then_with(|| a.id.cmp(&b.id))
    });

    let compiled_hash = compiled_hash(&template.code, template.version_no, &stages, &rules);

    CompiledTemplate {
        template_id: template.id.clone(),
        code: template.code.clone(),
        version_no: template.version_no,
        stages,
        rules,
        compiled_hash,
        compiled_at: Utc::now(),
    }
}

fn compiled_hash(
    code: &str,
    version_no: u32,
    stages: &[TemplateStage],
    rules: &[RoutingRule],
) -> String {
    let stage_material: Vec<Value> = stages
        .iter()
        .map(|stage| {
            serde_json::json!({
                "stage_no": stage.stage_no,
                "mode": stage.mode,
                "quorum": stage.quorum,
            })
        })
        .collect();
    let rule_material: Vec<Value> = rules
        .iter()
        .map(|rule| {
            serde_json::json!({
                "priority": rule.effective_priority(),
                "conditions": rule.conditions,
                "assign_to": rule.assign_to,
            })
        })
        .collect();

    let material = serde_json::json!({
        "code": code,
        "version": version_no,
        "stages": stage_material,
        "rules": rule_material,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_stage_template() -> ApprovalTemplate {
        ApprovalTemplate::new(
            "tenant-a",
            "expense-approval",
            "Expense Approval",
            vec![
                TemplateStage::serial(1).with_sla_secs(3_600),
                TemplateStage::parallel(2).with_quorum(Quorum::count(2)),
            ],
            vec![RoutingRule::new(AssignmentTarget::direct(vec![
                "p-finance".to_string(),
            ]))],
        )
    }

    #[test]
    fn valid_template_passes() {
        let report = validate_template(&two_stage_template());
        assert!(report.valid);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn missing_stages_and_rules_are_reported() {
        let template =
            ApprovalTemplate::new("tenant-a", "empty", "Empty", Vec::new(), Vec::new());
        let report = validate_template(&template);
        assert!(!report.valid);
        assert!(report.issues.iter().any(|i| i.path == "stages"));
        assert!(report.issues.iter().any(|i| i.path == "rules"));
    }

    #[test]
    fn stage_number_gap_fails_with_stages_path() {
        let mut template = two_stage_template();
        template.stages = vec![
            TemplateStage::serial(1),
            TemplateStage::serial(2),
            TemplateStage::serial(4),
        ];
        let report = validate_template(&template);
        assert!(!report.valid);
        let issue = report
            .issues
            .iter()
            .find(|i| i.path == "stages")
            .expect("gap issue");
        assert!(issue.message.contains("expected 3"));
    }

    #[test]
    fn unknown_strategy_fails_validation() {
        let mut template = two_stage_template();
        template.rules[0].assign_to.strategy = AssignStrategy::Unknown;
        let report = validate_template(&template);
        assert!(!report.valid);
        assert!(report
            .issues
            .iter()
            .any(|i| i.path.contains("assign_to.strategy")));
    }

    #[test]
    fn compilation_is_idempotent() {
        let template = two_stage_template();
        let first = compile_template(&template);
        let second = compile_template(&template);
        assert_eq!(first.compiled_hash, second.compiled_hash);
    }

    #[test]
    fn compiled_hash_ignores_rule_input_order() {
        let mut template = two_stage_template();
        let extra = RoutingRule::new(AssignmentTarget::role("cfo")).with_priority(10);
        template.rules.push(extra.clone());
        let forward = compile_template(&template);

        template.rules.reverse();
        let reversed = compile_template(&template);
        assert_eq!(forward.compiled_hash, reversed.compiled_hash);
    }

    #[test]
    fn compiled_hash_tracks_semantic_changes() {
        let template = two_stage_template();
        let original = compile_template(&template);

        let mut changed = template.clone();
        changed.stages[1].quorum = Some(Quorum::percentage(50));
        let recompiled = compile_template(&changed);
        assert_ne!(original.compiled_hash, recompiled.compiled_hash);
    }

    #[test]
    fn name_changes_do_not_affect_the_hash() {
        let template = two_stage_template();
        let original = compile_template(&template);

        let mut renamed = template.clone();
        renamed.name = "Renamed".to_string();
        assert_eq!(original.compiled_hash, compile_template(&renamed).compiled_hash);
    }

    #[test]
    fn unknown_strategy_round_trips_through_serde() {
        let target: AssignmentTarget = serde_json::from_value(serde_json::json!({
            "strategy": "magic_eight_ball",
            "assignees": ["p-1"]
        }))
        .unwrap();
        assert_eq!(target.strategy, AssignStrategy::Unknown);
        assert_eq!(target.assignees, vec!["p-1".to_string()]);
    }

    #[test]
    fn legacy_principal_id_form_deserializes() {
        let target: AssignmentTarget = serde_json::from_value(serde_json::json!({
            "strategy": "direct",
            "principal_id": "p1"
        }))
        .unwrap();
        assert_eq!(target.principal_id.as_deref(), Some("p1"));
        assert!(target.assignees.is_empty());
    }
}
