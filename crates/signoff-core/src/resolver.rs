//! Approver resolution: first-match routing over prioritized rules, with
//! strategy expansion against the directory and a TTL'd expansion cache.

use crate::cache::{ResolutionCache, RESOLUTION_CACHE_TTL_SECS};
use crate::condition;
use crate::directory::{walk_unit_ancestors, DirectoryProvider};
use crate::error::ApprovalError;
use crate::template::{AssignStrategy, AssignmentTarget, RoutingRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Result of resolving a rule list against a context.
///
/// `assignees` empty with `rule_id` set means the matching rule expanded
/// to nobody; `rule_id` absent means no rule matched at all. Callers must
/// treat both as "no approvers could be resolved" but may report them
/// differently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub assignees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl Resolution {
    fn empty() -> Self {
        Self {
            assignees: Vec::new(),
            rule_id: None,
            strategy: None,
        }
    }
}

/// Expands routing rules into concrete principal ids.
pub struct ApproverResolver {
    directory: Arc<dyn DirectoryProvider>,
    cache: Arc<dyn ResolutionCache>,
    cache_ttl_secs: u64,
}

impl ApproverResolver {
    pub fn new(directory: Arc<dyn DirectoryProvider>, cache: Arc<dyn ResolutionCache>) -> Self {
        Self {
            directory,
            cache,
            cache_ttl_secs: RESOLUTION_CACHE_TTL_SECS,
        }
    }

    pub fn with_cache_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_secs = ttl_secs;
        self
    }

    /// Resolve the first matching rule into assignees.
    ///
    /// Rules are evaluated ascending by priority (default 100), ties
    /// broken by input order. A rule with a non-empty condition group
    /// that evaluates false is skipped; the first rule expanding to at
    /// least one assignee wins and evaluation stops there.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        rules: &[RoutingRule],
        context: &Value,
    ) -> Result<Resolution, ApprovalError> {
        let mut ordered: Vec<&RoutingRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| rule.effective_priority());

        for rule in ordered {
            let matched = match &rule.conditions {
                None => true,
                Some(group) if group.is_empty() => true,
                Some(group) => condition::evaluate(group, context),
            };
            if !matched {
                continue;
            }

            let assignees = self
                .expand_target(tenant_id, &rule.assign_to, context)
                .await?;
            if !assignees.is_empty() {
                return Ok(Resolution {
                    assignees,
                    rule_id: Some(rule.id.clone()),
                    strategy: Some(rule.assign_to.strategy.name().to_string()),
                });
            }
        }

        Ok(Resolution::empty())
    }

    async fn expand_target(
        &self,
        tenant_id: &str,
        target: &AssignmentTarget,
        context: &Value,
    ) -> Result<Vec<String>, ApprovalError> {
        match target.strategy {
            // Unknown strategies fall back to direct so templates written
            // against older strategy sets still route somewhere.
            AssignStrategy::Direct | AssignStrategy::Unknown => Ok(expand_direct(target)),
            AssignStrategy::Role => {
                let Some(role) = target.role.as_deref() else {
                    return Ok(Vec::new());
                };
                let key = match target.unit.as_deref() {
                    Some(unit) => format!("{role}@{unit}"),
                    None => role.to_string(),
                };
                self.expand_cached(tenant_id, "role", &key, || async move {
                    self.directory
                        .principals_with_role(tenant_id, role, target.unit.as_deref())
                        .await
                })
                .await
            }
            AssignStrategy::Group => {
                let Some(group) = target.group.as_deref() else {
                    return Ok(Vec::new());
                };
                self.expand_cached(tenant_id, "group", group, || async move {
                    self.directory.group_members(tenant_id, group).await
                })
                .await
            }
            AssignStrategy::Department => {
                let Some(unit) = target.unit.as_deref() else {
                    return Ok(Vec::new());
                };
                self.expand_cached(tenant_id, "department", unit, || async move {
                    self.directory.unit_principals(tenant_id, unit).await
                })
                .await
            }
            AssignStrategy::Hierarchy => {
                let skip_levels = target.skip_levels.unwrap_or(1);
                let Some(requester) = context_requester(context) else {
                    return Ok(Vec::new());
                };
                let key = format!("{requester}+{skip_levels}");
                self.expand_cached(tenant_id, "hierarchy", &key, || async move {
                    self.expand_hierarchy(tenant_id, &requester, skip_levels)
                        .await
                })
                .await
            }
            AssignStrategy::CustomField => {
                let (Some(key), Some(value)) =
                    (target.field_key.as_deref(), target.field_value.as_ref())
                else {
                    return Ok(Vec::new());
                };
                let cache_key = format!("{key}={value}");
                self.expand_cached(tenant_id, "custom_field", &cache_key, || async move {
                    self.directory
                        .principals_with_metadata(tenant_id, key, value)
                        .await
                })
                .await
            }
        }
    }

    async fn expand_hierarchy(
        &self,
        tenant_id: &str,
        requester: &str,
        skip_levels: u32,
    ) -> Result<Vec<String>, ApprovalError> {
        let Some(unit) = self.directory.principal_unit(tenant_id, requester).await? else {
            return Ok(Vec::new());
        };

        match walk_unit_ancestors(self.directory.as_ref(), tenant_id, &unit, skip_levels).await? {
            Some(ancestor) => self.directory.unit_principals(tenant_id, &ancestor).await,
            None => Ok(Vec::new()),
        }
    }

    /// Run `expand` behind the resolution cache. Cache failures are
    /// swallowed and the expansion goes straight to the directory.
    async fn expand_cached<F, Fut>(
        &self,
        tenant_id: &str,
        strategy: &str,
        key: &str,
        expand: F,
    ) -> Result<Vec<String>, ApprovalError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<String>, ApprovalError>>,
    {
        let cache_key = format!("approvers:{tenant_id}:{strategy}:{key}");

        match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => {
                if let Ok(assignees) = serde_json::from_str::<Vec<String>>(&raw) {
                    return Ok(assignees);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(%cache_key, error = %e, "resolution cache read failed; bypassing");
            }
        }

        let assignees = expand().await?;

        match serde_json::to_string(&assignees) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(&cache_key, &raw, self.cache_ttl_secs).await {
                    tracing::debug!(%cache_key, error = %e, "resolution cache write failed");
                }
            }
            Err(e) => {
                tracing::debug!(%cache_key, error = %e, "resolution cache encode failed");
            }
        }

        Ok(assignees)
    }
}

/// Literal assignees of a `direct` target, supporting both the array and
/// the legacy single `principal_id` form.
fn expand_direct(target: &AssignmentTarget) -> Vec<String> {
    let mut assignees = target.assignees.clone();
    if let Some(principal) = target.principal_id.as_ref() {
        if !assignees.contains(principal) {
            assignees.push(principal.clone());
        }
    }
    assignees
}

fn context_requester(context: &Value) -> Option<String> {
    context
        .get("requester")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::condition::{CompareOp, ConditionGroup, ConditionNode, ConditionRule};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic directory fixture with explicit parent pointers.
    #[derive(Default)]
    struct FixtureDirectory {
        roles: HashMap<String, Vec<String>>,
        groups: HashMap<String, Vec<String>>,
        unit_members: HashMap<String, Vec<String>>,
        principal_units: HashMap<String, String>,
        unit_parents: HashMap<String, String>,
        metadata: HashMap<String, Vec<(String, Value)>>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl DirectoryProvider for FixtureDirectory {
        async fn principals_with_role(
            &self,
            _tenant_id: &str,
            role: &str,
            _unit: Option<&str>,
        ) -> Result<Vec<String>, ApprovalError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.roles.get(role).cloned().unwrap_or_default())
        }

        async fn group_members(
            &self,
            _tenant_id: &str,
            group: &str,
        ) -> Result<Vec<String>, ApprovalError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.groups.get(group).cloned().unwrap_or_default())
        }

        async fn unit_principals(
            &self,
            _tenant_id: &str,
            unit: &str,
        ) -> Result<Vec<String>, ApprovalError> {
            Ok(self.unit_members.get(unit).cloned().unwrap_or_default())
        }

        async fn principal_unit(
            &self,
            _tenant_id: &str,
            principal: &str,
        ) -> Result<Option<String>, ApprovalError> {
            Ok(self.principal_units.get(principal).cloned())
        }

        async fn unit_parent(
            &self,
            _tenant_id: &str,
            unit: &str,
        ) -> Result<Option<String>, ApprovalError> {
            Ok(self.unit_parents.get(unit).cloned())
        }

        async fn principals_with_metadata(
            &self,
            _tenant_id: &str,
            key: &str,
            value: &Value,
        ) -> Result<Vec<String>, ApprovalError> {
            Ok(self
                .metadata
                .iter()
                .filter(|(_, pairs)| pairs.iter().any(|(k, v)| k == key && v == value))
                .map(|(principal, _)| principal.clone())
                .collect())
        }
    }

    /// Cache that always errors, to prove failures are non-fatal.
    struct BrokenCache;

    #[async_trait]
    impl ResolutionCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, ApprovalError> {
            Err(ApprovalError::Storage("cache down".to_string()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: u64) -> Result<(), ApprovalError> {
            Err(ApprovalError::Storage("cache down".to_string()))
        }
    }

    fn resolver_with(directory: FixtureDirectory) -> ApproverResolver {
        ApproverResolver::new(Arc::new(directory), Arc::new(MemoryCache::new()))
    }

    fn eq_rule(field: &str, value: Value) -> ConditionGroup {
        ConditionGroup::all(vec![ConditionNode::Rule(ConditionRule {
            field: field.to_string(),
            op: CompareOp::Eq,
            value,
        })])
    }

    #[tokio::test]
    async fn lowest_matching_priority_wins() {
        let resolver = resolver_with(FixtureDirectory::default());
        let rules = vec![
            RoutingRule::new(AssignmentTarget::direct(vec!["p-30".to_string()]))
                .with_priority(30)
                .with_conditions(eq_rule("tier", json!("low"))),
            RoutingRule::new(AssignmentTarget::direct(vec!["p-10".to_string()]))
                .with_priority(10),
            RoutingRule::new(AssignmentTarget::direct(vec!["p-20".to_string()]))
                .with_priority(20),
        ];

        let resolution = resolver
            .resolve("tenant-a", &rules, &json!({ "tier": "high" }))
            .await
            .unwrap();
        assert_eq!(resolution.assignees, vec!["p-10".to_string()]);
    }

    #[tokio::test]
    async fn unmatched_conditions_skip_to_next_rule() {
        let resolver = resolver_with(FixtureDirectory::default());
        let rules = vec![
            RoutingRule::new(AssignmentTarget::direct(vec!["p-first".to_string()]))
                .with_priority(1)
                .with_conditions(eq_rule("amount", json!(1_000_000))),
            RoutingRule::new(AssignmentTarget::direct(vec!["p-fallback".to_string()]))
                .with_priority(2),
        ];

        let resolution = resolver
            .resolve("tenant-a", &rules, &json!({ "amount": 50 }))
            .await
            .unwrap();
        assert_eq!(resolution.assignees, vec!["p-fallback".to_string()]);
    }

    #[tokio::test]
    async fn legacy_principal_id_resolves_to_one_assignee() {
        let resolver = resolver_with(FixtureDirectory::default());
        let target = AssignmentTarget {
            strategy: AssignStrategy::Direct,
            principal_id: Some("p1".to_string()),
            ..Default::default()
        };
        let rules = vec![RoutingRule::new(target)];

        let resolution = resolver.resolve("tenant-a", &rules, &json!({})).await.unwrap();
        assert_eq!(resolution.assignees, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn unknown_strategy_falls_back_to_direct() {
        let resolver = resolver_with(FixtureDirectory::default());
        let target = AssignmentTarget {
            strategy: AssignStrategy::Unknown,
            assignees: vec!["p-legacy".to_string()],
            ..Default::default()
        };
        let rules = vec![RoutingRule::new(target)];

        let resolution = resolver.resolve("tenant-a", &rules, &json!({})).await.unwrap();
        assert_eq!(resolution.assignees, vec!["p-legacy".to_string()]);
    }

    #[tokio::test]
    async fn hierarchy_walks_skip_levels_up_the_chain() {
        let mut directory = FixtureDirectory::default();
        directory
            .principal_units
            .insert("p-req".to_string(), "team-a".to_string());
        directory
            .unit_parents
            .insert("team-a".to_string(), "dept-x".to_string());
        directory
            .unit_parents
            .insert("dept-x".to_string(), "division-1".to_string());
        directory
            .unit_members
            .insert("division-1".to_string(), vec!["p-vp".to_string()]);

        let resolver = resolver_with(directory);
        let rules = vec![RoutingRule::new(AssignmentTarget::hierarchy(2))];

        let resolution = resolver
            .resolve("tenant-a", &rules, &json!({ "requester": "p-req" }))
            .await
            .unwrap();
        assert_eq!(resolution.assignees, vec!["p-vp".to_string()]);
    }

    #[tokio::test]
    async fn hierarchy_short_chain_resolves_empty() {
        let mut directory = FixtureDirectory::default();
        directory
            .principal_units
            .insert("p-req".to_string(), "team-a".to_string());
        // team-a has no parent: a two-level walk cannot complete.

        let resolver = resolver_with(directory);
        let rules = vec![RoutingRule::new(AssignmentTarget::hierarchy(2))];

        let resolution = resolver
            .resolve("tenant-a", &rules, &json!({ "requester": "p-req" }))
            .await
            .unwrap();
        assert!(resolution.assignees.is_empty());
        assert!(resolution.rule_id.is_none());
    }

    #[tokio::test]
    async fn hierarchy_cycle_resolves_empty() {
        let mut directory = FixtureDirectory::default();
        directory
            .principal_units
            .insert("p-req".to_string(), "team-a".to_string());
        directory
            .unit_parents
            .insert("team-a".to_string(), "dept-x".to_string());
        directory
            .unit_parents
            .insert("dept-x".to_string(), "team-a".to_string());

        let resolver = resolver_with(directory);
        let rules = vec![RoutingRule::new(AssignmentTarget::hierarchy(3))];

        let resolution = resolver
            .resolve("tenant-a", &rules, &json!({ "requester": "p-req" }))
            .await
            .unwrap();
        assert!(resolution.assignees.is_empty());
    }

    #[tokio::test]
    async fn custom_field_matches_metadata_pair() {
        let mut directory = FixtureDirectory::default();
        directory.metadata.insert(
            "p-signer".to_string(),
            vec![("can_sign".to_string(), json!(true))],
        );
        directory.metadata.insert(
            "p-other".to_string(),
            vec![("can_sign".to_string(), json!(false))],
        );

        let resolver = resolver_with(directory);
        let rules = vec![RoutingRule::new(AssignmentTarget::custom_field(
            "can_sign",
            json!(true),
        ))];

        let resolution = resolver.resolve("tenant-a", &rules, &json!({})).await.unwrap();
        assert_eq!(resolution.assignees, vec!["p-signer".to_string()]);
    }

    #[tokio::test]
    async fn group_expansion_is_cached() {
        let mut directory = FixtureDirectory::default();
        directory
            .groups
            .insert("approvers".to_string(), vec!["p-1".to_string()]);
        let lookups = Arc::new(directory);
        let resolver = ApproverResolver::new(lookups.clone(), Arc::new(MemoryCache::new()));
        let rules = vec![RoutingRule::new(AssignmentTarget::group("approvers"))];

        resolver.resolve("tenant-a", &rules, &json!({})).await.unwrap();
        resolver.resolve("tenant-a", &rules, &json!({})).await.unwrap();

        assert_eq!(lookups.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_failures_are_swallowed() {
        let mut directory = FixtureDirectory::default();
        directory
            .groups
            .insert("approvers".to_string(), vec!["p-1".to_string()]);
        let resolver = ApproverResolver::new(Arc::new(directory), Arc::new(BrokenCache));
        let rules = vec![RoutingRule::new(AssignmentTarget::group("approvers"))];

        let resolution = resolver.resolve("tenant-a", &rules, &json!({})).await.unwrap();
        assert_eq!(resolution.assignees, vec!["p-1".to_string()]);
    }

    #[tokio::test]
    async fn no_matching_rule_returns_empty_resolution() {
        let resolver = resolver_with(FixtureDirectory::default());
        let rules = vec![RoutingRule::new(AssignmentTarget::direct(vec![
            "p-1".to_string(),
        ]))
        .with_conditions(eq_rule("region", json!("EU")))];

        let resolution = resolver
            .resolve("tenant-a", &rules, &json!({ "region": "US" }))
            .await
            .unwrap();
        assert!(resolution.assignees.is_empty());
        assert!(resolution.rule_id.is_none());
    }
}
