//! Directory collaborator: the narrow IAM surface the resolver needs.
//!
//! The identity module itself is out of scope; the engine only consumes
//! principal/role/group/organizational-unit lookups through this trait.

use crate::error::ApprovalError;
use async_trait::async_trait;
use serde_json::Value;

/// Hard cap on organizational-unit parent-chain walks. Units are plain
/// parent-pointer records, so cycles must be assumed possible.
pub const MAX_HIERARCHY_DEPTH: u32 = 32;

/// Read-only directory lookups backing approver resolution.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    /// Principals holding `role`, optionally restricted to the subtree
    /// rooted at `unit`.
    async fn principals_with_role(
        &self,
        tenant_id: &str,
        role: &str,
        unit: Option<&str>,
    ) -> Result<Vec<String>, ApprovalError>;

    /// Members of a named principal group.
    async fn group_members(&self, tenant_id: &str, group: &str)
        -> Result<Vec<String>, ApprovalError>;

    /// Principals attached directly to an organizational unit.
    async fn unit_principals(
        &self,
        tenant_id: &str,
        unit: &str,
    ) -> Result<Vec<String>, ApprovalError>;

    /// The organizational unit a principal belongs to, if any.
    async fn principal_unit(
        &self,
        tenant_id: &str,
        principal: &str,
    ) -> Result<Option<String>, ApprovalError>;

    /// The parent of an organizational unit, if any.
    async fn unit_parent(
        &self,
        tenant_id: &str,
        unit: &str,
    ) -> Result<Option<String>, ApprovalError>;

    /// Principals whose metadata document contains the given key/value
    /// pair (structural containment).
    async fn principals_with_metadata(
        &self,
        tenant_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<Vec<String>, ApprovalError>;
}

/// Walk `skip_levels` hops up the unit parent chain starting from
/// `unit`, guarding against cycles and runaway chains.
///
/// Returns `None` when the chain is shorter than `skip_levels` or a
/// cycle is detected before completing the walk.
pub async fn walk_unit_ancestors(
    directory: &dyn DirectoryProvider,
    tenant_id: &str,
    unit: &str,
    skip_levels: u32,
) -> Result<Option<String>, ApprovalError> {
    let mut current = unit.to_string();
    let mut visited = vec![current.clone()];

    for _ in 0..skip_levels.min(MAX_HIERARCHY_DEPTH) {
        match directory.unit_parent(tenant_id, &current).await? {
            Some(parent) => {
                if visited.contains(&parent) {
                    tracing::warn!(tenant_id, unit, %parent, "organizational unit cycle detected");
                    return Ok(None);
                }
                visited.push(parent.clone());
                current = parent;
            }
            None => return Ok(None),
        }
    }

    if skip_levels > MAX_HIERARCHY_DEPTH {
        return Ok(None);
    }

    Ok(Some(current))
}
