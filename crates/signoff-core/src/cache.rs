//! Resolution cache collaborator.
//!
//! Cache failures are never allowed to fail approver resolution; callers
//! swallow errors and fall through to the directory.

use crate::error::ApprovalError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// TTL applied to cached approver expansions.
pub const RESOLUTION_CACHE_TTL_SECS: u64 = 300;

/// Narrow get/set cache surface.
#[async_trait]
pub trait ResolutionCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ApprovalError>;
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApprovalError>;
}

/// Process-local cache with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResolutionCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, ApprovalError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(value, expires_at)| {
            if Instant::now() < *expires_at {
                Some(value.clone())
            } else {
                None
            }
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ApprovalError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            (value.to_string(), Instant::now() + Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }
}
