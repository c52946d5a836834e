//! Cluster-wide exclusive leases.
//!
//! A lease is held under a key until it is released or its timeout passes.
//! Obtaining never waits: a caller that does not get the lease skips its work.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ReindexResult;

/// Lease key serializing every reindex and index drop in the cluster.
pub const REINDEX_LEASE_KEY: &str = "helios/database/reindexing/coordinator";

/// Proof of holding a lease. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// A new random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A store of exclusive, expiring leases.
#[async_trait]
pub trait ExclusiveLease: Send + Sync + Debug {
    /// Takes the lease on `key` for `timeout` if nobody holds it.
    async fn try_obtain(&self, key: &str, timeout: Duration) -> ReindexResult<Option<LeaseToken>>;

    /// Releases the lease if `token` still holds it. Returns true if released.
    async fn release(&self, key: &str, token: &LeaseToken) -> ReindexResult<bool>;
}

/// In-process [`ExclusiveLease`], for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryLease {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
}

impl MemoryLease {
    /// Creates an empty lease store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if someone holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl ExclusiveLease for MemoryLease {
    async fn try_obtain(&self, key: &str, timeout: Duration) -> ReindexResult<Option<LeaseToken>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if leases
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now)
        {
            return Ok(None);
        }
        let token = LeaseToken::generate();
        leases.insert(key.to_string(), (token.clone(), now + timeout));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> ReindexResult<bool> {
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|(held, _)| held == token) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let lease = MemoryLease::new();
        let token = lease
            .try_obtain("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(lease.is_held("k"));
        assert!(lease.try_obtain("k", Duration::from_secs(60)).await.unwrap().is_none());
        assert!(lease.try_obtain("other", Duration::from_secs(60)).await.unwrap().is_some());

        assert!(lease.release("k", &token).await.unwrap());
        assert!(!lease.is_held("k"));
        assert!(lease.try_obtain("k", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_requires_holder_token() {
        let lease = MemoryLease::new();
        lease.try_obtain("k", Duration::from_secs(60)).await.unwrap();

        assert!(!lease.release("k", &LeaseToken::generate()).await.unwrap());
        assert!(lease.is_held("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let lease = MemoryLease::new();
        let stale = lease
            .try_obtain("k", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!lease.is_held("k"));
        assert!(lease.try_obtain("k", Duration::from_secs(60)).await.unwrap().is_some());
        assert!(!lease.release("k", &stale).await.unwrap());
    }
}
