//! Read-after-write consistency across units of work and processes.
//!
//! After a write, the primary's WAL location is stored under a key for the
//! entity that was written (for example a user or a project). Later units of
//! work touching that entity read from the primary until every replica has
//! replayed past the stored location, at which point the record is removed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LbResult;
use crate::load_balancer::LoadBalancer;
use crate::location::WalLocation;
use crate::session::Session;
use crate::store::StickingStore;

/// Default key prefix for sticking records.
pub const DEFAULT_COMPONENT: &str = "database-load-balancing";

/// Persists and checks write locations for sticky entities.
#[derive(Debug, Clone)]
pub struct Sticking {
    load_balancer: Arc<LoadBalancer>,
    store: Arc<dyn StickingStore>,
    expiration: Duration,
    component: String,
}

impl Sticking {
    /// Creates a sticking helper. Records expire after the load balancer's
    /// `sticking_expiration`.
    pub fn new(load_balancer: Arc<LoadBalancer>, store: Arc<dyn StickingStore>) -> Self {
        let expiration = load_balancer.config().sticking_expiration;
        Self {
            load_balancer,
            store,
            expiration,
            component: DEFAULT_COMPONENT.to_string(),
        }
    }

    /// Uses `component` as the key prefix instead of [`DEFAULT_COMPONENT`].
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// The load balancer whose replicas are checked.
    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    /// Store key for an entity: `<component>/write-location/<namespace>/<id>`.
    pub fn key(&self, namespace: &str, id: &str) -> String {
        format!("{}/write-location/{}/{}", self.component, namespace, id)
    }

    /// Sticks the entity if the session wrote.
    pub async fn stick_if_necessary(
        &self,
        session: &mut Session,
        namespace: &str,
        id: &str,
    ) -> LbResult<()> {
        if session.performed_write() {
            self.stick(session, namespace, id).await?;
        }
        Ok(())
    }

    /// Stores the primary's write location for the entity and pins the session.
    pub async fn stick(&self, session: &mut Session, namespace: &str, id: &str) -> LbResult<()> {
        session.use_primary();
        if !self.load_balancer.enabled() {
            return Ok(());
        }

        let location = self.load_balancer.primary_write_location().await?;
        self.set_write_location(namespace, id, &location).await?;
        debug!(namespace, id, %location, "Stuck to primary");
        Ok(())
    }

    /// Sticks many entities of one namespace to a single write location.
    pub async fn bulk_stick(
        &self,
        session: &mut Session,
        namespace: &str,
        ids: &[String],
    ) -> LbResult<()> {
        session.use_primary();
        if !self.load_balancer.enabled() || ids.is_empty() {
            return Ok(());
        }

        let location = self.load_balancer.primary_write_location().await?;
        for id in ids {
            self.set_write_location(namespace, id, &location).await?;
        }
        debug!(namespace, count = ids.len(), %location, "Bulk stuck to primary");
        Ok(())
    }

    /// Returns true if every replica caught up with the entity's last write.
    ///
    /// Removes the record when they have. Entities without a record are
    /// always caught up.
    pub async fn all_caught_up(&self, namespace: &str, id: &str) -> LbResult<bool> {
        let key = self.key(namespace, id);
        let Some(stored) = self.store.get(&key).await? else {
            return Ok(true);
        };

        let location = match stored.parse::<WalLocation>() {
            Ok(location) => location,
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding unreadable write location");
                self.store.delete_if_equals(&key, &stored).await?;
                return Ok(true);
            }
        };

        if self.load_balancer.all_caught_up(&location).await {
            self.store.delete_if_equals(&key, &stored).await?;
            debug!(namespace, id, %location, "Replicas caught up, unstuck");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Pins the session to the primary unless replicas caught up with the entity.
    ///
    /// Store failures also pin the session, since freshness cannot be proven.
    pub async fn unstick_or_continue_sticking(
        &self,
        session: &mut Session,
        namespace: &str,
        id: &str,
    ) {
        match self.all_caught_up(namespace, id).await {
            Ok(true) => {}
            Ok(false) => session.use_primary(),
            Err(e) => {
                warn!(namespace, id, error = %e, "Sticking check failed, using primary");
                session.use_primary();
            }
        }
    }

    /// Removes the entity's record.
    pub async fn unstick(&self, namespace: &str, id: &str) -> LbResult<()> {
        self.store.delete(&self.key(namespace, id)).await
    }

    /// The stored write location for the entity, if any.
    pub async fn last_write_location_for(
        &self,
        namespace: &str,
        id: &str,
    ) -> LbResult<Option<WalLocation>> {
        match self.store.get(&self.key(namespace, id)).await? {
            Some(stored) => stored.parse().map(Some),
            None => Ok(None),
        }
    }

    async fn set_write_location(
        &self,
        namespace: &str,
        id: &str,
        location: &WalLocation,
    ) -> LbResult<()> {
        self.store
            .set(&self.key(namespace, id), &location.to_string(), self.expiration)
            .await
    }
}
