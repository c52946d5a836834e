//! Units of work: requests and background jobs.
//!
//! A boundary owns the [`Session`] of one unit of work. It consults the
//! sticking records when the work starts, persists new ones when it finishes,
//! and clears the session exactly once on every exit path.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LbResult;
use crate::location::WalLocation;
use crate::session::Session;
use crate::sticking::Sticking;

/// An entity whose writes must be visible to later units of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyKey {
    /// Entity kind, such as `user`.
    pub namespace: String,
    /// Entity identifier.
    pub id: String,
}

impl StickyKey {
    /// Creates a key.
    pub fn new(namespace: impl Into<String>, id: impl ToString) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.to_string(),
        }
    }
}

/// Starts units of work for inbound requests.
#[derive(Debug, Clone)]
pub struct RequestBoundary {
    sticking: Sticking,
}

impl RequestBoundary {
    /// Creates a boundary using `sticking`.
    pub fn new(sticking: Sticking) -> Self {
        Self { sticking }
    }

    /// Starts a unit of work for a request touching `keys`.
    ///
    /// The session is pinned to the primary if any key still has a write
    /// the replicas have not replayed.
    pub async fn begin(&self, keys: Vec<StickyKey>) -> UnitOfWork {
        let mut session = Session::new();
        for key in &keys {
            self.sticking
                .unstick_or_continue_sticking(&mut session, &key.namespace, &key.id)
                .await;
        }
        UnitOfWork::new(session, keys, self.sticking.clone())
    }
}

/// The routing state of one request or job.
///
/// Call [`finish`](UnitOfWork::finish) on success. Dropping it without
/// finishing clears the session without sticking anything.
#[derive(Debug)]
pub struct UnitOfWork {
    session: Session,
    keys: Vec<StickyKey>,
    sticking: Sticking,
    finished: bool,
}

impl UnitOfWork {
    fn new(session: Session, keys: Vec<StickyKey>, sticking: Sticking) -> Self {
        Self {
            session,
            keys,
            sticking,
            finished: false,
        }
    }

    /// The session to route queries with.
    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The keys this unit of work sticks on write.
    pub fn keys(&self) -> &[StickyKey] {
        &self.keys
    }

    /// Sticks every key if the session wrote, then clears the session.
    pub async fn finish(mut self) -> LbResult<()> {
        let mut result = Ok(());
        for key in &self.keys {
            if let Err(e) = self
                .sticking
                .stick_if_necessary(&mut self.session, &key.namespace, &key.id)
                .await
            {
                warn!(namespace = %key.namespace, id = %key.id, error = %e, "Failed to stick");
                result = Err(e);
                break;
            }
        }
        self.clear();
        result
    }

    fn clear(&mut self) {
        if !self.finished {
            self.session.clear();
            self.finished = true;
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            debug!(keys = self.keys.len(), "Unit of work ended without finish");
            self.clear();
        }
    }
}

/// Replica freshness a background job needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataConsistency {
    /// Always use the primary.
    #[default]
    Always,
    /// Use replicas if they replayed the enqueuing write, otherwise the primary.
    Sticky,
    /// Like `Sticky`, but retry the job once before falling back to the primary.
    Delayed,
}

/// What to do with a job that is about to run.
#[derive(Debug)]
pub enum JobDecision {
    /// Run the job with this unit of work.
    Run(UnitOfWork),
    /// Replicas are behind. Re-enqueue the job.
    Retry,
}

/// Carries write locations from job producers to job workers.
#[derive(Debug, Clone)]
pub struct JobBoundary {
    sticking: Sticking,
}

impl JobBoundary {
    /// Creates a boundary using `sticking`.
    pub fn new(sticking: Sticking) -> Self {
        Self { sticking }
    }

    /// The location a job enqueued from `session` must wait for.
    ///
    /// Only sessions pinned to the primary carry a location.
    pub async fn location_for_enqueue(&self, session: &Session) -> Option<WalLocation> {
        if !session.using_primary() {
            return None;
        }
        if let Some(location) = session.last_write_location() {
            return Some(location);
        }
        match self.sticking.load_balancer().primary_write_location().await {
            Ok(location) => Some(location),
            Err(e) => {
                warn!(error = %e, "Could not read primary write location for job");
                None
            }
        }
    }

    /// Decides where a job runs.
    ///
    /// `attempt` is zero on the first run of the job.
    pub async fn begin(
        &self,
        consistency: DataConsistency,
        location: Option<WalLocation>,
        attempt: u32,
    ) -> JobDecision {
        let mut session = Session::new();

        let use_primary = match (consistency, location) {
            (DataConsistency::Always, _) => true,
            (_, None) => false,
            (_, Some(location)) => {
                if self.sticking.load_balancer().all_caught_up(&location).await {
                    false
                } else if consistency == DataConsistency::Delayed && attempt == 0 {
                    debug!(%location, "Replicas behind, retrying delayed job");
                    return JobDecision::Retry;
                } else {
                    true
                }
            }
        };

        if use_primary {
            session.use_primary();
        }
        JobDecision::Run(UnitOfWork::new(session, Vec::new(), self.sticking.clone()))
    }
}
