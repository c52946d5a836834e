//! Audit records of rebuild attempts.

use std::fmt;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReindexResult;
use crate::index::Index;

/// Lifecycle of a [`ReindexAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    /// Created, not yet started.
    #[default]
    Pending,
    /// The rebuild is running.
    Started,
    /// The rebuild completed.
    Finished,
    /// The rebuild failed.
    Failed,
}

impl ActionState {
    /// Lowercase name, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Pending => "pending",
            ActionState::Started => "started",
            ActionState::Finished => "finished",
            ActionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionState::Pending),
            "started" => Ok(ActionState::Started),
            "finished" => Ok(ActionState::Finished),
            "failed" => Ok(ActionState::Failed),
            other => Err(format!("unknown action state: {other}")),
        }
    }
}

/// One rebuild attempt of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexAction {
    /// Unique id.
    pub id: Uuid,
    /// `schema.name` of the index.
    pub index_identifier: String,
    /// When the attempt started.
    pub action_start: DateTime<Utc>,
    /// When the attempt ended.
    pub action_end: Option<DateTime<Utc>>,
    /// On-disk size before the rebuild.
    pub ondisk_size_bytes_start: u64,
    /// On-disk size after the rebuild.
    pub ondisk_size_bytes_end: Option<u64>,
    /// Estimated bloat before the rebuild.
    pub bloat_estimate_bytes_start: Option<u64>,
    /// Current state.
    pub state: ActionState,
}

impl ReindexAction {
    /// A pending action for `index`.
    pub fn new(index: &Index) -> Self {
        Self {
            id: Uuid::new_v4(),
            index_identifier: index.identifier(),
            action_start: Utc::now(),
            action_end: None,
            ondisk_size_bytes_start: index.ondisk_size_bytes,
            ondisk_size_bytes_end: None,
            bloat_estimate_bytes_start: index.bloat_size_bytes,
            state: ActionState::Pending,
        }
    }

    /// Marks the action started now.
    pub fn start(&mut self) {
        self.action_start = Utc::now();
        self.state = ActionState::Started;
    }

    /// Ends the action. `index_after` is the rebuilt index as re-read from
    /// the catalog, if it could be found.
    pub fn finish(&mut self, index_after: Option<&Index>, succeeded: bool) {
        self.action_end = Some(Utc::now());
        self.ondisk_size_bytes_end = index_after.map(|i| i.ondisk_size_bytes);
        self.state = if succeeded {
            ActionState::Finished
        } else {
            ActionState::Failed
        };
    }

    /// Time between start and end, once ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.action_end.map(|end| end - self.action_start)
    }
}

/// Persistent history of rebuild attempts.
#[async_trait]
pub trait ReindexHistory: Send + Sync + Debug {
    /// Inserts or updates `action`, keyed by its id.
    async fn record(&self, action: &ReindexAction) -> ReindexResult<()>;

    /// Actions that started in `[from, to)`, oldest first.
    async fn actions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReindexResult<Vec<ReindexAction>>;

    /// Actions for one index that started in `[from, to)`.
    async fn actions_for(
        &self,
        index_identifier: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReindexResult<Vec<ReindexAction>> {
        let mut actions = self.actions_between(from, to).await?;
        actions.retain(|a| a.index_identifier == index_identifier);
        Ok(actions)
    }
}

/// In-process [`ReindexHistory`], for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    actions: Mutex<Vec<ReindexAction>>,
}

impl MemoryHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded action, in insertion order.
    pub fn all(&self) -> Vec<ReindexAction> {
        self.actions.lock().clone()
    }
}

#[async_trait]
impl ReindexHistory for MemoryHistory {
    async fn record(&self, action: &ReindexAction) -> ReindexResult<()> {
        let mut actions = self.actions.lock();
        match actions.iter_mut().find(|a| a.id == action.id) {
            Some(existing) => *existing = action.clone(),
            None => actions.push(action.clone()),
        }
        Ok(())
    }

    async fn actions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ReindexResult<Vec<ReindexAction>> {
        let mut actions: Vec<ReindexAction> = self
            .actions
            .lock()
            .iter()
            .filter(|a| a.action_start >= from && a.action_start < to)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.action_start);
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::index;

    #[test]
    fn test_action_lifecycle() {
        let idx = index("index_users_on_email");
        let mut action = ReindexAction::new(&idx);
        assert_eq!(action.state, ActionState::Pending);
        assert_eq!(action.index_identifier, "public.index_users_on_email");
        assert_eq!(action.bloat_estimate_bytes_start, Some(1024 * 1024 * 1024));

        action.start();
        assert_eq!(action.state, ActionState::Started);
        assert!(action.duration().is_none());

        let mut rebuilt = idx.clone();
        rebuilt.ondisk_size_bytes = 1024;
        action.finish(Some(&rebuilt), true);
        assert_eq!(action.state, ActionState::Finished);
        assert_eq!(action.ondisk_size_bytes_end, Some(1024));
        assert!(action.duration().is_some());
    }

    #[test]
    fn test_failed_action_without_index() {
        let mut action = ReindexAction::new(&index("i"));
        action.start();
        action.finish(None, false);
        assert_eq!(action.state, ActionState::Failed);
        assert_eq!(action.ondisk_size_bytes_end, None);
    }

    #[test]
    fn test_state_round_trip_through_str() {
        for state in [
            ActionState::Pending,
            ActionState::Started,
            ActionState::Finished,
            ActionState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ActionState>(), Ok(state));
        }
        assert!("done".parse::<ActionState>().is_err());
    }

    #[tokio::test]
    async fn test_memory_history_upserts_and_filters() {
        let history = MemoryHistory::new();
        let mut action = ReindexAction::new(&index("a"));
        history.record(&action).await.unwrap();
        action.start();
        history.record(&action).await.unwrap();
        history.record(&ReindexAction::new(&index("b"))).await.unwrap();

        assert_eq!(history.all().len(), 2);
        assert_eq!(history.all()[0].state, ActionState::Started);

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        let for_a = history.actions_for("public.a", from, to).await.unwrap();
        assert_eq!(for_a.len(), 1);

        let future = history
            .actions_between(to, to + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(future.is_empty());
    }
}
