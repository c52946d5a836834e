//! Best-effort rebuild annotations for dashboards.
//!
//! Failures are logged and dropped; a notification never affects a rebuild.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::action::ReindexAction;
use crate::config::NotifierConfig;
use crate::error::{ReindexError, ReindexResult};
use crate::index::Index;

/// Tag carried by every annotation.
pub const REINDEX_TAG: &str = "reindex";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives rebuild start and end events.
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    /// Called after the action was recorded, before the rebuild.
    async fn notify_start(&self, index: &Index, action: &ReindexAction);

    /// Called after the action was finished.
    async fn notify_end(&self, index: &Index, action: &ReindexAction);
}

/// A [`Notifier`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_start(&self, _index: &Index, _action: &ReindexAction) {}

    async fn notify_end(&self, _index: &Index, _action: &ReindexAction) {}
}

/// Posts Grafana annotations: a point at start, a region at the end.
#[derive(Debug, Clone)]
pub struct GrafanaNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl GrafanaNotifier {
    /// Creates a notifier. Without an API URL and key it sends nothing.
    pub fn new(config: NotifierConfig) -> ReindexResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ReindexError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, config })
    }

    /// Annotation body posted when a rebuild starts.
    pub fn start_annotation(&self, index: &Index, action: &ReindexAction) -> Value {
        json!({
            "time": action.action_start.timestamp_millis(),
            "tags": self.tags(index),
            "text": format!("Started reindexing of {} on {}", index.name, index.table),
        })
    }

    /// Annotation body posted when a rebuild ends.
    pub fn end_annotation(&self, index: &Index, action: &ReindexAction) -> Value {
        let end = action.action_end.unwrap_or(action.action_start);
        json!({
            "time": action.action_start.timestamp_millis(),
            "timeEnd": end.timestamp_millis(),
            "isRegion": true,
            "tags": self.tags(index),
            "text": format!(
                "Finished reindexing of {} on {} ({})",
                index.name, index.table, action.state
            ),
        })
    }

    fn tags(&self, index: &Index) -> Vec<String> {
        let mut tags = vec![REINDEX_TAG.to_string()];
        if let Some(tag) = self.config.additional_tag.as_deref().filter(|t| !t.is_empty()) {
            tags.push(tag.to_string());
        }
        tags.push(index.table.clone());
        tags.push(index.name.clone());
        tags
    }

    async fn post(&self, body: Value) {
        let (Some(api_url), Some(api_key)) = (&self.config.api_url, &self.config.api_key) else {
            return;
        };
        if !self.config.enabled() {
            return;
        }

        let url = format!("{}/api/annotations", api_url.trim_end_matches('/'));
        let result = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => debug!(%url, "Annotation sent"),
            Err(e) => warn!(%url, error = %e, "Failed to send annotation"),
        }
    }
}

#[async_trait]
impl Notifier for GrafanaNotifier {
    async fn notify_start(&self, index: &Index, action: &ReindexAction) {
        self.post(self.start_annotation(index, action)).await;
    }

    async fn notify_end(&self, index: &Index, action: &ReindexAction) {
        self.post(self.end_annotation(index, action)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::index;

    fn notifier(additional_tag: Option<&str>) -> GrafanaNotifier {
        GrafanaNotifier::new(NotifierConfig {
            api_url: Some("http://grafana.invalid".to_string()),
            api_key: Some("key".to_string()),
            additional_tag: additional_tag.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn test_start_annotation() {
        let idx = index("index_users_on_email");
        let action = ReindexAction::new(&idx);

        let body = notifier(Some("gprd")).start_annotation(&idx, &action);
        assert_eq!(
            body["tags"],
            json!(["reindex", "gprd", "users", "index_users_on_email"])
        );
        assert_eq!(body["text"], "Started reindexing of index_users_on_email on users");
        assert_eq!(body["time"], action.action_start.timestamp_millis());
        assert!(body.get("isRegion").is_none());
    }

    #[test]
    fn test_end_annotation() {
        let idx = index("index_users_on_email");
        let mut action = ReindexAction::new(&idx);
        action.start();
        action.finish(Some(&idx), false);

        let body = notifier(None).end_annotation(&idx, &action);
        assert_eq!(body["tags"], json!(["reindex", "users", "index_users_on_email"]));
        assert_eq!(body["isRegion"], true);
        assert_eq!(
            body["text"],
            "Finished reindexing of index_users_on_email on users (failed)"
        );
        assert!(body["timeEnd"].as_i64().unwrap() >= body["time"].as_i64().unwrap());
    }
}
