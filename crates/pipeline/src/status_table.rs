//! In-memory job status table.
//!
//! One record per accepted request, written by the worker that owns the
//! request and read by any number of pollers. Terminal records are kept
//! for a TTL and up to a retention capacity (oldest evicted first);
//! records that are still queued or processing are never evicted.

use std::collections::HashMap;
use std::time::Duration;

use meshgen_core::error::CoreError;
use meshgen_core::job::{JobState, JobStatus, MSG_COMPLETED};
use meshgen_core::types::Timestamp;
use tokio::sync::RwLock;

/// Retention limits for terminal records.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// How long a completed or failed record stays readable.
    pub ttl: Duration,
    /// Maximum number of terminal records kept.
    pub capacity: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusTable {
    records: RwLock<HashMap<String, JobStatus>>,
    retention: RetentionPolicy,
}

impl StatusTable {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Insert a fresh `Queued` record.
    ///
    /// Fails with [`CoreError::Conflict`] if any record, terminal or not,
    /// already exists for `request_id`.
    pub async fn insert_queued(&self, request_id: &str) -> Result<JobStatus, CoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(request_id) {
            return Err(CoreError::Conflict(format!(
                "Request {request_id} has already been submitted"
            )));
        }
        let status = JobStatus::queued(request_id);
        records.insert(request_id.to_string(), status.clone());
        Ok(status)
    }

    /// Snapshot of the record for `request_id`.
    pub async fn get(&self, request_id: &str) -> Option<JobStatus> {
        self.records.read().await.get(request_id).cloned()
    }

    /// Move a record to `Processing`, or refresh its message if it is
    /// already there.
    pub async fn mark_processing(
        &self,
        request_id: &str,
        message: impl Into<String>,
    ) -> Result<JobStatus, CoreError> {
        self.apply(request_id, JobState::Processing, message.into(), None)
            .await
    }

    /// Record success with the public URL of the artifact.
    pub async fn complete(
        &self,
        request_id: &str,
        artifact_url: impl Into<String>,
    ) -> Result<JobStatus, CoreError> {
        self.apply(
            request_id,
            JobState::Completed,
            MSG_COMPLETED.to_string(),
            Some(artifact_url.into()),
        )
        .await
    }

    /// Record failure with a human-readable message.
    pub async fn fail(
        &self,
        request_id: &str,
        message: impl Into<String>,
    ) -> Result<JobStatus, CoreError> {
        self.apply(request_id, JobState::Error, message.into(), None)
            .await
    }

    /// Drop terminal records older than the TTL. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(chrono::Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: Timestamp) -> usize {
        let ttl = chrono::Duration::from_std(self.retention.ttl).unwrap_or(chrono::Duration::MAX);
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, status| {
            !status.state.is_terminal() || now.signed_duration_since(status.updated_at) < ttl
        });
        before - records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    // ---- private helpers ----

    async fn apply(
        &self,
        request_id: &str,
        next: JobState,
        message: String,
        artifact_url: Option<String>,
    ) -> Result<JobStatus, CoreError> {
        let mut records = self.records.write().await;
        let status = records.get_mut(request_id).ok_or_else(|| CoreError::NotFound {
            entity: "Request",
            id: request_id.to_string(),
        })?;
        status.transition(next, message, artifact_url)?;
        let snapshot = status.clone();

        if next.is_terminal() {
            evict_oldest_terminal(&mut records, self.retention.capacity);
        }
        Ok(snapshot)
    }
}

/// Evict the oldest terminal records until at most `capacity` remain.
fn evict_oldest_terminal(records: &mut HashMap<String, JobStatus>, capacity: usize) {
    let mut terminal: Vec<(Timestamp, String)> = records
        .values()
        .filter(|s| s.state.is_terminal())
        .map(|s| (s.updated_at, s.request_id.clone()))
        .collect();
    if terminal.len() <= capacity {
        return;
    }
    terminal.sort();
    let excess = terminal.len() - capacity;
    for (_, id) in terminal.into_iter().take(excess) {
        tracing::debug!(request_id = %id, "Evicting status record over retention capacity");
        records.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn table() -> StatusTable {
        StatusTable::new(RetentionPolicy::default())
    }

    #[tokio::test]
    async fn queued_record_is_readable() {
        let table = table();
        table.insert_queued("r1").await.unwrap();

        let status = table.get("r1").await.unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.artifact_url, None);
        assert!(table.get("r2").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let table = table();
        table.insert_queued("r1").await.unwrap();
        assert_matches!(table.insert_queued("r1").await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let table = table();
        table.insert_queued("r1").await.unwrap();
        table.mark_processing("r1", "Uploading image").await.unwrap();
        table.mark_processing("r1", "Waiting for the pipeline to finish").await.unwrap();

        let done = table.complete("r1", "/static/3D/mesh_00001_.glb").await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.message, MSG_COMPLETED);
        assert_eq!(done.artifact_url.as_deref(), Some("/static/3D/mesh_00001_.glb"));
    }

    #[tokio::test]
    async fn terminal_records_never_change() {
        let table = table();
        table.insert_queued("r1").await.unwrap();
        table.mark_processing("r1", "working").await.unwrap();
        table.fail("r1", "Failed to generate model: boom").await.unwrap();

        assert_matches!(table.mark_processing("r1", "again").await, Err(CoreError::Conflict(_)));
        assert_matches!(table.complete("r1", "/static/x.glb").await, Err(CoreError::Conflict(_)));
        assert_matches!(table.fail("r1", "other").await, Err(CoreError::Conflict(_)));

        let status = table.get("r1").await.unwrap();
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.message, "Failed to generate model: boom");
    }

    #[tokio::test]
    async fn queued_can_fail_but_not_complete() {
        let table = table();
        table.insert_queued("r1").await.unwrap();
        assert_matches!(table.complete("r1", "/static/x.glb").await, Err(CoreError::Conflict(_)));
        table.fail("r1", "service shutting down").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        assert_matches!(
            table().mark_processing("nope", "x").await,
            Err(CoreError::NotFound { entity: "Request", .. })
        );
    }

    #[tokio::test]
    async fn purge_drops_only_expired_terminal_records() {
        let table = StatusTable::new(RetentionPolicy {
            ttl: Duration::from_secs(60),
            capacity: 100,
        });
        for id in ["done", "running", "waiting"] {
            table.insert_queued(id).await.unwrap();
        }
        table.mark_processing("done", "x").await.unwrap();
        table.complete("done", "/static/a.glb").await.unwrap();
        table.mark_processing("running", "x").await.unwrap();

        let soon = chrono::Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(table.purge_expired_at(soon).await, 0);

        let later = chrono::Utc::now() + chrono::Duration::hours(1);
        assert_eq!(table.purge_expired_at(later).await, 1);
        assert!(table.get("done").await.is_none());
        assert!(table.get("running").await.is_some());
        assert!(table.get("waiting").await.is_some());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_terminal_records() {
        let table = StatusTable::new(RetentionPolicy {
            ttl: Duration::from_secs(3600),
            capacity: 2,
        });
        table.insert_queued("active").await.unwrap();
        for id in ["a", "b", "c"] {
            table.insert_queued(id).await.unwrap();
            table.fail(id, "Failed to generate model: x").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(table.get("a").await.is_none());
        assert!(table.get("b").await.is_some());
        assert!(table.get("c").await.is_some());
        assert!(table.get("active").await.is_some());
        assert_eq!(table.len().await, 3);
    }
}
