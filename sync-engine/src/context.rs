use std::sync::Arc;

use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::state::audit::{AuditEvent, SyncErrorRecord};
use crate::state::job::{JobConfig, JobKind, SyncJob};
use crate::store::job::JobStore;
use crate::types::{JobId, PrimaryKey};

/// Name recorded as the actor of writes made by the engine itself.
pub const ENGINE_ACTOR: &str = "sync-engine";

/// The job a component works on together with the stores and databases it needs.
///
/// Every detector, executor and resolver call receives a context explicitly, there is no
/// process wide notion of a current job.
#[derive(Debug, Clone)]
pub struct JobContext<S, Src, T> {
    pub job_id: JobId,
    pub kind: JobKind,
    pub config: Arc<JobConfig>,
    pub store: S,
    pub source: Src,
    pub target: T,
}

impl<S, Src, T> JobContext<S, Src, T>
where
    S: JobStore,
{
    pub fn new(job: &SyncJob, store: S, source: Src, target: T) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            config: Arc::new(job.config.clone()),
            store,
            source,
            target,
        }
    }

    pub async fn audit(&self, event: AuditEvent) -> SyncResult<()> {
        self.store.insert_audit_event(event).await
    }

    /// Persists an error in the job's error list.
    pub async fn record_error(
        &self,
        table: Option<&str>,
        key: Option<PrimaryKey>,
        error: &SyncError,
    ) -> SyncResult<()> {
        warn!(
            job_id = %self.job_id,
            table = table.unwrap_or_default(),
            error = %error.summary(),
            "recording sync error"
        );

        self.store
            .insert_error(SyncErrorRecord::new(self.job_id, table, key, error))
            .await
    }
}
