//! Periodic creation of incremental jobs.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::concurrency::shutdown::ShutdownRx;
use crate::connector::{Connector, Target};
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::state::job::{JobKind, JobStatus};
use crate::store::job::JobStore;
use crate::store::ledger::LedgerStore;
use crate::types::JobId;

/// Creates an incremental job over a fixed set of tables on every interval tick.
///
/// A tick is skipped while the job of the previous tick is still running.
#[derive(Debug)]
pub struct AutoSyncScheduler<S, Src, T> {
    engine: SyncEngine<S, Src, T>,
    interval: Duration,
    tables: Vec<String>,
    last_job: Option<JobId>,
}

impl<S, Src, T> AutoSyncScheduler<S, Src, T>
where
    S: JobStore + LedgerStore + Clone + Send + Sync + 'static,
    Src: Connector + Clone + Send + Sync + 'static,
    T: Target + Clone + Send + Sync + 'static,
{
    pub fn new(engine: SyncEngine<S, Src, T>, interval: Duration, tables: Vec<String>) -> Self {
        Self {
            engine,
            interval,
            tables,
            last_job: None,
        }
    }

    /// Creates a job unless the previous one is still running. Returns the created job.
    pub async fn tick(&mut self) -> SyncResult<Option<JobId>> {
        if let Some(job_id) = self.last_job {
            let busy = self.engine.is_running(job_id).await
                || self.engine.get_job(job_id).await?.job.status == JobStatus::Running;
            if busy {
                debug!(%job_id, "previous automatic job is still running, skipping tick");
                return Ok(None);
            }
        }

        let job = self
            .engine
            .create_job(
                JobKind::Incremental,
                self.tables.clone(),
                self.engine.default_job_config(),
            )
            .await?;

        info!(job_id = %job.id, "created automatic job");
        self.last_job = Some(job.id);

        Ok(Some(job.id))
    }

    /// Ticks until the shutdown signal is received.
    pub async fn run(mut self, mut shutdown_rx: ShutdownRx) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            tables = self.tables.len(),
            "starting automatic sync scheduler"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait() => {
                    info!("stopping automatic sync scheduler");
                    return;
                }

                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "automatic job could not be created");
                    }
                }
            }
        }
    }
}
