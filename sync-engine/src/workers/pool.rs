use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, SyncResult};
use crate::sync_error;

/// Internal state of [`TableWorkerPool`].
#[derive(Debug)]
pub struct TableWorkerPoolInner {
    /// Running workers by table name.
    active: HashMap<String, AbortHandle>,
    join_set: JoinSet<(String, SyncResult<()>)>,
}

impl TableWorkerPoolInner {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            join_set: JoinSet::new(),
        }
    }

    /// Spawns the worker of a table unless one is still running for it.
    pub fn spawn<F>(&mut self, table: String, future: F)
    where
        F: Future<Output = SyncResult<()>> + Send + 'static,
    {
        if let Entry::Occupied(entry) = self.active.entry(table.clone()) {
            if !entry.get().is_finished() {
                warn!(%table, "worker is still running, not spawning another one");
                return;
            }

            entry.remove();
        }

        let worker_table = table.clone();
        let abort_handle = self.join_set.spawn(async move {
            let result = future.await;
            (worker_table, result)
        });
        self.active.insert(table.clone(), abort_handle);

        debug!(%table, "spawned table worker");
    }

    pub fn has_active_worker(&self, table: &str) -> bool {
        self.active
            .get(table)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.active
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

/// Runs the table workers of a job run.
///
/// Workers persist the outcome of their table themselves, errors surfacing from
/// [`TableWorkerPool::wait_all`] are the ones a worker could not record, such as an
/// unreachable state store or a panic.
#[derive(Debug, Clone)]
pub struct TableWorkerPool {
    inner: Arc<Mutex<TableWorkerPoolInner>>,
}

impl TableWorkerPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableWorkerPoolInner::new())),
        }
    }

    /// Waits until every spawned worker finished and aggregates their errors.
    pub async fn wait_all(&self) -> SyncResult<()> {
        let mut errors = Vec::new();

        loop {
            let result = {
                let mut inner = self.inner.lock().await;
                inner.join_set.join_next().await
            };

            let Some(result) = result else {
                break;
            };

            match result {
                Ok((table, worker_result)) => {
                    let mut inner = self.inner.lock().await;
                    inner.active.remove(&table);

                    if let Err(err) = worker_result {
                        error!(%table, error = %err, "table worker completed with error");
                        errors.push(err);
                    }
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!("table worker was cancelled");
                    } else {
                        errors.push(sync_error!(
                            ErrorKind::TableSyncWorkerPanic,
                            "Table worker panicked",
                            join_err
                        ));
                    }
                }
            }
        }

        self.inner.lock().await.active.clear();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

impl Default for TableWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TableWorkerPool {
    type Target = Mutex<TableWorkerPoolInner>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
