use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::state::ledger::{LedgerEntry, SyncBaseline};
use crate::types::{JobId, PrimaryKey};

/// Trait for the append-only change ledger and the per row baselines it maintains.
pub trait LedgerStore {
    /// Appends entries in order and applies the baseline of each entry in the same atomic step.
    ///
    /// Returns the entries with their assigned sequences.
    fn append_entries(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> impl Future<Output = SyncResult<Vec<LedgerEntry>>> + Send;

    /// Returns the entries of a job in append order.
    fn entries_for_job(
        &self,
        job_id: JobId,
    ) -> impl Future<Output = SyncResult<Vec<LedgerEntry>>> + Send;

    /// Deletes entries applied before `cutoff`. Returns the number of deleted entries per job.
    fn purge_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = SyncResult<BTreeMap<JobId, u64>>> + Send;

    /// Returns the newest cutoff passed to [`LedgerStore::purge_before`].
    fn purged_before(&self) -> impl Future<Output = SyncResult<Option<DateTime<Utc>>>> + Send;

    /// Returns the baselines of the given keys that have one.
    fn get_baselines(
        &self,
        table: &str,
        keys: &[PrimaryKey],
    ) -> impl Future<Output = SyncResult<HashMap<PrimaryKey, SyncBaseline>>> + Send;

    /// Records baselines of rows that were reconciled without a write.
    fn put_baselines(
        &self,
        table: &str,
        baselines: Vec<(PrimaryKey, SyncBaseline)>,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
