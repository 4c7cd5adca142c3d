//! Paged discovery of the differences between a source and a target table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::connector::{Connector, ModifiedFilter, PageRequest};
use crate::error::SyncResult;
use crate::failpoints::{DETECT_PAGE, sync_fail_point};
use crate::state::ledger::{ChangeKind, SyncBaseline};
use crate::store::ledger::LedgerStore;
use crate::types::{Fingerprint, PrimaryKey, RowImage, TableRow, project};

/// One side of a row as seen by detection.
#[derive(Debug, Clone, PartialEq)]
pub struct RowState {
    pub image: RowImage,
    pub fingerprint: Fingerprint,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A difference between source and target that may need a write.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeOperation {
    pub table: String,
    pub key: PrimaryKey,
    pub kind: ChangeKind,
    pub source: Option<RowState>,
    pub target: Option<RowState>,
    pub baseline: Option<SyncBaseline>,
}

impl ChangeOperation {
    pub fn source_fingerprint(&self) -> Option<&Fingerprint> {
        self.source.as_ref().map(|state| &state.fingerprint)
    }

    pub fn target_fingerprint(&self) -> Option<&Fingerprint> {
        self.target.as_ref().map(|state| &state.fingerprint)
    }
}

/// Output of one detection step.
#[derive(Debug, Default)]
pub struct DetectedBatch {
    pub operations: Vec<ChangeOperation>,
    /// Identical rows whose baseline must be recorded or refreshed.
    pub settled: Vec<(PrimaryKey, SyncBaseline)>,
    /// Number of rows read in this step.
    pub scanned: usize,
}

/// Settings of a detection run over one table.
#[derive(Debug, Clone)]
pub struct DetectionOptions {
    pub table: String,
    /// Non-key columns compared between the two sides.
    pub value_columns: Vec<String>,
    pub modified_column: Option<String>,
    pub batch_size: usize,
    /// Restricts the source scan to rows modified after the filter.
    pub modified_filter: Option<ModifiedFilter>,
    pub detect_deletes: bool,
}

#[derive(Debug, Clone)]
enum Phase {
    Source { after: Option<PrimaryKey> },
    Target { after: Option<PrimaryKey> },
    Done,
}

/// Restartable cursor over the differences of a table.
///
/// The source is scanned first to find inserts and updates, then the target to find rows whose
/// source counterpart disappeared. Only one page per side is held in memory.
#[derive(Debug)]
pub struct ChangeDetector<'a, Src, T, L> {
    options: DetectionOptions,
    source: &'a Src,
    target: &'a T,
    ledger: &'a L,
    phase: Phase,
}

impl<'a, Src, T, L> ChangeDetector<'a, Src, T, L>
where
    Src: Connector,
    T: Connector,
    L: LedgerStore,
{
    pub fn new(options: DetectionOptions, source: &'a Src, target: &'a T, ledger: &'a L) -> Self {
        Self {
            options,
            source,
            target,
            ledger,
            phase: Phase::Source { after: None },
        }
    }

    /// Returns the next batch or `None` when both sides are exhausted.
    ///
    /// A failed step leaves the cursor in place so calling again retries the same page.
    pub async fn next_batch(&mut self) -> SyncResult<Option<DetectedBatch>> {
        sync_fail_point(DETECT_PAGE)?;

        match self.phase.clone() {
            Phase::Source { after } => {
                let (batch, next_after) = self.scan_source(after).await?;
                self.phase = match next_after {
                    Some(after) => Phase::Source { after: Some(after) },
                    None if self.options.detect_deletes => Phase::Target { after: None },
                    None => Phase::Done,
                };

                Ok(Some(batch))
            }
            Phase::Target { after } => {
                let (batch, next_after) = self.scan_target(after).await?;
                self.phase = match next_after {
                    Some(after) => Phase::Target { after: Some(after) },
                    None => Phase::Done,
                };

                Ok(Some(batch))
            }
            Phase::Done => Ok(None),
        }
    }

    fn row_state(&self, row: &TableRow) -> RowState {
        let image = project(&row.values, &self.options.value_columns);
        let modified_column = self.options.modified_column.as_deref();
        let fingerprint = Fingerprint::of(&image, modified_column);
        let modified_at = modified_column
            .and_then(|column| image.get(column))
            .and_then(|value| value.as_timestamp());

        RowState {
            image,
            fingerprint,
            modified_at,
        }
    }

    /// Returns the key to continue after, `None` for the last page.
    fn continuation(&self, rows: &[TableRow]) -> Option<PrimaryKey> {
        if rows.len() < self.options.batch_size {
            return None;
        }

        rows.last().map(|row| row.key.clone())
    }

    async fn scan_source(
        &self,
        after: Option<PrimaryKey>,
    ) -> SyncResult<(DetectedBatch, Option<PrimaryKey>)> {
        let table = &self.options.table;
        let rows = self
            .source
            .read_page(
                table,
                PageRequest {
                    after,
                    limit: self.options.batch_size,
                    modified: self.options.modified_filter.clone(),
                },
            )
            .await?;
        let next_after = self.continuation(&rows);

        let keys: Vec<PrimaryKey> = rows.iter().map(|row| row.key.clone()).collect();
        let targets: HashMap<PrimaryKey, TableRow> = self
            .target
            .fetch_rows(table, &keys)
            .await?
            .into_iter()
            .map(|row| (row.key.clone(), row))
            .collect();
        let mut baselines = self.ledger.get_baselines(table, &keys).await?;

        let mut batch = DetectedBatch {
            scanned: rows.len(),
            ..DetectedBatch::default()
        };

        for row in &rows {
            let source = self.row_state(row);
            let target = targets.get(&row.key).map(|row| self.row_state(row));
            let baseline = baselines.remove(&row.key);

            let target_fingerprint = target.as_ref().map(|state| &state.fingerprint);
            if let Some(baseline) = &baseline {
                let unchanged = baseline.source.as_ref() == Some(&source.fingerprint)
                    && baseline.target.as_ref() == target_fingerprint;
                if unchanged {
                    continue;
                }
            }

            let kind = match target_fingerprint {
                None => ChangeKind::Insert,
                Some(fingerprint) if *fingerprint == source.fingerprint => {
                    batch.settled.push((
                        row.key.clone(),
                        SyncBaseline::settled(source.fingerprint.clone()),
                    ));
                    continue;
                }
                Some(_) => ChangeKind::Update,
            };

            batch.operations.push(ChangeOperation {
                table: table.clone(),
                key: row.key.clone(),
                kind,
                source: Some(source),
                target,
                baseline,
            });
        }

        debug!(
            table,
            scanned = batch.scanned,
            operations = batch.operations.len(),
            "scanned source page"
        );

        Ok((batch, next_after))
    }

    async fn scan_target(
        &self,
        after: Option<PrimaryKey>,
    ) -> SyncResult<(DetectedBatch, Option<PrimaryKey>)> {
        let table = &self.options.table;
        let rows = self
            .target
            .read_page(
                table,
                PageRequest {
                    after,
                    limit: self.options.batch_size,
                    modified: None,
                },
            )
            .await?;
        let next_after = self.continuation(&rows);

        let keys: Vec<PrimaryKey> = rows.iter().map(|row| row.key.clone()).collect();
        let present: Vec<PrimaryKey> = self
            .source
            .fetch_rows(table, &keys)
            .await?
            .into_iter()
            .map(|row| row.key)
            .collect();
        let orphans: Vec<&TableRow> = rows
            .iter()
            .filter(|row| !present.contains(&row.key))
            .collect();
        let orphan_keys: Vec<PrimaryKey> = orphans.iter().map(|row| row.key.clone()).collect();
        let mut baselines = self.ledger.get_baselines(table, &orphan_keys).await?;

        let mut batch = DetectedBatch {
            scanned: rows.len(),
            ..DetectedBatch::default()
        };

        for row in orphans {
            // Rows the engine never wrote belong to the target alone.
            let Some(baseline) = baselines.remove(&row.key) else {
                continue;
            };

            let target = self.row_state(row);
            if baseline.source.is_none() && baseline.target.as_ref() == Some(&target.fingerprint) {
                continue;
            }

            batch.operations.push(ChangeOperation {
                table: table.clone(),
                key: row.key.clone(),
                kind: ChangeKind::Delete,
                source: None,
                target: Some(target),
                baseline: Some(baseline),
            });
        }

        debug!(
            table,
            scanned = batch.scanned,
            operations = batch.operations.len(),
            "scanned target page"
        );

        Ok((batch, next_after))
    }
}
