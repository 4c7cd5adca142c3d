use std::collections::HashSet;

use crate::detection::ChangeOperation;
use crate::state::conflict::{Conflict, ConflictKind};
use crate::state::ledger::SyncBaseline;
use crate::types::{JobId, PrimaryKey};

/// Verdict for a single detected change.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// The target did not diverge from the baseline, the change can be applied.
    Clean,
    /// Both sides already agree, only the baseline needs to be recorded.
    NoOp(SyncBaseline),
    /// Both sides changed independently.
    Conflict,
}

/// Classifies a change against the baseline of its row.
pub fn classify(operation: &ChangeOperation) -> Classification {
    let Some(baseline) = &operation.baseline else {
        return Classification::Clean;
    };

    let target = operation.target_fingerprint();
    if baseline.target.as_ref() == target {
        return Classification::Clean;
    }

    match (operation.source_fingerprint(), target) {
        (Some(source), Some(target)) if source == target => {
            Classification::NoOp(SyncBaseline::settled(source.clone()))
        }
        _ => Classification::Conflict,
    }
}

/// Builds the data conflict of a diverged change.
pub fn data_conflict(job_id: JobId, operation: &ChangeOperation) -> Conflict {
    let description = match (&operation.source, &operation.target) {
        (Some(_), Some(_)) => "source and target changed the row independently",
        (Some(_), None) => "target deleted a row that changed in the source",
        (None, Some(_)) => "source deleted a row that changed in the target",
        (None, None) => "row diverged",
    };

    let mut conflict = Conflict::new(
        job_id,
        &operation.table,
        Some(operation.key.clone()),
        ConflictKind::Data,
        description,
    );
    conflict.source_value = operation.source.as_ref().map(|state| state.image.clone());
    conflict.target_value = operation.target.as_ref().map(|state| state.image.clone());
    conflict.source_modified_at = operation.source.as_ref().and_then(|state| state.modified_at);
    conflict.target_modified_at = operation.target.as_ref().and_then(|state| state.modified_at);

    conflict
}

/// A detected batch split by verdict.
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    pub clean: Vec<ChangeOperation>,
    pub settled: Vec<(PrimaryKey, SyncBaseline)>,
    pub conflicts: Vec<Conflict>,
    /// Changes held back because their row already has a pending conflict.
    pub held: usize,
}

/// Classifies every change of a batch.
///
/// Changes of rows with a pending conflict are held back until that conflict is resolved, so a
/// row never has two pending conflicts.
pub fn classify_batch(
    job_id: JobId,
    operations: Vec<ChangeOperation>,
    pending_keys: &HashSet<PrimaryKey>,
) -> ClassifiedBatch {
    let mut batch = ClassifiedBatch::default();

    for operation in operations {
        if pending_keys.contains(&operation.key) {
            batch.held += 1;
            continue;
        }

        match classify(&operation) {
            Classification::Clean => batch.clean.push(operation),
            Classification::NoOp(baseline) => batch.settled.push((operation.key, baseline)),
            Classification::Conflict => batch.conflicts.push(data_conflict(job_id, &operation)),
        }
    }

    batch
}
