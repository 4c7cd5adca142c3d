//! Fault injection points, active with the `failpoints` feature.
//!
//! A fail point configured with `return(<kind>)` makes [`sync_fail_point`] fail with the
//! matching error, e.g. `fail::cfg(APPLY_BATCH, "1*return(connection)")`.

use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Evaluated before every batch is sent to the target.
pub const APPLY_BATCH: &str = "executor.apply_batch";

/// Evaluated before every detection page is read.
pub const DETECT_PAGE: &str = "detection.next_batch";

/// Evaluated after a batch was written to the target, before its ledger entries are appended.
pub const LEDGER_APPEND: &str = "executor.ledger_append";

pub fn sync_fail_point(name: &str) -> SyncResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("source_connection") => ErrorKind::SourceConnectionFailed,
            Some("connection") => ErrorKind::TargetConnectionFailed,
            Some("constraint") => ErrorKind::ConstraintViolation,
            Some("query") => ErrorKind::TargetQueryFailed,
            _ => ErrorKind::InvalidData,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
