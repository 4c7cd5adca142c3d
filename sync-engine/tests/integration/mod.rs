mod conflicts_test;
mod control_test;
mod incremental_test;
mod rollback_test;
mod sync_test;
