use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::shared::ConflictStrategy;
use sync_engine::state::job::JobKind;
use sync_engine::types::{ConflictId, JobId};

/// Reconciles tables of a system of record with a target database.
#[derive(Debug, Parser)]
#[command(name = "syncer", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the service: recovers interrupted jobs and, when enabled, syncs on an interval
    /// until interrupted.
    Run,

    /// Creates a job and waits for it to finish.
    Sync {
        /// Tables to sync, defaults to `sync.tables`.
        tables: Vec<String>,
        #[arg(long, value_parser = parse_job_kind, default_value = "incremental")]
        kind: JobKind,
        /// Strategy applied to conflicts without operator input.
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<ConflictStrategy>,
        /// Keep the job running until every conflict is resolved.
        #[arg(long)]
        require_resolution: bool,
    },

    /// Resumes a stopped or failed job and waits for it.
    Resume { job_id: JobId },

    /// Deletes a job that is not running.
    Delete { job_id: JobId },

    /// Lists all jobs.
    List,

    /// Prints a job with its tables, conflicts, errors and audit trail.
    Show { job_id: JobId },

    /// Resolves one conflict.
    Resolve {
        job_id: JobId,
        conflict_id: ConflictId,
        #[arg(long, value_parser = parse_strategy)]
        strategy: ConflictStrategy,
        /// Replacement row as a JSON object, required by the manual strategy.
        #[arg(long)]
        value: Option<String>,
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Resolves every pending conflict of a job with one strategy.
    ResolveAll {
        job_id: JobId,
        #[arg(long, value_parser = parse_strategy)]
        strategy: ConflictStrategy,
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Compares source and target schemas of a job's tables.
    SchemaReport {
        job_id: JobId,
        #[arg(long)]
        table: Option<String>,
    },

    /// Reverts the writes a job made at or after a point in time.
    Rollback {
        job_id: JobId,
        /// RFC 3339 timestamp.
        #[arg(long)]
        since: DateTime<Utc>,
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Drops ledger entries older than the retention window.
    PurgeLedger,
}

fn parse_strategy(value: &str) -> Result<ConflictStrategy, String> {
    value.parse()
}

fn parse_job_kind(value: &str) -> Result<JobKind, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definitions_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_resolve_all() {
        let job_id = JobId::new();
        let cli = Cli::try_parse_from([
            "syncer",
            "resolve-all",
            &job_id.to_string(),
            "--strategy",
            "source-wins",
        ])
        .unwrap();

        match cli.command {
            Command::ResolveAll {
                job_id: parsed,
                strategy,
                actor,
            } => {
                assert_eq!(parsed, job_id);
                assert_eq!(strategy, ConflictStrategy::SourceWins);
                assert_eq!(actor, "operator");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sync_defaults_to_incremental() {
        let cli = Cli::try_parse_from(["syncer", "sync", "parcels"]).unwrap();

        match cli.command {
            Command::Sync { tables, kind, .. } => {
                assert_eq!(tables, vec!["parcels"]);
                assert_eq!(kind, JobKind::Incremental);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
