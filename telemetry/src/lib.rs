//! Tracing setup shared by the `syncer` binary and the test suites.
//!
//! In development logs are pretty printed to stdout. In production they are written as
//! JSON lines to a daily rolling file under `logs/` through a non-blocking writer, whose
//! buffered lines are flushed when the returned [`LogFlusher`] is dropped.

use std::sync::Once;

use config::environment::Environment;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

const LOG_DIRECTORY: &str = "logs";

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to bridge `log` records into tracing: {0}")]
    LogBridge(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the global subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] std::io::Error),
}

/// Keeps the background log writer alive.
#[must_use = "dropping the flusher stops file logging"]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global subscriber for a binary named `app_name`.
///
/// The filter is read from `RUST_LOG` and falls back to `info`.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;
    init_tracing_for(app_name, environment)
}

fn init_tracing_for(app_name: &str, environment: Environment) -> Result<LogFlusher, TracingError> {
    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match environment {
        Environment::Dev => {
            let subscriber = tracing_subscriber::registry().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_writer(std::io::stdout),
            );
            tracing::subscriber::set_global_default(subscriber)?;

            Ok(LogFlusher { _guard: None })
        }
        Environment::Prod => {
            let appender = tracing_appender::rolling::daily(LOG_DIRECTORY, app_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let subscriber = tracing_subscriber::registry().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_writer(writer),
            );
            tracing::subscriber::set_global_default(subscriber)?;

            Ok(LogFlusher {
                _guard: Some(guard),
            })
        }
    }
}

/// Installs a test subscriber once per process.
///
/// Output is captured by the test harness and only shown for failing tests. Set
/// `ENABLE_TRACING=1` to see engine logs, filtered by `RUST_LOG`.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_err() {
            return;
        }

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
