use clap::{Args, Parser, Subcommand};
use failover::{default_report_path, write_csv, FailoverTest, FatalError, ReportError};
use failover_core::{
    Backend, ConfigError, DatabaseConfig, PoolMode, TestConfig, TestReport,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_POOL_MAX, DEFAULT_POOL_MIN, DEFAULT_TPS, DEFAULT_WORKERS,
};
use failover_runtime::{Controller, FailoverRuntime, RuntimeError, DEFAULT_PORT};
use mock_db::MockDb;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(version, about = "Measure RTO and RPO of a database failover under write load")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP control surface.
    Serve {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[command(flatten)]
        test: TestArgs,
    },
    /// Run one test and print its report.
    Run {
        #[command(flatten)]
        test: TestArgs,

        /// Export the report as CSV, to the given path or a timestamped file.
        #[arg(long, num_args = 0..=1)]
        csv: Option<Option<PathBuf>>,
    },
}

#[derive(Args, Debug)]
struct TestArgs {
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: NonZeroUsize,

    /// Target writes per second across all workers.
    #[arg(short, long, default_value_t = DEFAULT_TPS)]
    tps: NonZeroU32,

    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5m")]
    duration: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    probe_interval: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "800ms")]
    probe_timeout: Duration,

    /// Consecutive failed probes before the database is considered down.
    #[arg(long, default_value_t = DEFAULT_FAILURE_THRESHOLD)]
    failure_threshold: usize,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "2m")]
    rto_sla: Duration,

    #[arg(long, default_value_t = DEFAULT_POOL_MIN)]
    pool_min: u32,

    #[arg(long, default_value_t = DEFAULT_POOL_MAX)]
    pool_max: u32,

    /// Connect through the pooled proxy port (PgBouncer) instead of the server port.
    #[arg(long)]
    pooled: bool,

    /// Run against an in-memory database instead of PostgreSQL.
    #[arg(long)]
    mock: bool,

    /// With `--mock`, when the simulated outage starts.
    #[arg(long, value_parser = humantime::parse_duration, requires = "mock")]
    mock_outage_at: Option<Duration>,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "8s")]
    mock_outage_for: Duration,
}

impl TestArgs {
    fn config(&self) -> Result<TestConfig, ConfigError> {
        let mut database = if self.mock {
            DatabaseConfig::default()
        } else {
            DatabaseConfig::from_env()?
        };
        if self.pooled {
            database.pool_mode = PoolMode::Pooled;
        }

        Ok(TestConfig::new(database)
            .workers(self.workers)
            .tps(self.tps)
            .duration(self.duration)
            .probe(self.probe_interval, self.probe_timeout)
            .failure_threshold(self.failure_threshold)
            .rto_sla(self.rto_sla)
            .pool(self.pool_min, self.pool_max))
    }

    fn mock_db(&self, config: &TestConfig) -> MockDb {
        let mut db = MockDb::new()
            .with_rows(1_000)
            .pool_size(config.pool_max as usize)
            .acquire_timeout(config.acquire_timeout)
            .write_latency(Duration::from_millis(2), Duration::from_millis(1));
        if let Some(at) = self.mock_outage_at {
            db = db.outage(at, self.mock_outage_for);
        }
        db
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[tokio::main]
async fn main() -> ExitCode {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("failover=info,failover_runtime=info,tower_http=debug")),
        )
        .init();

    let cli = Cli::parse();
    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Serve { port, test } => {
            let config = test.config()?;
            info!("Serving failover tests against {}", config.database);
            if test.mock {
                let db = Arc::new(test.mock_db(&config));
                let controller = Controller::new(config, Box::new(move |_| Ok(db.clone())));
                serve(port, controller).await
            } else {
                serve(port, Controller::new(config, postgres_factory()?)).await
            }
        }
        Command::Run { test, csv } => {
            let config = test.config()?;
            let csv = csv.map(|path| match path {
                Some(path) => Ok(path),
                None => default_report_path(OffsetDateTime::now_utc()),
            });
            let csv = csv.transpose()?;

            if test.mock {
                let db = Arc::new(test.mock_db(&config));
                run_once(db, config, csv).await
            } else {
                run_once(connect_postgres(&config)?, config, csv).await
            }
        }
    }
}

async fn serve<B: Backend>(port: u16, controller: Controller<B>) -> Result<(), CliError> {
    FailoverRuntime::new(Arc::new(controller))
        .port(port)
        .run()
        .await?;
    Ok(())
}

async fn run_once<B: Backend>(
    backend: Arc<B>,
    config: TestConfig,
    csv: Option<PathBuf>,
) -> Result<(), CliError> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the run early");
            on_signal.cancel();
        }
    });

    let report = FailoverTest::new(backend, config)
        .with_cancellation(cancel)
        .await?;
    println!("{report}");

    if let Some(path) = csv {
        export_report(&report, &path);
    }
    Ok(())
}

/// A failed export never fails a completed test; the report has already been printed.
fn export_report(report: &TestReport, path: &Path) -> bool {
    match write_csv(report, path) {
        Ok(()) => {
            info!("Report exported to {}", path.display());
            true
        }
        Err(err) => {
            error!("Failed to export results to {}: {err}", path.display());
            false
        }
    }
}

#[cfg(feature = "postgres")]
fn connect_postgres(config: &TestConfig) -> Result<Arc<failover::PgBackend>, ConfigError> {
    failover::PgBackend::connect(config).map(Arc::new)
}

#[cfg(feature = "postgres")]
fn postgres_factory() -> Result<failover_runtime::BackendFactory<failover::PgBackend>, ConfigError> {
    Ok(Box::new(connect_postgres))
}

#[cfg(not(feature = "postgres"))]
const NO_POSTGRES: &str = "built without PostgreSQL support, use --mock";

#[cfg(not(feature = "postgres"))]
fn connect_postgres(_config: &TestConfig) -> Result<Arc<MockDb>, ConfigError> {
    Err(ConfigError::Invalid(NO_POSTGRES.into()))
}

#[cfg(not(feature = "postgres"))]
fn postgres_factory() -> Result<failover_runtime::BackendFactory<MockDb>, ConfigError> {
    Err(ConfigError::Invalid(NO_POSTGRES.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_config() -> TestConfig {
        TestConfig::default()
            .workers(NonZeroUsize::new(1).unwrap())
            .tps(NonZeroU32::new(10).unwrap())
            .duration(Duration::from_millis(300))
            .probe(Duration::from_millis(100), Duration::from_millis(50))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn export_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        let report = FailoverTest::new(Arc::new(MockDb::new()), short_config())
            .await
            .unwrap();

        assert!(!export_report(&report, &path));
        assert!(!path.exists());

        let path = dir.path().join("out.csv");
        assert!(export_report(&report, &path));
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_with_unwritable_csv_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("missing").join("out.csv");

        let res = run_once(Arc::new(MockDb::new()), short_config(), Some(csv.clone())).await;
        assert!(res.is_ok());
        assert!(!csv.exists());
    }

    #[test]
    fn run_accepts_bare_csv_flag() {
        let cli = Cli::try_parse_from(["failover-runtime", "run", "--mock", "--csv"]).unwrap();
        assert!(matches!(cli.command, Command::Run { csv: Some(None), .. }));
    }
}
