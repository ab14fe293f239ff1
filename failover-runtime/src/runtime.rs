//! Failover test runtime.
//!
//! Owns at most one running test at a time and serves the HTTP control surface for it.
use crate::error::RuntimeError;
use crate::logs::{LogBuffer, DEFAULT_LOG_CAPACITY};
use crate::server::server_task;
use failover::{FailoverTest, FatalError};
use failover_core::{Backend, ConfigError, LiveStatus, TestConfig, TestReport};
use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
#[allow(unused)]
use tracing::{debug, error, info, instrument, Instrument};
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 7621;

/// Builds the backend for a run from its final configuration.
pub type BackendFactory<B> = Box<dyn Fn(&TestConfig) -> Result<Arc<B>, ConfigError> + Send + Sync>;

/// Per-run overrides of the runtime's base [`TestConfig`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub workers: Option<NonZeroUsize>,
    pub tps: Option<NonZeroU32>,
    pub duration_secs: Option<u64>,
    pub probe_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub failure_threshold: Option<usize>,
    pub pool_min: Option<u32>,
    pub pool_max: Option<u32>,
    pub rto_sla_secs: Option<u64>,
}

impl StartRequest {
    pub fn apply(&self, mut config: TestConfig) -> TestConfig {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(tps) = self.tps {
            config.target_tps = tps;
        }
        if let Some(secs) = self.duration_secs {
            config.duration = Duration::from_secs(secs);
        }
        if let Some(ms) = self.probe_interval_ms {
            config.probe_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(min) = self.pool_min {
            config.pool_min = min;
        }
        if let Some(max) = self.pool_max {
            config.pool_max = max;
        }
        if let Some(secs) = self.rto_sla_secs {
            config.rto_sla = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Finished,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: Phase,
    pub run_id: Option<Uuid>,
    pub live: Option<LiveStatus>,
    pub report: Option<TestReport>,
    pub error: Option<String>,
}

#[derive(Default)]
struct RunState {
    phase: Phase,
    run_id: Option<Uuid>,
    cancel: Option<CancellationToken>,
    status: Option<watch::Receiver<LiveStatus>>,
    report: Option<TestReport>,
    error: Option<String>,
}

/// Starts, stops and reports on failover tests. Shared by every HTTP handler.
pub struct Controller<B> {
    base: TestConfig,
    connect: BackendFactory<B>,
    run: Mutex<RunState>,
    logs: LogBuffer,
}

impl<B: Backend> Controller<B> {
    pub fn new(base: TestConfig, connect: BackendFactory<B>) -> Self {
        Self {
            base,
            connect,
            run: Mutex::new(RunState::default()),
            logs: LogBuffer::new(DEFAULT_LOG_CAPACITY),
        }
    }

    /// Spawns a test unless one is already running. Configuration errors are returned here;
    /// startup errors surface later through [`Controller::status`].
    pub fn start(self: &Arc<Self>, request: &StartRequest) -> Result<Uuid, RuntimeError> {
        let config = request.apply(self.base.clone());
        config.validate()?;

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(LiveStatus::default());

        {
            let mut run = self.run.lock()?;
            if let (Phase::Running, Some(current)) = (run.phase, run.run_id) {
                return Err(RuntimeError::AlreadyRunning(current));
            }
            let backend = (self.connect)(&config)?;
            *run = RunState {
                phase: Phase::Running,
                run_id: Some(run_id),
                cancel: Some(cancel.clone()),
                status: Some(status_rx.clone()),
                report: None,
                error: None,
            };

            let test = FailoverTest::new(backend, config.clone())
                .with_run_id(run_id)
                .with_cancellation(cancel)
                .with_status(status_tx);
            self.spawn_test(run_id, test, status_rx);
        }

        info!("Started test {run_id}");
        self.logs.push(format!("Started test {run_id}: {config}"));
        Ok(run_id)
    }

    fn spawn_test(
        self: &Arc<Self>,
        run_id: Uuid,
        test: FailoverTest<B>,
        mut status: watch::Receiver<LiveStatus>,
    ) {
        let this = self.clone();
        let forward = tokio::spawn(async move {
            // Ends once the test drops its status sender.
            while status.changed().await.is_ok() {
                let line = status.borrow_and_update().to_string();
                this.logs.push(line);
            }
        });

        let this = self.clone();
        tokio::spawn(
            async move {
                let result = test.await;
                if let Err(err) = forward.await {
                    error!("Status forwarder failed: {err}");
                }
                this.finish(run_id, result);
            }
            .in_current_span(),
        );
    }

    fn finish(&self, run_id: Uuid, result: Result<TestReport, FatalError>) {
        let mut run = self.run.lock().unwrap_or_else(|err| err.into_inner());
        if run.run_id != Some(run_id) {
            return;
        }
        run.cancel = None;
        match result {
            Ok(report) => {
                for line in report.to_string().lines() {
                    self.logs.push(line);
                }
                run.phase = Phase::Finished;
                run.report = Some(report);
            }
            Err(err) => {
                error!("Test {run_id} failed: {err}");
                self.logs.push(format!("Test {run_id} failed: {err}"));
                run.phase = Phase::Failed;
                run.error = Some(err.to_string());
            }
        }
    }

    /// Cancels the running test. Its report is still produced.
    pub fn stop(&self) -> Result<Uuid, RuntimeError> {
        let run = self.run.lock()?;
        match (run.phase, run.run_id, &run.cancel) {
            (Phase::Running, Some(run_id), Some(cancel)) => {
                cancel.cancel();
                self.logs.push(format!("Stop requested for test {run_id}"));
                Ok(run_id)
            }
            _ => Err(RuntimeError::NotRunning),
        }
    }

    pub fn status(&self) -> Result<StatusResponse, RuntimeError> {
        let run = self.run.lock()?;
        Ok(StatusResponse {
            state: run.phase,
            run_id: run.run_id,
            live: run.status.as_ref().map(|rx| rx.borrow().clone()),
            report: run.report.clone(),
            error: run.error.clone(),
        })
    }

    pub fn logs(&self, limit: usize) -> Vec<String> {
        self.logs.tail(limit)
    }
}

/// Serves the control surface for a [`Controller`].
///
/// # Example
///
/// ```ignore
/// let controller = Arc::new(Controller::new(config, Box::new(|_| Ok(backend.clone()))));
/// FailoverRuntime::new(controller).port(7621).run().await?;
/// ```
pub struct FailoverRuntime<B> {
    port: u16,
    controller: Arc<Controller<B>>,
}

impl<B: Backend> FailoverRuntime<B> {
    pub fn new(controller: Arc<Controller<B>>) -> Self {
        Self {
            port: DEFAULT_PORT,
            controller,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Serves until Ctrl-C, cancelling any running test on the way out.
    #[instrument(name = "failover_runtime", skip_all, fields(port = self.port))]
    pub async fn run(self) -> Result<(), RuntimeError> {
        let controller = self.controller.clone();
        let shutdown = async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {err}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
            let _ = controller.stop();
        };
        server_task(self.port, self.controller, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mock_db::MockDb;

    fn controller(db: Arc<MockDb>) -> Arc<Controller<MockDb>> {
        let base = TestConfig::default()
            .workers(NonZeroUsize::new(2).unwrap())
            .tps(NonZeroU32::new(20).unwrap())
            .duration(Duration::from_secs(1))
            .probe(Duration::from_millis(100), Duration::from_millis(50))
            .status_interval(Duration::from_millis(200));
        Arc::new(Controller::new(base, Box::new(move |_| Ok(db.clone()))))
    }

    #[test]
    fn overrides_apply_to_base() {
        let request = StartRequest {
            workers: NonZeroUsize::new(20),
            duration_secs: Some(60),
            failure_threshold: Some(3),
            ..Default::default()
        };
        let config = request.apply(TestConfig::default());
        assert_eq!(config.workers.get(), 20);
        assert_eq!(config.duration, Duration::from_secs(60));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.target_tps, TestConfig::default().target_tps);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_test_at_a_time() {
        let controller = controller(Arc::new(MockDb::new()));
        let first = controller.start(&StartRequest::default()).unwrap();

        let err = controller.start(&StartRequest::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRunning(id) if id == first));

        assert_eq!(controller.stop().unwrap(), first);
        for _ in 0..50 {
            if controller.status().unwrap().state == Phase::Finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let status = controller.status().unwrap();
        assert_eq!(status.state, Phase::Finished);
        assert!(status.report.unwrap().cancelled);
        assert!(controller.stop().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_overrides_are_rejected() {
        let controller = controller(Arc::new(MockDb::new()));
        let request = StartRequest {
            pool_min: Some(50),
            pool_max: Some(5),
            ..Default::default()
        };
        assert!(matches!(
            controller.start(&request),
            Err(RuntimeError::Config(_))
        ));
        assert_eq!(controller.status().unwrap().state, Phase::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_failure_is_reported() {
        let controller = controller(Arc::new(MockDb::new().unreachable()));
        controller.start(&StartRequest::default()).unwrap();
        for _ in 0..50 {
            if controller.status().unwrap().state != Phase::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let status = controller.status().unwrap();
        assert_eq!(status.state, Phase::Failed);
        assert!(status.error.unwrap().contains("unreachable"));
        assert!(controller.logs(10).iter().any(|l| l.contains("failed")));
    }
}
