mod utils;

use failover::prelude::*;
use failover_core::{RpoMeasurement, RtoMeasurement};
use mock_db::MockDb;
use ntest::timeout;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

fn config(workers: usize, tps: u32, duration: Duration) -> TestConfig {
    TestConfig::default()
        .workers(NonZeroUsize::new(workers).unwrap())
        .tps(NonZeroU32::new(tps).unwrap())
        .duration(duration)
}

fn assert_counts_consistent(report: &TestReport) {
    let m = &report.metrics;
    assert_eq!(
        m.total_attempts,
        m.successes + m.connection_errors + m.timeouts + m.query_errors
    );
}

/// Steady load against a healthy database.
#[tokio::test(flavor = "multi_thread")]
#[timeout(10_000)]
async fn baseline_without_outage() {
    utils::init();

    let db = Arc::new(MockDb::new().with_rows(100));
    let report = FailoverTest::new(db.clone(), config(1, 10, Duration::from_secs(3)))
        .await
        .unwrap();

    assert_counts_consistent(&report);
    assert!(
        (25..=34).contains(&report.metrics.total_attempts),
        "{} attempts",
        report.metrics.total_attempts
    );
    assert_eq!(report.metrics.failures(), 0);
    assert_eq!(report.rto, RtoMeasurement::NotObserved);
    assert_eq!(report.sla_met, None);
    assert!(!report.failover_detected());
    assert_eq!(report.rpo.lost_writes(), Some(0));
}

/// Outage in the middle of the run: failures are observed and the RTO brackets the outage.
#[tokio::test(flavor = "multi_thread")]
#[timeout(15_000)]
async fn outage_is_measured() {
    utils::init();

    let db = Arc::new(
        MockDb::new()
            .pool_size(10)
            .outage(Duration::from_secs(2), Duration::from_secs(2)),
    );
    let config = config(10, 100, Duration::from_secs(6))
        .probe(Duration::from_millis(200), Duration::from_millis(150));
    let report = FailoverTest::new(db.clone(), config).await.unwrap();

    assert_counts_consistent(&report);
    assert!(report.metrics.failures() > 0);
    assert!(report.metrics.successes > 0);
    assert!(report.probe_failures > 0);

    let rto = report.rto.rto().expect("recovery observed");
    assert!(
        rto >= Duration::from_millis(1_500) && rto <= Duration::from_secs(3),
        "rto {rto:?}"
    );
    assert_eq!(report.sla_met, Some(true));
    assert!(report.write_outage.is_some());
    assert_eq!(report.rpo.lost_writes(), Some(0));
}

/// Far more workers than pooled connections: acquisition waits are bounded and nothing hangs.
#[tokio::test(flavor = "multi_thread")]
#[timeout(15_000)]
async fn pool_exhaustion_is_bounded() {
    utils::init();

    let acquire_timeout = Duration::from_millis(500);
    let db = Arc::new(
        MockDb::new()
            .pool_size(5)
            .acquire_timeout(acquire_timeout)
            .write_latency(Duration::from_millis(20), Duration::ZERO),
    );
    let config = config(50, 500, Duration::from_secs(3))
        .pool(1, 5)
        .acquire_timeout(acquire_timeout);
    let report = FailoverTest::new(db.clone(), config).await.unwrap();

    assert_counts_consistent(&report);
    assert!(report.metrics.successes > 0);
    assert!(db.max_in_use() <= 5);
    assert!(
        report.metrics.latency.max <= acquire_timeout + Duration::from_millis(500),
        "max latency {:?}",
        report.metrics.latency.max
    );
}

/// Every acknowledged write is retained.
#[tokio::test(flavor = "multi_thread")]
#[timeout(10_000)]
async fn no_data_loss() {
    utils::init();

    let db = Arc::new(MockDb::new().with_rows(1_000));
    let report = FailoverTest::new(db.clone(), config(5, 100, Duration::from_secs(2)))
        .await
        .unwrap();

    match &report.rpo {
        RpoMeasurement::Measured {
            baseline,
            final_snapshot,
            reported_successes,
            lost,
            surplus,
        } => {
            assert_eq!(baseline.count, 1_000);
            assert_eq!(final_snapshot.count, 1_000 + report.metrics.successes);
            assert_eq!(*reported_successes, report.metrics.successes);
            assert_eq!(*lost, 0);
            assert_eq!(*surplus, 0);
        }
        other => panic!("RPO not measured: {other:?}"),
    }
    assert_eq!(report.rpo.data_lost(), Some(false));
    assert_eq!(db.rows(), 1_000 + db.inserts());
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(15_000)]
async fn lost_writes_are_reported() {
    utils::init();

    let db = Arc::new(
        MockDb::new()
            .with_rows(1_000)
            .outage(Duration::from_secs(1), Duration::from_secs(1))
            .lose_writes(25),
    );
    let config = config(5, 100, Duration::from_secs(4))
        .probe(Duration::from_millis(200), Duration::from_millis(150));
    let report = FailoverTest::new(db.clone(), config).await.unwrap();

    assert_eq!(report.rpo.lost_writes(), Some(25));
    assert_eq!(report.rpo.data_lost(), Some(true));
    assert!(report.rpo.to_string().starts_with("25 lost writes"));
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(5_000)]
async fn unreachable_database_is_fatal() {
    utils::init();

    let db = Arc::new(MockDb::new().unreachable());
    let err = FailoverTest::new(db.clone(), config(2, 10, Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert!(matches!(err, FatalError::Startup(_)));
    assert_eq!(db.inserts(), 0);
}

#[cfg(feature = "integration")]
mod full_length {
    use super::*;

    /// Scenario A: one worker at 10 TPS for 30 seconds.
    #[tokio::test(flavor = "multi_thread")]
    #[timeout(45_000)]
    async fn baseline_thirty_seconds() {
        utils::init();

        let db = Arc::new(MockDb::new());
        let report = FailoverTest::new(db, config(1, 10, Duration::from_secs(30)))
            .await
            .unwrap();

        assert!(
            (270..=330).contains(&report.metrics.total_attempts),
            "{} attempts",
            report.metrics.total_attempts
        );
        assert_eq!(report.metrics.failures(), 0);
        assert_eq!(report.rto, RtoMeasurement::NotObserved);
    }

    /// Scenario B: 20 workers at 200 TPS, an 8 second outage starting at 20 seconds.
    #[tokio::test(flavor = "multi_thread")]
    #[timeout(90_000)]
    async fn eight_second_outage() {
        utils::init();

        let db = Arc::new(
            MockDb::new()
                .pool_size(20)
                .outage(Duration::from_secs(20), Duration::from_secs(8)),
        );
        let report = FailoverTest::new(db, config(20, 200, Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(report.metrics.failures() > 0);
        let rto = report.rto.rto().expect("recovery observed");
        assert!(
            rto >= Duration::from_secs(6) && rto <= Duration::from_secs(15),
            "rto {rto:?}"
        );
        assert_eq!(report.sla_met, Some(true));
    }
}
