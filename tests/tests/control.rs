mod utils;

use failover_core::TestConfig;
use failover_runtime::{Phase, RunAccepted, StatusResponse};
use mock_db::MockDb;
use ntest::timeout;
use reqwest::StatusCode;
use serde_json::json;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

fn base_config() -> TestConfig {
    TestConfig::default()
        .workers(NonZeroUsize::new(2).unwrap())
        .tps(NonZeroU32::new(20).unwrap())
        .duration(Duration::from_secs(30))
        .probe(Duration::from_millis(100), Duration::from_millis(50))
        .status_interval(Duration::from_millis(200))
}

async fn wait_for_finish(client: &reqwest::Client, url: &str) -> anyhow::Result<StatusResponse> {
    loop {
        let status: StatusResponse = client.get(url).send().await?.json().await?;
        if status.state != Phase::Running {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(15_000)]
async fn start_status_logs_stop() {
    utils::init();

    let addr = utils::spawn_server(base_config(), Arc::new(MockDb::new()))
        .await
        .unwrap();
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/start"))
        .json(&json!({ "duration_secs": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: RunAccepted = res.json().await.unwrap();

    let res = client.post(format!("{base}/start")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let status: StatusResponse = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.state, Phase::Running);
    assert_eq!(status.run_id, Some(accepted.run_id));

    let status = wait_for_finish(&client, &format!("{base}/status")).await.unwrap();
    assert_eq!(status.state, Phase::Finished);
    let report = status.report.expect("report after finish");
    assert_eq!(report.run_id, accepted.run_id);
    assert!(!report.cancelled);
    assert!(report.metrics.successes > 0);

    let logs: Vec<String> = client
        .get(format!("{base}/logs?limit=5"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!logs.is_empty() && logs.len() <= 5);

    let res = client.post(format!("{base}/stop")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(15_000)]
async fn stop_cancels_the_running_test() {
    utils::init();

    let addr = utils::spawn_server(base_config(), Arc::new(MockDb::new()))
        .await
        .unwrap();
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    let res = client.post(format!("{base}/start")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let res = client.post(format!("{base}/stop")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let status = wait_for_finish(&client, &format!("{base}/status")).await.unwrap();
    assert_eq!(status.state, Phase::Finished);
    assert!(status.report.expect("report after stop").cancelled);

    let logs: Vec<String> = client
        .get(format!("{base}/logs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs.iter().any(|line| line.contains("Stop requested")));
}

#[tokio::test(flavor = "multi_thread")]
#[timeout(10_000)]
async fn unreachable_database_fails_the_run() {
    utils::init();

    let addr = utils::spawn_server(base_config(), Arc::new(MockDb::new().unreachable()))
        .await
        .unwrap();
    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    let res = client.post(format!("{base}/start")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let status = wait_for_finish(&client, &format!("{base}/status")).await.unwrap();
    assert_eq!(status.state, Phase::Failed);
    assert!(status.report.is_none());
    assert!(status.error.unwrap_or_default().contains("unreachable"));
}
