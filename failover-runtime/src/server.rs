use crate::error::RuntimeError;
use crate::logs::DEFAULT_LOG_CAPACITY;
use crate::runtime::{Controller, StartRequest, StatusResponse};
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use failover_core::Backend;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};
use uuid::Uuid;

pub(crate) async fn server_task<B, S>(
    port: u16,
    controller: Arc<Controller<B>>,
    shutdown: S,
) -> Result<(), RuntimeError>
where
    B: Backend,
    S: Future<Output = ()> + Send + 'static,
{
    let app = router(controller);

    let socket_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;

    debug!("Axum server starting up on {socket_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// The control surface: `POST /start`, `GET /status`, `GET /logs`, `POST /stop`.
pub fn router<B: Backend>(controller: Arc<Controller<B>>) -> Router {
    Router::new()
        .route("/start", post(start::<B>))
        .route("/status", get(status::<B>))
        .route("/logs", get(logs::<B>))
        .route("/stop", post(stop::<B>))
        .with_state(controller)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Error, Debug)]
enum HandlerError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        use HandlerError::*;
        let status = match &self {
            Runtime(RuntimeError::AlreadyRunning(_)) | Runtime(RuntimeError::NotRunning) => {
                StatusCode::CONFLICT
            }
            Runtime(RuntimeError::Config(_)) => StatusCode::BAD_REQUEST,
            Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let Runtime(err) = self;
        (status, err.to_string()).into_response()
    }
}

#[instrument(skip_all)]
async fn start<B: Backend>(
    State(controller): State<Arc<Controller<B>>>,
    request: Option<Json<StartRequest>>,
) -> Result<(StatusCode, Json<RunAccepted>), HandlerError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let run_id = controller.start(&request)?;
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

async fn status<B: Backend>(
    State(controller): State<Arc<Controller<B>>>,
) -> Result<Json<StatusResponse>, HandlerError> {
    Ok(Json(controller.status()?))
}

async fn logs<B: Backend>(
    State(controller): State<Arc<Controller<B>>>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<String>> {
    Json(controller.logs(query.limit.unwrap_or(DEFAULT_LOG_CAPACITY)))
}

#[instrument(skip_all)]
async fn stop<B: Backend>(
    State(controller): State<Arc<Controller<B>>>,
) -> Result<Json<RunAccepted>, HandlerError> {
    let run_id = controller.stop()?;
    Ok(Json(RunAccepted { run_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use failover_core::TestConfig;
    use http_body_util::BodyExt;
    use mock_db::MockDb;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let db = Arc::new(MockDb::new());
        let base = TestConfig::default()
            .duration(Duration::from_secs(30))
            .probe(Duration::from_millis(100), Duration::from_millis(50));
        router(Arc::new(Controller::new(base, Box::new(move |_| Ok(db.clone())))))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_status() {
        let response = app()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["state"], "idle");
        assert!(status["run_id"].is_null());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_without_test_conflicts() {
        let response = app()
            .oneshot(Request::post("/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_override_is_a_bad_request() {
        let response = app()
            .oneshot(
                Request::post("/start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"failure_threshold": 0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
