use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use migrator_core::Pattern;
use migrator_engine::{
    FixerConsumer, OutboxSource, Scheduler, SchedulerStatus, SqliteOutbox, INCR_STARTED_MSG,
};
use migrator_store_sqlite::{DoubleWritePool, SqlitePool};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod config;
mod interactive;
mod logging;
mod metrics;

use config::ServiceConfig;
use crate::metrics::ResultCode;
use interactive::Interactive;
use logging::LogFormat;

const OK_MSG: &str = "OK";
const SYSTEM_ERROR_CODE: i32 = 5;
const SYSTEM_ERROR_MSG: &str = "系统异常";

type InteractiveScheduler = Scheduler<Interactive, SqlitePool>;

#[derive(Clone)]
struct ServiceState {
    scheduler: Arc<InteractiveScheduler>,
    /// Demo writes go through the same pool the scheduler switches.
    pool: Arc<DoubleWritePool<SqlitePool>>,
}

#[derive(Debug, Clone, Serialize)]
struct ControlResult<T>
where
    T: Serialize,
{
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl ControlResult<()> {
    fn ok() -> Self {
        Self::msg(OK_MSG)
    }

    fn msg(msg: &str) -> Self {
        Self { code: 0, msg: msg.to_string(), data: None }
    }
}

impl<T: Serialize> ControlResult<T> {
    fn data(data: T) -> Self {
        Self { code: 0, msg: OK_MSG.to_string(), data: Some(data) }
    }
}

impl<T: Serialize> IntoResponse for ControlResult<T> {
    fn into_response(self) -> Response {
        let code = ResultCode(self.code);
        let mut response = Json(self).into_response();
        response.extensions_mut().insert(code);
        response
    }
}

/// Any failure behind a control endpoint. The cause is logged, the caller sees a generic result.
#[derive(Debug)]
struct ServiceError(anyhow::Error);

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::error!(error = format!("{:#}", self.0), "control request failed");
        let body = ControlResult::<()> {
            code: SYSTEM_ERROR_CODE,
            msg: SYSTEM_ERROR_MSG.to_string(),
            data: None,
        };
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct IncrStartRequest {
    update_time: i64,
    /// Poll interval in milliseconds; zero or negative scans once.
    interval: i64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "migrator-service")]
#[command(about = "Control API for a live dual-write table migration")]
struct Args {
    /// YAML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long)]
    src_db: Option<PathBuf>,
    #[arg(long)]
    dst_db: Option<PathBuf>,
    #[arg(long)]
    outbox_db: Option<PathBuf>,
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn into_config(self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_path(path)?,
            None => ServiceConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(src_db) = self.src_db {
            config.src_db = src_db;
        }
        if let Some(dst_db) = self.dst_db {
            config.dst_db = dst_db;
        }
        if let Some(outbox_db) = self.outbox_db {
            config.outbox_db = outbox_db;
        }
        if let Some(log_format) = self.log_format {
            config.log_format = log_format;
        }
        Ok(config)
    }
}

struct Runtime {
    state: ServiceState,
    src: Arc<SqlitePool>,
    dst: Arc<SqlitePool>,
    events: OutboxSource,
}

fn build(config: &ServiceConfig) -> Result<Runtime> {
    let src = Arc::new(
        SqlitePool::open(&config.src_db)
            .with_context(|| format!("failed to open source db {}", config.src_db.display()))?,
    );
    let dst = Arc::new(
        SqlitePool::open(&config.dst_db)
            .with_context(|| format!("failed to open destination db {}", config.dst_db.display()))?,
    );
    interactive::ensure_schema(&*src)?;
    interactive::ensure_schema(&*dst)?;

    let outbox = SqliteOutbox::open(
        Arc::new(SqlitePool::open(&config.outbox_db)?),
        config.migrator.topic.clone(),
    )?;
    let events = outbox.source(config.migrator.outbox.poll_interval());

    let pool = Arc::new(DoubleWritePool::new(Arc::clone(&src), Arc::clone(&dst)));
    let scheduler = Scheduler::new(
        Arc::clone(&src),
        Arc::clone(&dst),
        Arc::clone(&pool),
        Arc::new(outbox),
        config.migrator.clone(),
    )?;

    let state = ServiceState { scheduler: Arc::new(scheduler), pool };
    Ok(Runtime { state, src, dst, events })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/src_only", post(src_only))
        .route("/src_first", post(src_first))
        .route("/dst_first", post(dst_first))
        .route("/dst_only", post(dst_only))
        .route("/full/start", post(full_start))
        .route("/full/stop", post(full_stop))
        .route("/incr/start", post(incr_start))
        .route("/incr/stop", post(incr_stop))
        .route("/interactive/:biz/:biz_id", get(interactive_show))
        .route("/interactive/:biz/:biz_id/read", post(interactive_read))
        .route_layer(axum::middleware::from_fn(metrics::control_metrics))
        .route("/metrics", get(metrics::serve_metrics))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    logging::init(config.log_format)?;
    metrics::init_metrics();

    let Runtime { state, src, dst, events } = build(&config)?;
    let cancel = CancellationToken::new();
    let consumer = FixerConsumer::<Interactive, SqlitePool, _>::new(
        src,
        dst,
        events,
        config.migrator.fixer.clone(),
    )?;
    let consumer = tokio::spawn(consumer.run(cancel.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let pattern = state.scheduler.pattern()?;
    tracing::info!(bind = %config.bind, pattern = %pattern, "migrator listening");

    let scheduler = Arc::clone(&state.scheduler);
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;

    cancel.cancel();
    scheduler.stop_full_validation();
    scheduler.stop_incremental_validation();
    let stats = consumer.await.context("fixer consumer panicked")??;
    tracing::info!(
        upserted = stats.upserted,
        deleted = stats.deleted,
        retried = stats.retried,
        "migrator stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn status(
    State(state): State<ServiceState>,
) -> Result<ControlResult<SchedulerStatus>, ServiceError> {
    Ok(ControlResult::data(state.scheduler.status()?))
}

fn switch(state: &ServiceState, pattern: Pattern) -> ControlResult<()> {
    state.scheduler.set_pattern(pattern);
    ControlResult::ok()
}

async fn src_only(State(state): State<ServiceState>) -> ControlResult<()> {
    switch(&state, Pattern::SrcOnly)
}

async fn src_first(State(state): State<ServiceState>) -> ControlResult<()> {
    switch(&state, Pattern::SrcFirst)
}

async fn dst_first(State(state): State<ServiceState>) -> ControlResult<()> {
    switch(&state, Pattern::DstFirst)
}

async fn dst_only(State(state): State<ServiceState>) -> ControlResult<()> {
    switch(&state, Pattern::DstOnly)
}

async fn full_start(
    State(state): State<ServiceState>,
) -> Result<ControlResult<()>, ServiceError> {
    state.scheduler.start_full_validation()?;
    Ok(ControlResult::ok())
}

async fn full_stop(State(state): State<ServiceState>) -> ControlResult<()> {
    state.scheduler.stop_full_validation();
    ControlResult::ok()
}

async fn incr_start(
    State(state): State<ServiceState>,
    Json(request): Json<IncrStartRequest>,
) -> Result<ControlResult<()>, ServiceError> {
    state.scheduler.start_incremental_validation(request.update_time, request.interval)?;
    Ok(ControlResult::msg(INCR_STARTED_MSG))
}

async fn incr_stop(State(state): State<ServiceState>) -> ControlResult<()> {
    state.scheduler.stop_incremental_validation();
    ControlResult::ok()
}

async fn interactive_read(
    State(state): State<ServiceState>,
    Path((biz, biz_id)): Path<(String, i64)>,
) -> Result<ControlResult<Interactive>, ServiceError> {
    let pool = Arc::clone(&state.pool);
    let counted = tokio::task::spawn_blocking(move || {
        interactive::incr_read_cnt(&*pool, &biz, biz_id)
    })
    .await
    .context("interactive write task failed")??;
    Ok(ControlResult::data(counted))
}

async fn interactive_show(
    State(state): State<ServiceState>,
    Path((biz, biz_id)): Path<(String, i64)>,
) -> Result<ControlResult<Interactive>, ServiceError> {
    let pool = Arc::clone(&state.pool);
    let found =
        tokio::task::spawn_blocking(move || interactive::find_by_biz(&*pool, &biz, biz_id))
            .await
            .context("interactive read task failed")??;
    Ok(ControlResult { code: 0, msg: OK_MSG.to_string(), data: found })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    /// Scratch directory for the service's database files, removed on drop.
    pub(crate) struct TempDb {
        dir: tempfile::TempDir,
    }

    impl TempDb {
        pub fn new() -> Result<Self> {
            Ok(Self { dir: tempfile::Builder::new().prefix("migrator-service-").tempdir()? })
        }

        pub fn path(&self, file: &str) -> PathBuf {
            self.dir.path().join(file)
        }
    }

    struct Fixture {
        _db: TempDb,
        runtime: Runtime,
    }

    fn fixture() -> Result<Fixture> {
        let db = TempDb::new()?;
        let config = ServiceConfig {
            src_db: db.path("src.sqlite3"),
            dst_db: db.path("dst.sqlite3"),
            outbox_db: db.path("outbox.sqlite3"),
            ..ServiceConfig::default()
        };
        let runtime = build(&config)?;
        Ok(Fixture { _db: db, runtime })
    }

    async fn call(router: Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn status_of(router: Router) -> Value {
        let response = call(router, "GET", "/status", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        response_json(response).await["data"].clone()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() -> Result<()> {
        let fx = fixture()?;
        let response = call(app(fx.runtime.state.clone()), "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!({ "status": "ok" }));
        Ok(())
    }

    #[tokio::test]
    async fn pattern_routes_switch_the_write_pattern() -> Result<()> {
        let fx = fixture()?;
        let router = app(fx.runtime.state.clone());
        assert_eq!(status_of(router.clone()).await["pattern"], "src_only");

        for (uri, pattern) in [
            ("/src_first", Pattern::SrcFirst),
            ("/dst_first", Pattern::DstFirst),
            ("/dst_only", Pattern::DstOnly),
            ("/src_only", Pattern::SrcOnly),
        ] {
            let response = call(router.clone(), "POST", uri, None).await;
            assert_eq!(response.status(), StatusCode::OK);
            let body = response_json(response).await;
            assert_eq!(body, serde_json::json!({ "code": 0, "msg": "OK" }));
            assert_eq!(status_of(router.clone()).await["pattern"], pattern.as_str());
            assert_eq!(fx.runtime.state.pool.pattern()?, pattern);
        }
        Ok(())
    }

    #[tokio::test]
    async fn full_validation_can_be_started_and_stopped() -> Result<()> {
        let fx = fixture()?;
        let router = app(fx.runtime.state.clone());

        let started = call(router.clone(), "POST", "/full/start", None).await;
        assert_eq!(response_json(started).await["msg"], "OK");
        let stopped = call(router.clone(), "POST", "/full/stop", None).await;
        assert_eq!(response_json(stopped).await["msg"], "OK");

        for _ in 0..500 {
            if status_of(router.clone()).await["full_running"] == false {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("full validation still running after stop");
    }

    #[tokio::test]
    async fn incremental_start_acknowledges_with_its_own_message() -> Result<()> {
        let fx = fixture()?;
        let router = app(fx.runtime.state.clone());

        let body = serde_json::json!({ "update_time": 0, "interval": 50 });
        let response = call(router.clone(), "POST", "/incr/start", Some(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response_json(response).await,
            serde_json::json!({ "code": 0, "msg": INCR_STARTED_MSG })
        );
        assert_eq!(status_of(router.clone()).await["incr_running"], true);

        let stopped = call(router.clone(), "POST", "/incr/stop", None).await;
        assert_eq!(response_json(stopped).await["msg"], "OK");
        assert_eq!(status_of(router).await["incr_running"], false);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_incremental_request_is_rejected() -> Result<()> {
        let fx = fixture()?;
        let router = app(fx.runtime.state.clone());

        let body = serde_json::json!({ "update_time": "yesterday" });
        let response = call(router.clone(), "POST", "/incr/start", Some(body)).await;
        assert!(response.status().is_client_error());
        assert_eq!(status_of(router).await["incr_running"], false);
        Ok(())
    }

    #[tokio::test]
    async fn demo_reads_are_double_written_once_enabled() -> Result<()> {
        let fx = fixture()?;
        let router = app(fx.runtime.state.clone());

        call(router.clone(), "POST", "/interactive/article/1/read", None).await;
        assert!(interactive::find_by_biz(&*fx.runtime.dst, "article", 1)?.is_none());

        call(router.clone(), "POST", "/src_first", None).await;
        let response = call(router.clone(), "POST", "/interactive/article/1/read", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["data"]["read_cnt"], 2);
        call(router.clone(), "POST", "/interactive/article/2/read", None).await;

        let shown = call(router, "GET", "/interactive/article/2", None).await;
        assert_eq!(response_json(shown).await["data"]["id"], 2);
        let in_dst = interactive::find_by_biz(&*fx.runtime.dst, "article", 2)?;
        assert_eq!(in_dst.map(|row| (row.id, row.read_cnt)), Some((2, 1)));
        assert!(interactive::find_by_biz(&*fx.runtime.dst, "article", 1)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn control_results_are_counted_by_endpoint_and_code() -> Result<()> {
        let handle = crate::metrics::init_metrics();
        let fx = fixture()?;
        let router = app(fx.runtime.state.clone());

        call(router.clone(), "POST", "/dst_first", None).await;
        call(router.clone(), "POST", "/dst_first", None).await;
        call(router.clone(), "GET", "/health", None).await;

        let rendered = handle.render();
        let lines: Vec<&str> = rendered
            .lines()
            .filter(|line| line.starts_with(crate::metrics::CONTROL_RESULTS))
            .collect();
        assert!(lines
            .iter()
            .any(|line| line.contains("endpoint=\"/dst_first\"") && line.contains("code=\"0\"")));
        assert!(lines.iter().all(|line| !line.contains("/health")));

        let response = call(router, "GET", "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => panic!("failed to read metrics body: {err}"),
        };
        assert!(body.contains(crate::metrics::CONTROL_RESULTS));
        Ok(())
    }

    #[test]
    fn failed_control_requests_carry_the_system_error_code() {
        let response = ServiceError(anyhow::anyhow!("store offline")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.extensions().get::<ResultCode>(),
            Some(&ResultCode(SYSTEM_ERROR_CODE))
        );
    }

    #[test]
    fn cli_flags_override_the_config_file() -> Result<()> {
        let args = Args::try_parse_from([
            "migrator-service",
            "--bind",
            "127.0.0.1:5000",
            "--log-format",
            "json",
        ])?;
        let config = args.into_config()?;
        assert_eq!(config.bind.port(), 5000);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.migrator.batch_size, 100);
        Ok(())
    }
}
