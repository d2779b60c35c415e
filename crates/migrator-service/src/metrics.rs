//! Prometheus exporter and control result metrics.

use std::sync::OnceLock;

use axum::extract::{MatchedPath, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Control requests by endpoint and the `code` of their result body.
pub const CONTROL_RESULTS: &str = "migrator_control_results_total";

const UNMATCHED_ENDPOINT: &str = "unmatched";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Result code carried by a control response, read back by [`control_metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub i32);

/// Installs the Prometheus recorder and describes every metric.
///
/// Safe to call more than once; later calls return the same handle.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            if let Err(err) = metrics::set_global_recorder(recorder) {
                tracing::warn!(error = %err, "metrics recorder already installed");
            }

            describe_counter!(CONTROL_RESULTS, "Total control requests by result code");
            migrator_engine::metrics::register_metrics();

            tracing::info!("Prometheus metrics recorder initialized");
            handle
        })
        .clone()
}

#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn endpoint_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| UNMATCHED_ENDPOINT.to_string(), |path| path.as_str().to_string())
}

/// Counts every control response that carries a [`ResultCode`].
pub async fn control_metrics(request: Request, next: Next) -> Response {
    let endpoint = endpoint_label(&request);
    let response = next.run(request).await;

    if let Some(ResultCode(code)) = response.extensions().get::<ResultCode>().copied() {
        let labels = [("endpoint", endpoint), ("code", code.to_string())];
        counter!(CONTROL_RESULTS, &labels).increment(1);
    }
    response
}

pub async fn serve_metrics() -> impl IntoResponse {
    prometheus_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain; charset=utf-8")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| (StatusCode::OK, [("content-type", "text/plain; charset=utf-8")], handle.render()),
    )
}
