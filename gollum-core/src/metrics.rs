//! Prometheus-style metrics exposition, shared between producers via the
//! global `metrics` facade and served over HTTP by the coordinator.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router as AxumRouter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Binds a `TcpListener` on `bind` and serves `router` on it. Intended for
/// the router returned by [`setup_metrics_router`], with any extra routes
/// (liveness, readiness) added by the caller.
pub async fn serve(router: AxumRouter, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Builds a router exposing `/metrics` in Prometheus exposition format.
pub fn setup_metrics_router() -> AxumRouter {
    let recorder_handle = setup_metrics_recorder();

    AxumRouter::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request counts and latency for every route served
/// off the ambient HTTP surface (metrics, liveness, readiness).
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Names used consistently across producers so dashboards don't have to
/// special-case each flavor. Producer-specific metrics add a `producer`
/// label rather than inventing a new metric name per sink.
pub mod names {
    pub const MESSAGES_PRODUCED: &str = "messages_produced_total";
    pub const MESSAGES_DISCARDED: &str = "messages_discarded";
    pub const ROUTER_INPUT_FULL: &str = "router_input_full";
    pub const BATCH_FLUSH_SIZE: &str = "batch_flush_size";
    pub const ROTATIONS_TOTAL: &str = "rotations_total";
}
